//! Relay module - forwards chat messages to the completion provider.

pub mod commands;
pub mod completion;
pub mod context;
pub mod database;
pub mod pipeline;
pub mod store;
pub mod turn;

pub use commands::{Command, Invoker};
pub use completion::{Completion, FALLBACK_REPLY};
pub use context::{AssembledContext, ContextAssembler, ContextOptions};
pub use database::{BOOTSTRAP_MODERATOR_ID, Database};
pub use pipeline::Pipeline;
pub use store::{NullStore, Store, StoreError};
