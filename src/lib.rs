pub mod config;
pub mod deepseek;
pub mod relay;
