//! Builds the message list sent to the completion provider.
//!
//! The list is the chat's stored history (oldest first) followed by the new
//! utterance. Optionally a system preamble carrying the chat persona and the
//! standing instructions leads the list. Assembly only reads the store.

use std::sync::Arc;

use tracing::debug;

use crate::relay::store::{Store, StoreResult};
use crate::relay::turn::PromptMessage;

#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Keep only the newest `n` stored turns. `None` sends the whole history.
    pub history_limit: Option<usize>,
    /// Lead with a system message stating persona and instructions.
    pub persona_preamble: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            history_limit: None,
            persona_preamble: false,
        }
    }
}

/// Provider input for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub persona: String,
    /// Ends with the new utterance as a user message.
    pub messages: Vec<PromptMessage>,
}

pub struct ContextAssembler {
    store: Arc<dyn Store>,
    options: ContextOptions,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn Store>, options: ContextOptions) -> Self {
        Self { store, options }
    }

    pub fn assemble(
        &self,
        chat_id: i64,
        utterance: &str,
        persona_override: Option<&str>,
    ) -> StoreResult<AssembledContext> {
        let persona = match persona_override {
            Some(p) => p.to_string(),
            None => self.store.persona(chat_id)?,
        };

        let history = self.store.list_turns(chat_id, self.options.history_limit)?;

        let mut messages = Vec::with_capacity(history.len() + 2);
        if self.options.persona_preamble {
            let instructions = self.store.list_instructions()?;
            messages.push(PromptMessage::system(preamble(&persona, &instructions)));
        }
        messages.extend(history.iter().map(|turn| turn.to_prompt()));
        messages.push(PromptMessage::user(utterance));

        debug!(
            "Assembled context for chat {}: {} history turn(s), persona {:?}",
            chat_id,
            history.len(),
            persona
        );

        Ok(AssembledContext { persona, messages })
    }
}

fn preamble(persona: &str, instructions: &[String]) -> String {
    let mut s = format!("Responda sempre com uma personalidade {persona}.");
    if !instructions.is_empty() {
        s.push_str("\n\nInstruções permanentes:");
        for instruction in instructions {
            s.push_str("\n- ");
            s.push_str(instruction);
        }
    }
    s
}
