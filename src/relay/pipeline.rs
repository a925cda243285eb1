//! Conversation pipeline: assemble context, call the provider, persist the exchange.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::relay::completion::Completion;
use crate::relay::context::{ContextAssembler, ContextOptions};
use crate::relay::store::{Store, StoreResult};
use crate::relay::turn::ConversationTurn;

pub struct Pipeline<C> {
    store: Arc<dyn Store>,
    assembler: ContextAssembler,
    completion: C,
    /// One lock per chat so turns of the same chat never interleave.
    chat_locks: std::sync::Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl<C: Completion> Pipeline<C> {
    pub fn new(store: Arc<dyn Store>, completion: C, options: ContextOptions) -> Self {
        Self {
            assembler: ContextAssembler::new(store.clone(), options),
            store,
            completion,
            chat_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn chat_lock(&self, chat_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self
            .chat_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(chat_id).or_default().clone()
    }

    /// Drop the chat's lock from the map once no other turn holds or awaits it.
    fn release_chat_lock(&self, chat_id: i64, lock: &Arc<Mutex<()>>) {
        let mut locks = self
            .chat_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Clones are only handed out under the map lock, so two means map + caller
        if Arc::strong_count(lock) == 2 {
            locks.remove(&chat_id);
        }
    }

    /// Relay one user message and return the reply to send back.
    ///
    /// The user turn is stored after the context is assembled, so the
    /// utterance appears in the provider input exactly once. The reply is
    /// stored as an assistant turn even when it is the fallback text.
    pub async fn handle_turn(
        &self,
        chat_id: i64,
        user_id: i64,
        username: &str,
        utterance: &str,
    ) -> StoreResult<String> {
        let lock = self.chat_lock(chat_id);
        let result = {
            let _guard = lock.lock().await;
            self.relay_turn(chat_id, user_id, username, utterance).await
        };
        self.release_chat_lock(chat_id, &lock);
        result
    }

    async fn relay_turn(
        &self,
        chat_id: i64,
        user_id: i64,
        username: &str,
        utterance: &str,
    ) -> StoreResult<String> {
        info!(
            "📨 {} ({}) in {}: \"{}\"",
            username,
            user_id,
            chat_id,
            utterance.chars().take(50).collect::<String>()
        );

        let context = self.assembler.assemble(chat_id, utterance, None)?;
        self.store
            .append_turn(&ConversationTurn::from_user(chat_id, user_id, username, utterance))?;

        let reply = self.completion.complete(&context.messages).await;

        self.store
            .append_turn(&ConversationTurn::from_assistant(chat_id, &reply))?;

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::completion::FALLBACK_REPLY;
    use crate::relay::database::{BOOTSTRAP_MODERATOR_ID, Database};
    use crate::relay::store::{NullStore, StoreError};
    use crate::relay::turn::{BOT_USER_ID, PromptMessage, Role, UserRecord};

    /// Returns a fixed reply and records every prompt it was given.
    struct StubCompletion {
        reply: String,
        seen: std::sync::Mutex<Vec<Vec<PromptMessage>>>,
    }

    impl StubCompletion {
        fn replying(reply: &str) -> Self {
            Self { reply: reply.to_string(), seen: std::sync::Mutex::new(Vec::new()) }
        }

        fn prompts(&self) -> Vec<Vec<PromptMessage>> {
            self.seen.lock().unwrap().clone()
        }
    }

    /// Reads like an empty store; every write fails.
    struct FailingStore;

    impl Store for FailingStore {
        fn append_turn(&self, _: &ConversationTurn) -> StoreResult<()> {
            Err(StoreError::Poisoned)
        }
        fn list_turns(&self, _: i64, _: Option<usize>) -> StoreResult<Vec<ConversationTurn>> {
            Ok(Vec::new())
        }
        fn find_persona(&self, _: i64) -> StoreResult<Option<String>> {
            Ok(None)
        }
        fn set_persona(&self, _: i64, _: &str) -> StoreResult<()> {
            Err(StoreError::Poisoned)
        }
        fn find_user(&self, _: i64) -> StoreResult<Option<UserRecord>> {
            Ok(None)
        }
        fn set_moderator(&self, _: i64, _: bool) -> StoreResult<()> {
            Err(StoreError::Poisoned)
        }
        fn set_treatment_score(&self, _: i64, _: i64) -> StoreResult<()> {
            Err(StoreError::Poisoned)
        }
        fn set_user_info(&self, _: i64, _: &str, _: &str) -> StoreResult<()> {
            Err(StoreError::Poisoned)
        }
        fn add_instruction(&self, _: &str) -> StoreResult<()> {
            Err(StoreError::Poisoned)
        }
        fn list_instructions(&self) -> StoreResult<Vec<String>> {
            Ok(Vec::new())
        }
        fn remove_instruction(&self, _: &str) -> StoreResult<bool> {
            Err(StoreError::Poisoned)
        }
    }

    fn open_locks<C>(pipeline: &Pipeline<C>) -> usize {
        pipeline.chat_locks.lock().unwrap().len()
    }

    impl Completion for StubCompletion {
        async fn complete(&self, messages: &[PromptMessage]) -> String {
            self.seen.lock().unwrap().push(messages.to_vec());
            // Give other tasks a chance to run while this turn is in flight
            tokio::task::yield_now().await;
            self.reply.clone()
        }
    }

    impl Completion for Arc<StubCompletion> {
        async fn complete(&self, messages: &[PromptMessage]) -> String {
            self.as_ref().complete(messages).await
        }
    }

    fn bare() -> ContextOptions {
        ContextOptions { history_limit: None, persona_preamble: false }
    }

    #[tokio::test]
    async fn test_round_trip_persists_both_turns() {
        let db = Arc::new(Database::in_memory(BOOTSTRAP_MODERATOR_ID).unwrap());
        let stub = Arc::new(StubCompletion::replying("hi there"));
        let pipeline = Pipeline::new(db.clone(), stub.clone(), bare());

        let reply = pipeline.handle_turn(1, 7, "a", "hello").await.unwrap();
        assert_eq!(reply, "hi there");

        let turns = db.list_turns(1, None).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!((turns[0].role, turns[0].user_id, turns[0].message_text.as_str()), (Role::User, 7, "hello"));
        assert_eq!(turns[0].username, "a");
        assert_eq!((turns[1].role, turns[1].user_id, turns[1].message_text.as_str()), (Role::Assistant, BOT_USER_ID, "hi there"));
        assert_eq!(turns[1].username, "bot");

        let prompts = stub.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0], vec![PromptMessage::user("hello")]);
    }

    #[tokio::test]
    async fn test_second_turn_sees_first_exchange_once() {
        let db = Arc::new(Database::in_memory(BOOTSTRAP_MODERATOR_ID).unwrap());
        let stub = Arc::new(StubCompletion::replying("ok"));
        let pipeline = Pipeline::new(db.clone(), stub.clone(), bare());

        pipeline.handle_turn(1, 7, "a", "first").await.unwrap();
        pipeline.handle_turn(1, 7, "a", "second").await.unwrap();

        let prompts = stub.prompts();
        let contents: Vec<&str> = prompts[1].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "ok", "second"]);
        assert_eq!(prompts[1].iter().filter(|m| m.content == "second").count(), 1);
        assert_eq!(db.list_turns(1, None).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_fallback_is_stored_as_assistant_turn() {
        let db = Arc::new(Database::in_memory(BOOTSTRAP_MODERATOR_ID).unwrap());
        let stub = StubCompletion::replying(FALLBACK_REPLY);
        let pipeline = Pipeline::new(db.clone(), stub, bare());

        let reply = pipeline.handle_turn(1, 7, "a", "hello").await.unwrap();
        assert_eq!(reply, FALLBACK_REPLY);

        let turns = db.list_turns(1, None).unwrap();
        assert_eq!(turns.last().unwrap().message_text, FALLBACK_REPLY);
        assert_eq!(turns.last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_chats_do_not_share_history() {
        let db = Arc::new(Database::in_memory(BOOTSTRAP_MODERATOR_ID).unwrap());
        let stub = Arc::new(StubCompletion::replying("ok"));
        let pipeline = Pipeline::new(db.clone(), stub.clone(), bare());

        pipeline.handle_turn(1, 7, "a", "in one").await.unwrap();
        pipeline.handle_turn(2, 8, "b", "in two").await.unwrap();

        assert_eq!(stub.prompts()[1], vec![PromptMessage::user("in two")]);
    }

    #[tokio::test]
    async fn test_concurrent_turns_in_same_chat_serialize() {
        let db = Arc::new(Database::in_memory(BOOTSTRAP_MODERATOR_ID).unwrap());
        let stub = Arc::new(StubCompletion::replying("ok"));
        let pipeline = Arc::new(Pipeline::new(db.clone(), stub.clone(), bare()));

        let a = {
            let p = pipeline.clone();
            tokio::spawn(async move { p.handle_turn(1, 7, "a", "one").await })
        };
        let b = {
            let p = pipeline.clone();
            tokio::spawn(async move { p.handle_turn(1, 8, "b", "two").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // The first turn yields inside the provider call with its user turn
        // already stored; the second must still see the whole exchange
        let mut sizes: Vec<usize> = stub.prompts().iter().map(|p| p.len()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 3]);
        assert_eq!(db.list_turns(1, None).unwrap().len(), 4);
        assert_eq!(open_locks(&pipeline), 0);
    }

    #[tokio::test]
    async fn test_chat_locks_are_released_after_turns() {
        let db = Arc::new(Database::in_memory(BOOTSTRAP_MODERATOR_ID).unwrap());
        let pipeline = Pipeline::new(db, StubCompletion::replying("ok"), bare());

        for chat_id in 0..100 {
            pipeline.handle_turn(chat_id, 7, "a", "hello").await.unwrap();
        }
        assert_eq!(open_locks(&pipeline), 0);
    }

    #[tokio::test]
    async fn test_chat_lock_released_when_store_fails() {
        let pipeline = Pipeline::new(Arc::new(FailingStore), StubCompletion::replying("ok"), bare());

        assert!(pipeline.handle_turn(1, 7, "a", "hello").await.is_err());
        assert_eq!(open_locks(&pipeline), 0);
    }

    #[tokio::test]
    async fn test_stateless_pipeline_still_replies() {
        let stub = Arc::new(StubCompletion::replying("hi"));
        let pipeline = Pipeline::new(Arc::new(NullStore), stub.clone(), bare());

        assert_eq!(pipeline.handle_turn(1, 7, "a", "one").await.unwrap(), "hi");
        assert_eq!(pipeline.handle_turn(1, 7, "a", "two").await.unwrap(), "hi");
        assert_eq!(stub.prompts()[1], vec![PromptMessage::user("two")]);
    }
}
