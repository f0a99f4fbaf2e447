use std::{sync::Arc, time::Instant};

use chrono::Utc;
use futures::{stream, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::{
    sync::{CancellationToken, DropGuard},
    task::TaskTracker,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    ai::{CompletionEvent, CompletionProvider, CompletionRequest},
    data::{
        model::{
            AiModel, Chat, ContentBlock, Message, NewMessage, PromptTurn, Role, Session, TurnUsage,
        },
        models::ModelRepository,
        repository::ChatRepository,
        usage::{UsageRepository, CHAT_USAGE},
    },
};

const TITLE_MAX_CHARS: usize = 80;
const EVENT_BUFFER: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("You do not own this chat")]
    OwnershipViolation,
    #[error("{0}")]
    BadRequest(String),
    #[error("Selected model not found")]
    ModelNotFound,
    #[error("Chat not found")]
    ChatNotFound,
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub conversation_id: Uuid,
    pub prior_turns: Vec<PromptTurn>,
    pub model_id: String,
}

/// Everything the streaming stage needs once the request has been accepted
/// and the user's turn is durable.
#[derive(Debug)]
pub struct PreparedChat {
    pub chat: Chat,
    pub user_message: Message,
    pub request: CompletionRequest,
}

/// What the caller's transport sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatStreamEvent {
    Text { delta: String },
    Reasoning { delta: String },
    Usage {
        model: String,
        #[serde(flatten)]
        usage: TurnUsage,
    },
    Error { message: String },
}

#[derive(Clone)]
pub struct ChatPipeline {
    pub chats: ChatRepository,
    pub models: ModelRepository,
    pub usage: UsageRepository,
    pub provider: Arc<dyn CompletionProvider>,
    pub default_system_prompt: Option<String>,
    pub post_response: TaskTracker,
}

impl ChatPipeline {
    /// Authenticates, resolves the chat and model, then persists the user's
    /// turn. Nothing is written unless every check passes.
    #[tracing::instrument(
        skip_all,
        fields(chat_id = %request.conversation_id, model_id = %request.model_id)
    )]
    pub async fn prepare(
        &self,
        session: Option<&Session>,
        request: ChatRequest,
    ) -> Result<PreparedChat, ChatError> {
        let session = session.ok_or(ChatError::Unauthorized)?;
        let user_id = session.user.id;

        let user_turn = request
            .prior_turns
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User && turn.has_content())
            .ok_or_else(|| ChatError::BadRequest("No user message found".to_string()))?;

        for turn in &request.prior_turns {
            if let Some(block) = turn.content.iter().find(|block| !turn.role.permits(block)) {
                return Err(ChatError::BadRequest(format!(
                    "{} turns cannot carry {} content",
                    turn.role.as_str(),
                    block.kind()
                )));
            }
        }

        let existing = self.chats.get_chat(request.conversation_id).await?;
        if let Some(chat) = &existing {
            if !chat.is_owned_by(user_id) {
                warn!(%user_id, "rejected chat request from non-owner");
                return Err(ChatError::OwnershipViolation);
            }
        }

        let model = self.resolve_model(&request.model_id, existing.as_ref()).await?;

        let chat = match existing {
            Some(chat) => chat,
            None => self.create_chat(request.conversation_id, user_id, user_turn).await?,
        };

        let user_message = self
            .chats
            .append_message(NewMessage::user(
                chat.id,
                user_turn.content.clone(),
                &model.id,
            ))
            .await?;
        debug!(message_id = %user_message.id, "user turn persisted");

        let system_prompt = model
            .system_prompt
            .clone()
            .or_else(|| self.default_system_prompt.clone());

        Ok(PreparedChat {
            chat,
            user_message,
            request: CompletionRequest {
                model,
                system_prompt,
                turns: request.prior_turns,
            },
        })
    }

    /// Creates the chat under the caller. An id that is already taken is
    /// either a concurrent first message or a deleted chat.
    async fn create_chat(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        first_turn: &PromptTurn,
    ) -> Result<Chat, ChatError> {
        let title = chat_title(first_turn);
        if let Some(chat) = self.chats.create_chat(chat_id, user_id, &title).await? {
            return Ok(chat);
        }

        match self.chats.get_chat(chat_id).await? {
            Some(chat) if chat.is_owned_by(user_id) => Ok(chat),
            Some(_) => Err(ChatError::OwnershipViolation),
            None => Err(ChatError::ChatNotFound),
        }
    }

    async fn resolve_model(
        &self,
        model_id: &str,
        existing: Option<&Chat>,
    ) -> Result<AiModel, ChatError> {
        let model = self
            .models
            .get_model(model_id)
            .await?
            .ok_or(ChatError::ModelNotFound)?;

        if model.is_active {
            return Ok(model);
        }

        // A deactivated model stays usable only in chats that already used it.
        match existing {
            Some(chat) if self.chats.chat_uses_model(chat.id, &model.id).await? => Ok(model),
            _ => Err(ChatError::ModelNotFound),
        }
    }

    /// Starts the provider call and returns the caller-facing event stream.
    ///
    /// Dropping the returned stream cancels the provider task. When the
    /// provider finishes successfully, persisting the assistant turn and the
    /// usage record is queued as a post-response task; its failures are only
    /// logged.
    pub fn stream(
        &self,
        prepared: PreparedChat,
    ) -> impl Stream<Item = ChatStreamEvent> + Send + 'static {
        let (sender, receiver) = mpsc::channel::<CompletionEvent>(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let model_id = prepared.request.model.id.clone();
        let model_name = prepared.request.model.name.clone();
        let provider = self.provider.clone();
        let provider_cancel = cancel.clone();
        let started = Instant::now();
        tokio::spawn(async move {
            provider
                .stream_completion(prepared.request, sender, provider_cancel)
                .await;
        });

        let state = StreamState {
            receiver: ReceiverStream::new(receiver),
            text: String::new(),
            reasoning: String::new(),
            started,
            done: false,
            _cancel_on_drop: cancel.drop_guard(),
            finalizer: Finalizer {
                pipeline: self.clone(),
                chat_id: prepared.chat.id,
                reply_to: prepared.user_message.id,
                model_id,
                model_name,
            },
        };

        stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            let event = match state.receiver.next().await {
                Some(CompletionEvent::Text(delta)) => {
                    state.text.push_str(&delta);
                    ChatStreamEvent::Text { delta }
                }
                Some(CompletionEvent::Reasoning(delta)) => {
                    state.reasoning.push_str(&delta);
                    ChatStreamEvent::Reasoning { delta }
                }
                Some(CompletionEvent::Finished(tokens)) => {
                    state.done = true;
                    let usage = TurnUsage::new(tokens, state.started.elapsed().as_secs_f64());
                    let content = assistant_content(&state.reasoning, &state.text);
                    state.finalizer.queue(content, usage.clone());
                    ChatStreamEvent::Usage {
                        model: state.finalizer.model_name.clone(),
                        usage,
                    }
                }
                Some(CompletionEvent::Failed(message)) => {
                    state.done = true;
                    warn!(
                        chat_id = %state.finalizer.chat_id,
                        %message,
                        "completion failed mid-stream"
                    );
                    ChatStreamEvent::Error { message }
                }
                None => {
                    state.done = true;
                    warn!(
                        chat_id = %state.finalizer.chat_id,
                        "completion stopped without a terminal event"
                    );
                    ChatStreamEvent::Error {
                        message: "The completion stopped unexpectedly".to_string(),
                    }
                }
            };
            Some((event, state))
        })
    }

    /// Waits for queued post-response writes.
    pub async fn drain(&self) {
        self.post_response.close();
        self.post_response.wait().await;
        self.post_response.reopen();
    }
}

struct StreamState {
    receiver: ReceiverStream<CompletionEvent>,
    text: String,
    reasoning: String,
    started: Instant,
    done: bool,
    _cancel_on_drop: DropGuard,
    finalizer: Finalizer,
}

struct Finalizer {
    pipeline: ChatPipeline,
    chat_id: Uuid,
    reply_to: Uuid,
    model_id: String,
    model_name: String,
}

impl Finalizer {
    fn queue(&self, content: Vec<ContentBlock>, usage: TurnUsage) {
        let chats = self.pipeline.chats.clone();
        let usage_repo = self.pipeline.usage.clone();
        let chat_id = self.chat_id;
        let reply_to = self.reply_to;
        let model_id = self.model_id.clone();
        let model_name = self.model_name.clone();

        self.pipeline.post_response.spawn(async move {
            let completed_at = Utc::now();

            let reply =
                NewMessage::assistant(chat_id, content, &model_id, &model_name, usage.clone());
            match chats.append_message(reply).await {
                Ok(message) => debug!(
                    %chat_id,
                    %reply_to,
                    message_id = %message.id,
                    "assistant turn persisted"
                ),
                Err(err) => error!(
                    %chat_id,
                    %reply_to,
                    error = %err,
                    "failed to persist assistant turn"
                ),
            }

            // Attempted even when the turn write failed.
            match usage_repo
                .record(chat_id, &model_name, CHAT_USAGE, &usage, completed_at)
                .await
            {
                Ok(_) => info!(
                    %chat_id,
                    model = %model_name,
                    total_tokens = usage.total_tokens,
                    duration_seconds = %usage.duration_seconds,
                    "usage recorded"
                ),
                Err(err) => error!(%chat_id, error = %err, "failed to record usage"),
            }
        });
    }
}

fn assistant_content(reasoning: &str, text: &str) -> Vec<ContentBlock> {
    let mut content = Vec::with_capacity(2);
    if !reasoning.is_empty() {
        content.push(ContentBlock::Reasoning {
            text: reasoning.to_string(),
        });
    }
    content.push(ContentBlock::text(text));
    content
}

fn chat_title(turn: &PromptTurn) -> String {
    match turn.first_text() {
        Some(text) => {
            let line = text.trim().lines().next().unwrap_or_default();
            line.chars().take(TITLE_MAX_CHARS).collect()
        }
        None => "New chat".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal::Decimal;

    use super::*;
    use crate::data::model::TokenUsage;
    use crate::test_support::{
        memory_pool, model_config, seed_user, test_pipeline, ScriptedProvider,
    };

    fn hello(chat_id: Uuid, model_id: &str) -> ChatRequest {
        ChatRequest {
            conversation_id: chat_id,
            prior_turns: vec![PromptTurn::user("hello")],
            model_id: model_id.to_string(),
        }
    }

    fn reply_with_usage() -> Vec<CompletionEvent> {
        vec![
            CompletionEvent::Text("Hi".to_string()),
            CompletionEvent::Text(" there".to_string()),
            CompletionEvent::Finished(TokenUsage::from_reported(Some(12), Some(34), None)),
        ]
    }

    async fn count(pool: &sqlx::SqlitePool, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_records_turns_and_usage() {
        let pool = memory_pool().await;
        let session = seed_user(&pool, "owner@test.com").await;
        let pipeline = test_pipeline(&pool, ScriptedProvider::new(reply_with_usage())).await;
        pipeline.models.upsert(&model_config("m1", "http://unused", true)).await.unwrap();

        let chat_id = Uuid::new_v4();
        let prepared = pipeline.prepare(Some(&session), hello(chat_id, "m1")).await.unwrap();
        assert_eq!(prepared.chat.title.as_deref(), Some("hello"));
        assert_eq!(
            prepared.request.system_prompt.as_deref(),
            Some("You are a helpful assistant.")
        );

        let events: Vec<ChatStreamEvent> = pipeline.stream(prepared).collect().await;
        assert_eq!(events[0], ChatStreamEvent::Text { delta: "Hi".to_string() });
        assert!(matches!(
            events.last(),
            Some(ChatStreamEvent::Usage { usage, .. }) if usage.total_tokens == 46
        ));

        pipeline.drain().await;

        let messages = pipeline.chats.list_messages(chat_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].model_id.as_deref(), Some("m1"));
        let assistant = &messages[1];
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.content, vec![ContentBlock::text("Hi there")]);
        assert_eq!(assistant.model.as_deref(), Some("test-model"));
        assert_eq!(assistant.model_id.as_deref(), Some("m1"));
        let usage = assistant.usage.as_ref().unwrap();
        assert_eq!(
            (usage.prompt_tokens, usage.completion_tokens, usage.total_tokens),
            (12, 34, 46)
        );
        assert!(usage.duration_seconds >= Decimal::ZERO);

        let records = pipeline.usage.list_for_chat(chat_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total_tokens, 46);
        assert_eq!(records[0].model_name, "test-model");
    }

    #[tokio::test]
    async fn test_reasoning_is_kept_on_the_assistant_turn() {
        let pool = memory_pool().await;
        let session = seed_user(&pool, "owner@test.com").await;
        let script = vec![
            CompletionEvent::Reasoning("plan".to_string()),
            CompletionEvent::Text("answer".to_string()),
            CompletionEvent::Finished(TokenUsage::default()),
        ];
        let pipeline = test_pipeline(&pool, ScriptedProvider::new(script)).await;
        pipeline.models.upsert(&model_config("m1", "http://unused", true)).await.unwrap();

        let chat_id = Uuid::new_v4();
        let prepared = pipeline.prepare(Some(&session), hello(chat_id, "m1")).await.unwrap();
        let events: Vec<ChatStreamEvent> = pipeline.stream(prepared).collect().await;
        assert_eq!(events[0], ChatStreamEvent::Reasoning { delta: "plan".to_string() });
        pipeline.drain().await;

        let messages = pipeline.chats.list_messages(chat_id).await.unwrap();
        assert_eq!(
            messages[1].content,
            vec![
                ContentBlock::Reasoning { text: "plan".to_string() },
                ContentBlock::text("answer")
            ]
        );
    }

    #[tokio::test]
    async fn test_inactive_model_is_rejected_without_writes() {
        let pool = memory_pool().await;
        let session = seed_user(&pool, "owner@test.com").await;
        let pipeline = test_pipeline(&pool, ScriptedProvider::new(reply_with_usage())).await;
        pipeline.models.upsert(&model_config("m1", "http://unused", false)).await.unwrap();

        let result = pipeline.prepare(Some(&session), hello(Uuid::new_v4(), "m1")).await;
        assert!(matches!(result, Err(ChatError::ModelNotFound)));

        let result = pipeline.prepare(Some(&session), hello(Uuid::new_v4(), "missing")).await;
        assert!(matches!(result, Err(ChatError::ModelNotFound)));

        assert_eq!(count(&pool, "messages").await, 0);
        assert_eq!(count(&pool, "chats").await, 0);
    }

    #[tokio::test]
    async fn test_deactivated_model_keeps_serving_its_chats() {
        let pool = memory_pool().await;
        let session = seed_user(&pool, "owner@test.com").await;
        let pipeline = test_pipeline(&pool, ScriptedProvider::new(reply_with_usage())).await;
        let mut model = model_config("m1", "http://unused", true);
        pipeline.models.upsert(&model).await.unwrap();

        let chat_id = Uuid::new_v4();
        let prepared = pipeline.prepare(Some(&session), hello(chat_id, "m1")).await.unwrap();
        let _: Vec<_> = pipeline.stream(prepared).collect().await;
        pipeline.drain().await;

        model.is_active = false;
        pipeline.models.upsert(&model).await.unwrap();

        assert!(pipeline.prepare(Some(&session), hello(chat_id, "m1")).await.is_ok());
        assert!(matches!(
            pipeline.prepare(Some(&session), hello(Uuid::new_v4(), "m1")).await,
            Err(ChatError::ModelNotFound)
        ));
    }

    #[tokio::test]
    async fn test_deactivated_model_is_matched_by_config_id() {
        let pool = memory_pool().await;
        let session = seed_user(&pool, "owner@test.com").await;
        let script = vec![CompletionEvent::Failed("upstream timed out".to_string())];
        let pipeline = test_pipeline(&pool, ScriptedProvider::new(script)).await;
        let mut model = model_config("m1", "http://unused", true);
        pipeline.models.upsert(&model).await.unwrap();
        // Same canonical name, different config.
        let twin = model_config("m2", "http://unused", false);
        pipeline.models.upsert(&twin).await.unwrap();

        let chat_id = Uuid::new_v4();
        let prepared = pipeline.prepare(Some(&session), hello(chat_id, "m1")).await.unwrap();
        let _: Vec<_> = pipeline.stream(prepared).collect().await;
        pipeline.drain().await;

        model.is_active = false;
        pipeline.models.upsert(&model).await.unwrap();

        // Only the user turn exists, and it still ties the chat to m1.
        assert!(pipeline.prepare(Some(&session), hello(chat_id, "m1")).await.is_ok());
        assert!(matches!(
            pipeline.prepare(Some(&session), hello(chat_id, "m2")).await,
            Err(ChatError::ModelNotFound)
        ));
    }

    #[tokio::test]
    async fn test_deleted_chat_id_is_not_reused() {
        let pool = memory_pool().await;
        let session = seed_user(&pool, "owner@test.com").await;
        let pipeline = test_pipeline(&pool, ScriptedProvider::new(reply_with_usage())).await;
        pipeline.models.upsert(&model_config("m1", "http://unused", true)).await.unwrap();

        let chat_id = Uuid::new_v4();
        pipeline.prepare(Some(&session), hello(chat_id, "m1")).await.unwrap();
        sqlx::query("UPDATE chats SET deleted_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(chat_id)
            .execute(&*pool)
            .await
            .unwrap();

        assert!(matches!(
            pipeline.prepare(Some(&session), hello(chat_id, "m1")).await,
            Err(ChatError::ChatNotFound)
        ));
        assert_eq!(count(&pool, "messages").await, 1);
    }

    #[tokio::test]
    async fn test_first_messages_racing_for_one_id() {
        let pool = memory_pool().await;
        let owner = seed_user(&pool, "owner@test.com").await;
        let intruder = seed_user(&pool, "intruder@test.com").await;
        let pipeline = test_pipeline(&pool, ScriptedProvider::new(reply_with_usage())).await;
        pipeline.models.upsert(&model_config("m1", "http://unused", true)).await.unwrap();

        let chat_id = Uuid::new_v4();
        let (first, second) = tokio::join!(
            pipeline.prepare(Some(&owner), hello(chat_id, "m1")),
            pipeline.prepare(Some(&owner), hello(chat_id, "m1")),
        );
        assert_eq!(first.unwrap().chat.id, chat_id);
        assert_eq!(second.unwrap().chat.id, chat_id);
        assert_eq!(count(&pool, "chats").await, 1);
        assert_eq!(count(&pool, "messages").await, 2);

        // Losing the insert to someone else's chat is still an ownership failure.
        let turn = PromptTurn::user("hello");
        assert!(matches!(
            pipeline.create_chat(chat_id, intruder.user.id, &turn).await,
            Err(ChatError::OwnershipViolation)
        ));
        let chat = pipeline.create_chat(chat_id, owner.user.id, &turn).await.unwrap();
        assert!(chat.is_owned_by(owner.user.id));
    }

    #[tokio::test]
    async fn test_rejections_before_streaming() {
        let pool = memory_pool().await;
        let owner = seed_user(&pool, "owner@test.com").await;
        let intruder = seed_user(&pool, "intruder@test.com").await;
        let pipeline = test_pipeline(&pool, ScriptedProvider::new(reply_with_usage())).await;
        pipeline.models.upsert(&model_config("m1", "http://unused", true)).await.unwrap();

        let chat_id = Uuid::new_v4();
        pipeline.prepare(Some(&owner), hello(chat_id, "m1")).await.unwrap();
        assert_eq!(count(&pool, "messages").await, 1);

        assert!(matches!(
            pipeline.prepare(None, hello(chat_id, "m1")).await,
            Err(ChatError::Unauthorized)
        ));
        assert!(matches!(
            pipeline.prepare(Some(&intruder), hello(chat_id, "m1")).await,
            Err(ChatError::OwnershipViolation)
        ));

        // Public chats are still read-only for everybody but the owner.
        pipeline
            .chats
            .set_visibility(chat_id, crate::data::model::Visibility::Public)
            .await
            .unwrap();
        assert!(matches!(
            pipeline.prepare(Some(&intruder), hello(chat_id, "m1")).await,
            Err(ChatError::OwnershipViolation)
        ));

        let no_user_turn = ChatRequest {
            conversation_id: Uuid::new_v4(),
            prior_turns: vec![PromptTurn::assistant("hi")],
            model_id: "m1".to_string(),
        };
        assert!(matches!(
            pipeline.prepare(Some(&owner), no_user_turn).await,
            Err(ChatError::BadRequest(_))
        ));

        assert_eq!(count(&pool, "messages").await, 1);
    }

    #[tokio::test]
    async fn test_provider_failure_keeps_user_turn() {
        let pool = memory_pool().await;
        let session = seed_user(&pool, "owner@test.com").await;
        let script = vec![
            CompletionEvent::Text("par".to_string()),
            CompletionEvent::Failed("provider responded with status 502 Bad Gateway".to_string()),
        ];
        let pipeline = test_pipeline(&pool, ScriptedProvider::new(script)).await;
        pipeline.models.upsert(&model_config("m1", "http://unused", true)).await.unwrap();

        let chat_id = Uuid::new_v4();
        let prepared = pipeline.prepare(Some(&session), hello(chat_id, "m1")).await.unwrap();
        let events: Vec<ChatStreamEvent> = pipeline.stream(prepared).collect().await;
        assert!(matches!(events.last(), Some(ChatStreamEvent::Error { .. })));
        pipeline.drain().await;

        let messages = pipeline.chats.list_messages(chat_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(count(&pool, "usage_records").await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_and_skips_finalizing() {
        let pool = memory_pool().await;
        let session = seed_user(&pool, "owner@test.com").await;
        let provider = ScriptedProvider::hanging(vec![CompletionEvent::Text("first".to_string())]);
        let cancelled = provider.cancelled.clone();
        let pipeline = test_pipeline(&pool, provider).await;
        pipeline.models.upsert(&model_config("m1", "http://unused", true)).await.unwrap();

        let chat_id = Uuid::new_v4();
        let prepared = pipeline.prepare(Some(&session), hello(chat_id, "m1")).await.unwrap();
        let mut events = Box::pin(pipeline.stream(prepared));
        assert_eq!(
            events.next().await,
            Some(ChatStreamEvent::Text { delta: "first".to_string() })
        );
        drop(events);

        tokio::time::timeout(Duration::from_secs(2), cancelled.notified())
            .await
            .expect("provider was not cancelled");
        pipeline.drain().await;

        let messages = pipeline.chats.list_messages(chat_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(count(&pool, "usage_records").await, 0);
    }

    #[tokio::test]
    async fn test_usage_store_failure_is_invisible_to_caller() {
        let pool = memory_pool().await;
        let session = seed_user(&pool, "owner@test.com").await;
        let pipeline = test_pipeline(&pool, ScriptedProvider::new(reply_with_usage())).await;
        pipeline.models.upsert(&model_config("m1", "http://unused", true)).await.unwrap();

        let chat_id = Uuid::new_v4();
        let prepared = pipeline.prepare(Some(&session), hello(chat_id, "m1")).await.unwrap();

        sqlx::query("ALTER TABLE usage_records RENAME TO usage_records_offline")
            .execute(&*pool)
            .await
            .unwrap();

        let events: Vec<ChatStreamEvent> = pipeline.stream(prepared).collect().await;
        assert_eq!(events.len(), 3);
        assert!(!events.iter().any(|e| matches!(e, ChatStreamEvent::Error { .. })));
        pipeline.drain().await;

        let messages = pipeline.chats.list_messages(chat_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].usage.as_ref().map(|u| u.total_tokens), Some(46));
        assert_eq!(count(&pool, "usage_records_offline").await, 0);
    }

    #[test]
    fn titles_use_the_first_line() {
        let turn = PromptTurn::user("  Plan next week's reels\nwith three hooks");
        assert_eq!(chat_title(&turn), "Plan next week's reels");

        let long = PromptTurn::user("x".repeat(200));
        assert_eq!(chat_title(&long).chars().count(), TITLE_MAX_CHARS);

        let empty = PromptTurn { role: Role::User, content: vec![] };
        assert_eq!(chat_title(&empty), "New chat");
    }

    #[test]
    fn stream_events_serialize_with_type_tags() {
        let event = ChatStreamEvent::Usage {
            model: "gpt-4o".to_string(),
            usage: TurnUsage::new(TokenUsage::from_reported(Some(1), Some(2), None), 0.25),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "usage");
        assert_eq!(value["totalTokens"], 3);
        assert_eq!(value["durationSeconds"], "0.250");
    }
}
