use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::{mpsc, Notify};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use uuid::Uuid;

use crate::{
    ai::{CompletionEvent, CompletionProvider, CompletionRequest},
    config::Config,
    data::{
        self,
        model::{AiModel, Session, User},
        models::ModelRepository,
        repository::ChatRepository,
        session::{SessionRepository, UnlockCodeRepository},
        usage::UsageRepository,
    },
    pipeline::ChatPipeline,
    AppState,
};

/// A single-connection in-memory database; every pool gets its own.
pub async fn memory_pool() -> Arc<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    data::migrate(&pool).await.unwrap();
    Arc::new(pool)
}

pub async fn seed_user(pool: &SqlitePool, email: &str) -> Session {
    let user = User {
        id: Uuid::new_v4(),
        email: email.to_string(),
    };
    sqlx::query("INSERT INTO users (id, email, created_at) VALUES (?, ?, ?)")
        .bind(user.id)
        .bind(&user.email)
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();

    let token = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(&token)
        .bind(user.id)
        .bind(Utc::now())
        .bind(Utc::now() + Duration::days(1))
        .execute(pool)
        .await
        .unwrap();

    Session {
        token,
        user,
        unlocked: false,
    }
}

pub async fn seed_unlock_code(pool: &SqlitePool, code: &str, active: bool) {
    sqlx::query("INSERT INTO unlock_codes (code, is_active, created_at) VALUES (?, ?, ?)")
        .bind(code)
        .bind(active)
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
}

pub fn model_config(id: &str, endpoint: &str, active: bool) -> AiModel {
    AiModel {
        id: id.to_string(),
        provider: "openai".to_string(),
        name: "test-model".to_string(),
        endpoint: endpoint.to_string(),
        api_key: "test-key".to_string(),
        capability: "chat".to_string(),
        is_active: active,
        system_prompt: None,
        max_tokens: None,
        temperature: None,
    }
}

/// Plays back a fixed event script. A hanging provider keeps the stream open
/// after the script until it is cancelled, then signals `cancelled`.
pub struct ScriptedProvider {
    script: Vec<CompletionEvent>,
    hang: bool,
    pub cancelled: Arc<Notify>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<CompletionEvent>) -> Self {
        Self {
            script,
            hang: false,
            cancelled: Arc::new(Notify::new()),
        }
    }

    pub fn hanging(script: Vec<CompletionEvent>) -> Self {
        Self {
            hang: true,
            ..Self::new(script)
        }
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn stream_completion(
        &self,
        _request: CompletionRequest,
        sender: mpsc::Sender<CompletionEvent>,
        cancel: CancellationToken,
    ) {
        for event in self.script.clone() {
            if sender.send(event).await.is_err() {
                return;
            }
        }
        if self.hang {
            cancel.cancelled().await;
            self.cancelled.notify_one();
        }
    }
}

pub async fn test_pipeline(pool: &Arc<SqlitePool>, provider: ScriptedProvider) -> ChatPipeline {
    ChatPipeline {
        chats: ChatRepository { pool: pool.clone() },
        models: ModelRepository { pool: pool.clone() },
        usage: UsageRepository { pool: pool.clone() },
        provider: Arc::new(provider),
        default_system_prompt: Some("You are a helpful assistant.".to_string()),
        post_response: TaskTracker::new(),
    }
}

pub fn test_config() -> Config {
    Config::from_lookup(|key| match key {
        "DATABASE_PATH" => Some(":memory:".to_string()),
        _ => None,
    })
    .unwrap()
}

pub async fn test_state(pool: &Arc<SqlitePool>, provider: ScriptedProvider) -> Arc<AppState> {
    Arc::new(AppState {
        config: test_config(),
        chat_repo: ChatRepository { pool: pool.clone() },
        model_repo: ModelRepository { pool: pool.clone() },
        usage_repo: UsageRepository { pool: pool.clone() },
        session_repo: SessionRepository { pool: pool.clone() },
        unlock_repo: UnlockCodeRepository { pool: pool.clone() },
        pipeline: test_pipeline(pool, provider).await,
    })
}
