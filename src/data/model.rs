use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, types::Json, FromRow, Row};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
}

/// An authenticated caller. The unlock flag lives on the session rather than
/// in any process-wide state and is written back through `SessionRepository`.
#[derive(Debug, Serialize, Clone)]
pub struct Session {
    #[serde(skip)]
    pub token: String,
    pub user: User,
    pub unlocked: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
}

#[derive(Debug, Serialize, Deserialize, Clone, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: Option<String>,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Chat {
    pub fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.user_id == user_id
    }

    /// Read-only access: the owner always, anyone else only on public chats.
    pub fn readable_by(&self, user_id: Option<Uuid>) -> bool {
        self.visibility == Visibility::Public || user_id.is_some_and(|id| self.is_owned_by(id))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Which block kinds a turn with this role may carry.
    pub fn permits(&self, block: &ContentBlock) -> bool {
        match (self, block) {
            (_, ContentBlock::Text { .. }) => true,
            (Role::User, ContentBlock::Image { .. }) => true,
            (Role::Assistant, ContentBlock::Reasoning { .. }) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ContentBlock::Text { .. } => "text",
            ContentBlock::Reasoning { .. } => "reasoning",
            ContentBlock::Image { .. } => "image",
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ContentBlock::Text { text } | ContentBlock::Reasoning { text } => {
                text.trim().is_empty()
            }
            ContentBlock::Image { url, .. } => url.is_empty(),
        }
    }
}

/// A turn as the client sends it and as the provider receives it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PromptTurn {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl PromptTurn {
    pub fn user(text: impl Into<String>) -> Self {
        PromptTurn {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        PromptTurn {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn has_content(&self) -> bool {
        self.content.iter().any(|block| !block.is_empty())
    }

    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|block| match block {
            ContentBlock::Text { text } if !text.trim().is_empty() => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Token counts as reported by a provider at the end of a stream.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl TokenUsage {
    /// A missing total is derived only when both prompt and completion were
    /// reported. Anything else missing counts as zero.
    pub fn from_reported(prompt: Option<i64>, completion: Option<i64>, total: Option<i64>) -> Self {
        let total_tokens = total.unwrap_or_else(|| match (prompt, completion) {
            (Some(prompt), Some(completion)) => prompt + completion,
            _ => 0,
        });
        TokenUsage {
            prompt_tokens: prompt.unwrap_or(0),
            completion_tokens: completion.unwrap_or(0),
            total_tokens,
        }
    }
}

/// Usage attached to a completed assistant turn.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TurnUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub duration_seconds: Decimal,
}

impl TurnUsage {
    pub fn new(tokens: TokenUsage, elapsed_seconds: f64) -> Self {
        TurnUsage {
            prompt_tokens: tokens.prompt_tokens,
            completion_tokens: tokens.completion_tokens,
            total_tokens: tokens.total_tokens,
            duration_seconds: seconds_to_decimal(elapsed_seconds),
        }
    }
}

/// Widens an in-memory float measurement to an exact millisecond-scale decimal.
pub fn seconds_to_decimal(seconds: f64) -> Decimal {
    let mut duration = Decimal::from_f64_retain(seconds)
        .unwrap_or_default()
        .round_dp(3);
    duration.rescale(3);
    duration
}

pub(crate) fn decode_decimal(row: &SqliteRow, column: &str) -> sqlx::Result<Option<Decimal>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        value.parse::<Decimal>().map_err(|e| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(e),
        })
    })
    .transpose()
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    /// Config id the turn was generated with, or requested for on user turns.
    pub model_id: Option<String>,
    pub model: Option<String>,
    pub usage: Option<TurnUsage>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Message {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        let Json(content): Json<Vec<ContentBlock>> = row.try_get("content")?;
        let prompt_tokens: Option<i64> = row.try_get("prompt_tokens")?;
        let completion_tokens: Option<i64> = row.try_get("completion_tokens")?;
        let total_tokens: Option<i64> = row.try_get("total_tokens")?;
        let duration = decode_decimal(row, "duration_seconds")?;

        let usage = match (prompt_tokens, completion_tokens, total_tokens, duration) {
            (
                Some(prompt_tokens),
                Some(completion_tokens),
                Some(total_tokens),
                Some(duration_seconds),
            ) => Some(TurnUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens,
                duration_seconds,
            }),
            _ => None,
        };

        Ok(Message {
            id: row.try_get("id")?,
            chat_id: row.try_get("chat_id")?,
            role: row.try_get("role")?,
            content,
            model_id: row.try_get("model_id")?,
            model: row.try_get("model")?,
            usage,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: Uuid,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub model_id: Option<String>,
    pub model: Option<String>,
    pub usage: Option<TurnUsage>,
}

impl NewMessage {
    pub fn user(chat_id: Uuid, content: Vec<ContentBlock>, model_id: &str) -> Self {
        NewMessage {
            chat_id,
            role: Role::User,
            content,
            model_id: Some(model_id.to_string()),
            model: None,
            usage: None,
        }
    }

    pub fn assistant(
        chat_id: Uuid,
        content: Vec<ContentBlock>,
        model_id: &str,
        model_name: &str,
        usage: TurnUsage,
    ) -> Self {
        NewMessage {
            chat_id,
            role: Role::Assistant,
            content,
            model_id: Some(model_id.to_string()),
            model: Some(model_name.to_string()),
            usage: Some(usage),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AiModel {
    pub id: String,
    pub provider: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_capability")]
    pub capability: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

fn default_capability() -> String {
    "chat".to_string()
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub model_name: String,
    pub usage_type: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub duration_seconds: Decimal,
    pub completed_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for UsageRecord {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        let duration_seconds =
            decode_decimal(row, "duration_seconds")?.ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "duration_seconds".to_string(),
                source: "duration_seconds is null".into(),
            })?;

        Ok(UsageRecord {
            id: row.try_get("id")?,
            chat_id: row.try_get("chat_id")?,
            model_name: row.try_get("model_name")?,
            usage_type: row.try_get("usage_type")?,
            prompt_tokens: row.try_get("prompt_tokens")?,
            completion_tokens: row.try_get("completion_tokens")?,
            total_tokens: row.try_get("total_tokens")?,
            duration_seconds,
            completed_at: row.try_get("completed_at")?,
        })
    }
}
