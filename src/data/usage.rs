use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use uuid::Uuid;

use super::model::{TurnUsage, UsageRecord};

pub const CHAT_USAGE: &str = "chat";

/// Append-only accounting rows, one per completed assistant turn. Rows are
/// keyed to the conversation, not to the turn they account for.
#[derive(Clone)]
pub struct UsageRepository {
    pub pool: Arc<SqlitePool>,
}

impl UsageRepository {
    pub async fn record(
        &self,
        chat_id: Uuid,
        model_name: &str,
        usage_type: &str,
        usage: &TurnUsage,
        completed_at: DateTime<Utc>,
    ) -> sqlx::Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO usage_records
                (id, chat_id, model_name, usage_type, prompt_tokens, completion_tokens,
                 total_tokens, duration_seconds, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(id)
        .bind(chat_id)
        .bind(model_name)
        .bind(usage_type)
        .bind(usage.prompt_tokens)
        .bind(usage.completion_tokens)
        .bind(usage.total_tokens)
        .bind(usage.duration_seconds.to_string())
        .bind(completed_at)
        .execute(&*self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list_for_chat(&self, chat_id: Uuid) -> sqlx::Result<Vec<UsageRecord>> {
        sqlx::query_as::<_, UsageRecord>(
            "SELECT * FROM usage_records WHERE chat_id = ?
             ORDER BY julianday(completed_at) ASC, rowid ASC",
        )
        .bind(chat_id)
        .fetch_all(&*self.pool)
        .await
    }
}
