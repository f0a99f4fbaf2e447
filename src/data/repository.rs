use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::types::Json;
use uuid::Uuid;

use super::model::{Chat, Message, NewMessage, Visibility};

#[derive(Clone)]
pub struct ChatRepository {
    pub pool: Arc<SqlitePool>,
}

impl ChatRepository {
    pub async fn get_chat(&self, chat_id: Uuid) -> sqlx::Result<Option<Chat>> {
        sqlx::query_as::<_, Chat>(
            "SELECT id, user_id, title, visibility, created_at, deleted_at
             FROM chats WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(chat_id)
        .fetch_optional(&*self.pool)
        .await
    }

    pub async fn get_all_chats(&self, user_id: Uuid) -> sqlx::Result<Vec<Chat>> {
        sqlx::query_as::<_, Chat>(
            "SELECT id, user_id, title, visibility, created_at, deleted_at
             FROM chats WHERE user_id = ? AND deleted_at IS NULL
             ORDER BY julianday(created_at) DESC, rowid DESC",
        )
        .bind(user_id)
        .fetch_all(&*self.pool)
        .await
    }

    /// Returns `None` when the id is already taken, including by a
    /// soft-deleted chat.
    pub async fn create_chat(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        title: &str,
    ) -> sqlx::Result<Option<Chat>> {
        sqlx::query_as::<_, Chat>(
            r#"
            INSERT INTO chats (id, user_id, title, visibility, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            RETURNING id, user_id, title, visibility, created_at, deleted_at;
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(title)
        .bind(Visibility::Private)
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
    }

    /// Hard delete. Messages and usage rows go with it through the foreign keys.
    pub async fn delete_chat(&self, chat_id: Uuid) -> sqlx::Result<u64> {
        let rows_affected = sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(chat_id)
            .execute(&*self.pool)
            .await?
            .rows_affected();
        Ok(rows_affected)
    }

    pub async fn set_visibility(&self, chat_id: Uuid, visibility: Visibility) -> sqlx::Result<u64> {
        let rows_affected =
            sqlx::query("UPDATE chats SET visibility = ? WHERE id = ? AND deleted_at IS NULL")
                .bind(visibility)
                .bind(chat_id)
                .execute(&*self.pool)
                .await?
                .rows_affected();
        Ok(rows_affected)
    }

    pub async fn append_message(&self, message: NewMessage) -> sqlx::Result<Message> {
        let usage = message.usage.as_ref();

        sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages
                (id, chat_id, role, content, model_id, model,
                 prompt_tokens, completion_tokens, total_tokens, duration_seconds, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *;
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(message.chat_id)
        .bind(message.role)
        .bind(Json(&message.content))
        .bind(message.model_id.as_deref())
        .bind(message.model.as_deref())
        .bind(usage.map(|u| u.prompt_tokens))
        .bind(usage.map(|u| u.completion_tokens))
        .bind(usage.map(|u| u.total_tokens))
        .bind(usage.map(|u| u.duration_seconds.to_string()))
        .bind(Utc::now())
        .fetch_one(&*self.pool)
        .await
    }

    /// Turns in creation order. Holds no cursor, so callers can re-read at will.
    pub async fn list_messages(&self, chat_id: Uuid) -> sqlx::Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE chat_id = ?
             ORDER BY julianday(created_at) ASC, rowid ASC",
        )
        .bind(chat_id)
        .fetch_all(&*self.pool)
        .await
    }

    /// Whether any turn in the chat was sent to, or answered by, this model config.
    pub async fn chat_uses_model(&self, chat_id: Uuid, model_id: &str) -> sqlx::Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM messages WHERE chat_id = ? AND model_id = ? LIMIT 1")
                .bind(chat_id)
                .bind(model_id)
                .fetch_optional(&*self.pool)
                .await?;
        Ok(found.is_some())
    }
}
