use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use uuid::Uuid;

use super::model::{Session, User};

/// Sessions are issued by the identity provider; this service only reads them
/// and persists the per-session unlock flag.
#[derive(Clone)]
pub struct SessionRepository {
    pub pool: Arc<SqlitePool>,
}

impl SessionRepository {
    pub async fn find_active(&self, token: &str) -> sqlx::Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT sessions.token, sessions.unlocked, users.id, users.email
            FROM sessions JOIN users ON users.id = sessions.user_id
            WHERE sessions.token = ? AND julianday(sessions.expires_at) > julianday(?)
            "#,
        )
        .bind(token)
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await?;

        row.map(|row| -> sqlx::Result<Session> {
            Ok(Session {
                token: row.try_get("token")?,
                unlocked: row.try_get("unlocked")?,
                user: User {
                    id: row.try_get::<Uuid, _>("id")?,
                    email: row.try_get("email")?,
                },
            })
        })
        .transpose()
    }

    pub async fn save_unlock(&self, session: &Session) -> sqlx::Result<()> {
        sqlx::query("UPDATE sessions SET unlocked = ? WHERE token = ?")
            .bind(session.unlocked)
            .bind(&session.token)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct UnlockCodeRepository {
    pub pool: Arc<SqlitePool>,
}

impl UnlockCodeRepository {
    pub async fn is_valid(&self, code: &str) -> sqlx::Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM unlock_codes WHERE code = ? AND is_active = 1")
                .bind(code.trim())
                .fetch_optional(&*self.pool)
                .await?;
        Ok(found.is_some())
    }
}
