pub mod model;
pub mod models;
pub mod repository;
pub mod session;
pub mod usage;

use sqlx::{migrate::MigrateError, sqlite::SqlitePool};

pub async fn migrate(pool: &SqlitePool) -> Result<(), MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
