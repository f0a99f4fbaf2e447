use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tokio_util::task::TaskTracker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use std::{sync::Arc, time::Duration};

mod ai;
use ai::OpenAiCompatibleProvider;
mod config;
use config::Config;
mod data;
use data::{
    models::ModelRepository,
    repository::ChatRepository,
    session::{SessionRepository, UnlockCodeRepository},
    usage::UsageRepository,
};
mod middleware;
mod pipeline;
use pipeline::ChatPipeline;
mod router;
use router::build_app;
#[cfg(test)]
mod test_support;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub chat_repo: ChatRepository,
    pub model_repo: ModelRepository,
    pub usage_repo: UsageRepository,
    pub session_repo: SessionRepository,
    pub unlock_repo: UnlockCodeRepository,
    pub pipeline: ChatPipeline,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "studio_chat=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().expect("invalid configuration");

    let options = SqliteConnectOptions::new()
        .filename(&config.database_path)
        .journal_mode(SqliteJournalMode::Wal)
        .create_if_missing(true);

    // setup connection pool
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(3))
        .connect_with(options)
        .await
        .expect("can't connect to database");

    data::migrate(&pool).await.expect("can't run migrations");

    let pool = Arc::new(pool);

    let model_repo = ModelRepository { pool: pool.clone() };
    if let Some(seed) = &config.models_seed {
        let count = model_repo
            .seed_from_file(seed)
            .await
            .expect("can't seed models");
        tracing::info!(count, path = %seed.display(), "model seed applied");
    }

    let provider = OpenAiCompatibleProvider::new(config.provider_connect_timeout)
        .expect("can't build provider client");

    let chat_repo = ChatRepository { pool: pool.clone() };
    let usage_repo = UsageRepository { pool: pool.clone() };
    let pipeline = ChatPipeline {
        chats: chat_repo.clone(),
        models: model_repo.clone(),
        usage: usage_repo.clone(),
        provider: Arc::new(provider),
        default_system_prompt: config.default_system_prompt.clone(),
        post_response: TaskTracker::new(),
    };

    let state = AppState {
        config: config.clone(),
        chat_repo,
        model_repo,
        usage_repo,
        session_repo: SessionRepository { pool: pool.clone() },
        unlock_repo: UnlockCodeRepository { pool: pool.clone() },
        pipeline: pipeline.clone(),
    };
    let app = build_app(Arc::new(state));

    tracing::debug!("listening on {}", config.bind_addr);
    axum::Server::bind(&config.bind_addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Let in-flight assistant turns and usage records land before exiting.
    pipeline.drain().await;
    pool.close().await;
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
