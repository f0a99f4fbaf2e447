use std::{path::Path, sync::Arc};

use sqlx::sqlite::SqlitePool;
use tracing::info;

use super::model::AiModel;

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("could not read model seed: {0}")]
    Io(#[from] std::io::Error),
    #[error("model seed is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not store model: {0}")]
    Store(#[from] sqlx::Error),
}

const MODEL_COLUMNS: &str = "id, provider, name, endpoint, api_key, capability, is_active, \
                             system_prompt, max_tokens, temperature";

/// Read side of the AI model configuration table.
#[derive(Clone)]
pub struct ModelRepository {
    pub pool: Arc<SqlitePool>,
}

impl ModelRepository {
    pub async fn get_model(&self, model_id: &str) -> sqlx::Result<Option<AiModel>> {
        sqlx::query_as::<_, AiModel>(&format!("SELECT {MODEL_COLUMNS} FROM ai_models WHERE id = ?"))
            .bind(model_id)
            .fetch_optional(&*self.pool)
            .await
    }

    pub async fn list_active(&self) -> sqlx::Result<Vec<AiModel>> {
        sqlx::query_as::<_, AiModel>(&format!(
            "SELECT {MODEL_COLUMNS} FROM ai_models WHERE is_active = 1 ORDER BY name"
        ))
        .fetch_all(&*self.pool)
        .await
    }

    pub async fn upsert(&self, model: &AiModel) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ai_models
                (id, provider, name, endpoint, api_key, capability, is_active,
                 system_prompt, max_tokens, temperature)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                provider = excluded.provider,
                name = excluded.name,
                endpoint = excluded.endpoint,
                api_key = excluded.api_key,
                capability = excluded.capability,
                is_active = excluded.is_active,
                system_prompt = excluded.system_prompt,
                max_tokens = excluded.max_tokens,
                temperature = excluded.temperature;
            "#,
        )
        .bind(&model.id)
        .bind(&model.provider)
        .bind(&model.name)
        .bind(&model.endpoint)
        .bind(&model.api_key)
        .bind(&model.capability)
        .bind(model.is_active)
        .bind(&model.system_prompt)
        .bind(model.max_tokens)
        .bind(model.temperature)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Upserts every model in a JSON array of model configs.
    pub async fn seed_from_json(&self, raw: &str) -> Result<usize, SeedError> {
        let models: Vec<AiModel> = serde_json::from_str(raw)?;
        for model in &models {
            self.upsert(model).await?;
            info!(model_id = %model.id, active = model.is_active, "seeded model");
        }
        Ok(models.len())
    }

    pub async fn seed_from_file(&self, path: &Path) -> Result<usize, SeedError> {
        let raw = tokio::fs::read_to_string(path).await?;
        self.seed_from_json(&raw).await
    }
}
