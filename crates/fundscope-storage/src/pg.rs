use async_trait::async_trait;
use fundscope_core::StoredFund;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::{FundStore, StorageError, UserStore};

/// Postgres-backed fund and user store.
#[derive(Debug, Clone)]
pub struct PgFundStore {
    pool: PgPool,
}

impl PgFundStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl FundStore for PgFundStore {
    async fn upsert(&self, id: &str, data: &serde_json::Value) -> Result<(), StorageError> {
        // Single statement, so two writers racing on one id cannot both insert.
        sqlx::query(
            r#"
            INSERT INTO etfs (id, data, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            ON CONFLICT (id) DO UPDATE
               SET data = EXCLUDED.data,
                   updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(Json(data))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT id FROM etfs ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("id")?);
        }
        Ok(out)
    }

    async fn get(&self, id: &str) -> Result<StoredFund, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, data, created_at, updated_at
              FROM etfs
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(StorageError::NotFound(id.to_string()));
        };
        Ok(StoredFund {
            id: row.try_get("id")?,
            data: row.try_get("data")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl UserStore for PgFundStore {
    async fn user_exists(&self, username: &str, password_hash: &str) -> Result<bool, StorageError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM users WHERE username = $1 AND password = $2)",
        )
        .bind(username)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}
