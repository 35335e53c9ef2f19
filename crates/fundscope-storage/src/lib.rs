//! Document fetching and fund storage gateways for fundscope.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fundscope_core::StoredFund;
use thiserror::Error;
use tracing::debug;

mod memory;
mod pg;

pub use memory::MemoryFundStore;
pub use pg::PgFundStore;

pub const CRATE_NAME: &str = "fundscope-storage";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading body of {url} failed: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Retrieves raw markup for an absolute URL. Implementations do not retry.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let body = resp.text().await.map_err(|source| FetchError::Body {
            url: url.to_string(),
            source,
        })?;
        debug!(url, bytes = body.len(), "fetched document");
        Ok(body)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("fund {0} not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Durable upsert-by-identity and read-by-identity for fund payloads.
#[async_trait]
pub trait FundStore: Send + Sync {
    /// Inserts `data` under `id` or replaces the payload of an existing row.
    /// `created_at` is set on insert only; `updated_at` on every call.
    async fn upsert(&self, id: &str, data: &serde_json::Value) -> Result<(), StorageError>;

    async fn list_ids(&self) -> Result<Vec<String>, StorageError>;

    async fn get(&self, id: &str) -> Result<StoredFund, StorageError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn user_exists(&self, username: &str, password_hash: &str) -> Result<bool, StorageError>;
}
