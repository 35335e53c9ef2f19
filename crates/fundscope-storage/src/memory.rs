use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use fundscope_core::StoredFund;
use tokio::sync::RwLock;

use crate::{FundStore, StorageError, UserStore};

/// In-process store with the same upsert semantics as [`crate::PgFundStore`].
/// Backs `sync --dry-run` and tests.
#[derive(Debug, Default)]
pub struct MemoryFundStore {
    funds: RwLock<BTreeMap<String, StoredFund>>,
    users: HashSet<(String, String)>,
}

impl MemoryFundStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user; `password_hash` is compared verbatim.
    pub fn with_user(mut self, username: impl Into<String>, password_hash: impl Into<String>) -> Self {
        self.users.insert((username.into(), password_hash.into()));
        self
    }

    pub async fn len(&self) -> usize {
        self.funds.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.funds.read().await.is_empty()
    }
}

#[async_trait]
impl FundStore for MemoryFundStore {
    async fn upsert(&self, id: &str, data: &serde_json::Value) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut funds = self.funds.write().await;
        funds
            .entry(id.to_string())
            .and_modify(|existing| {
                existing.data = data.clone();
                existing.updated_at = now;
            })
            .or_insert_with(|| StoredFund {
                id: id.to_string(),
                data: data.clone(),
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.funds.read().await.keys().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<StoredFund, StorageError> {
        self.funds
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl UserStore for MemoryFundStore {
    async fn user_exists(&self, username: &str, password_hash: &str) -> Result<bool, StorageError> {
        Ok(self
            .users
            .contains(&(username.to_string(), password_hash.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_same_identity_twice_keeps_one_record() {
        let store = MemoryFundStore::new();
        let payload = json!({"name": "SPY", "description": "S&P 500"});

        store.upsert("SPY", &payload).await.unwrap();
        let first = store.get("SPY").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.upsert("SPY", &payload).await.unwrap();
        let second = store.get("SPY").await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(first.data, second.data);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn upsert_replaces_payload_of_existing_identity() {
        let store = MemoryFundStore::new();
        store.upsert("XLK", &json!({"description": "old"})).await.unwrap();
        store.upsert("XLK", &json!({"description": "new"})).await.unwrap();
        let stored = store.get("XLK").await.unwrap();
        assert_eq!(stored.data["description"], "new");
    }

    #[tokio::test]
    async fn get_unknown_identity_is_not_found() {
        let store = MemoryFundStore::new();
        let err = store.get("NOPE").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(id) if id == "NOPE"));
    }

    #[tokio::test]
    async fn list_ids_is_sorted() {
        let store = MemoryFundStore::new();
        for id in ["XLK", "DIA", "SPY"] {
            store.upsert(id, &json!({})).await.unwrap();
        }
        assert_eq!(store.list_ids().await.unwrap(), vec!["DIA", "SPY", "XLK"]);
    }

    #[tokio::test]
    async fn users_match_on_name_and_hash() {
        let store = MemoryFundStore::new().with_user("admin", "abc123");
        assert!(store.user_exists("admin", "abc123").await.unwrap());
        assert!(!store.user_exists("admin", "wrong").await.unwrap());
        assert!(!store.user_exists("other", "abc123").await.unwrap());
    }
}
