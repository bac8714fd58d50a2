use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;

/// A robot credential. Only the SHA-256 of the raw key is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RobotApiKey {
    pub id: Uuid,
    pub robot_id: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_revoked: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_used_ip: Option<IpAddr>,
}

impl RobotApiKey {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked && self.expires_at.map_or(true, |at| at > now)
    }
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn insert(&self, key: RobotApiKey) -> Result<()>;

    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<RobotApiKey>>;

    async fn record_usage(&self, key_id: Uuid, at: DateTime<Utc>, ip: Option<IpAddr>)
        -> Result<()>;

    /// Returns false if the key does not exist.
    async fn revoke(&self, key_id: Uuid) -> Result<bool>;

    async fn list_for_robot(&self, robot_id: &str) -> Result<Vec<RobotApiKey>>;
}

#[derive(Debug, Default)]
pub struct InMemoryApiKeyStore {
    keys: RwLock<HashMap<Uuid, RobotApiKey>>,
}

impl InMemoryApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApiKeyStore for InMemoryApiKeyStore {
    async fn insert(&self, key: RobotApiKey) -> Result<()> {
        self.keys.write().await.insert(key.id, key);
        Ok(())
    }

    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<RobotApiKey>> {
        Ok(self
            .keys
            .read()
            .await
            .values()
            .find(|k| k.key_hash == key_hash)
            .cloned())
    }

    async fn record_usage(
        &self,
        key_id: Uuid,
        at: DateTime<Utc>,
        ip: Option<IpAddr>,
    ) -> Result<()> {
        if let Some(key) = self.keys.write().await.get_mut(&key_id) {
            key.last_used_at = Some(at);
            if ip.is_some() {
                key.last_used_ip = ip;
            }
        }
        Ok(())
    }

    async fn revoke(&self, key_id: Uuid) -> Result<bool> {
        match self.keys.write().await.get_mut(&key_id) {
            Some(key) => {
                key.is_revoked = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_for_robot(&self, robot_id: &str) -> Result<Vec<RobotApiKey>> {
        let mut keys: Vec<RobotApiKey> = self
            .keys
            .read()
            .await
            .values()
            .filter(|k| k.robot_id == robot_id)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }
}
