//! Robot API-key authentication.
//!
//! Keys look like `crpa_` followed by 64 lowercase hex characters. The raw
//! key is shown once at issue time; the store only ever sees its SHA-256.

mod store;

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{OrchestratorError, Result};

pub use store::{ApiKeyStore, InMemoryApiKeyStore, RobotApiKey};

pub const API_KEY_PREFIX: &str = "crpa_";
const API_KEY_HEX_LEN: usize = 64;

/// Cheap shape check done before touching the store.
pub fn is_well_formed(raw_key: &str) -> bool {
    raw_key
        .strip_prefix(API_KEY_PREFIX)
        .is_some_and(|rest| {
            rest.len() == API_KEY_HEX_LEN
                && rest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        })
}

pub fn hash_api_key(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.as_bytes()))
}

fn generate_raw_key() -> String {
    let bytes: [u8; 32] = rand::random();
    format!("{API_KEY_PREFIX}{}", hex::encode(bytes))
}

/// A freshly issued key. `raw_key` is not stored anywhere.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedKey {
    pub key_id: Uuid,
    pub robot_id: String,
    pub raw_key: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct RobotAuthenticator {
    store: Arc<dyn ApiKeyStore>,
    clock: Arc<dyn Clock>,
}

impl RobotAuthenticator {
    pub fn new(store: Arc<dyn ApiKeyStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn ApiKeyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Resolves a raw key to the robot it belongs to.
    ///
    /// Malformed, unknown, revoked and expired keys all yield `None`; the
    /// caller cannot tell them apart. Usage is recorded in the background.
    pub async fn verify(&self, raw_key: &str, client_ip: Option<IpAddr>) -> Option<String> {
        if !is_well_formed(raw_key) {
            return None;
        }

        let key = match self.store.find_by_hash(&hash_api_key(raw_key)).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                tracing::debug!("Unknown API key presented");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "API key lookup failed");
                return None;
            }
        };

        let now = self.clock.now();
        if !key.is_usable(now) {
            tracing::debug!(
                key_id = %key.id,
                robot_id = %key.robot_id,
                revoked = key.is_revoked,
                "Rejected unusable API key"
            );
            return None;
        }

        let store = self.store.clone();
        let key_id = key.id;
        tokio::spawn(async move {
            if let Err(e) = store.record_usage(key_id, now, client_ip).await {
                tracing::debug!(key_id = %key_id, error = %e, "Failed to record API key usage");
            }
        });

        Some(key.robot_id)
    }

    /// Generates a new key for `robot_id`, optionally expiring after `ttl`.
    pub async fn issue_key(&self, robot_id: &str, ttl: Option<Duration>) -> Result<IssuedKey> {
        let raw_key = generate_raw_key();
        let key = self.store_key(robot_id, &raw_key, ttl).await?;
        tracing::info!(key_id = %key.id, robot_id, "API key issued");
        Ok(IssuedKey {
            key_id: key.id,
            robot_id: key.robot_id,
            raw_key,
            expires_at: key.expires_at,
        })
    }

    /// Registers a key generated elsewhere, e.g. provisioned with the robot.
    pub async fn import_key(&self, robot_id: &str, raw_key: &str) -> Result<RobotApiKey> {
        if !is_well_formed(raw_key) {
            return Err(OrchestratorError::Validation(format!(
                "API key must be '{API_KEY_PREFIX}' followed by {API_KEY_HEX_LEN} lowercase hex characters"
            )));
        }
        if self.store.find_by_hash(&hash_api_key(raw_key)).await?.is_some() {
            return Err(OrchestratorError::Validation(
                "API key is already registered".to_string(),
            ));
        }
        let key = self.store_key(robot_id, raw_key, None).await?;
        tracing::info!(key_id = %key.id, robot_id, "API key imported");
        Ok(key)
    }

    pub async fn revoke(&self, key_id: Uuid) -> Result<bool> {
        let revoked = self.store.revoke(key_id).await?;
        if revoked {
            tracing::info!(key_id = %key_id, "API key revoked");
        }
        Ok(revoked)
    }

    pub async fn keys_for(&self, robot_id: &str) -> Result<Vec<RobotApiKey>> {
        self.store.list_for_robot(robot_id).await
    }

    async fn store_key(
        &self,
        robot_id: &str,
        raw_key: &str,
        ttl: Option<Duration>,
    ) -> Result<RobotApiKey> {
        if robot_id.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "robot_id cannot be empty".to_string(),
            ));
        }
        let now = self.clock.now();
        let expires_at = match ttl {
            Some(ttl) if ttl <= Duration::zero() => {
                return Err(OrchestratorError::Validation(
                    "key ttl must be positive".to_string(),
                ))
            }
            Some(ttl) => Some(now.checked_add_signed(ttl).ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "key ttl of {}s is out of range",
                    ttl.num_seconds()
                ))
            })?),
            None => None,
        };
        let key = RobotApiKey {
            id: Uuid::new_v4(),
            robot_id: robot_id.to_string(),
            key_hash: hash_api_key(raw_key),
            created_at: now,
            expires_at,
            is_revoked: false,
            last_used_at: None,
            last_used_ip: None,
        };
        self.store.insert(key.clone()).await?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn authenticator() -> (RobotAuthenticator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let auth =
            RobotAuthenticator::with_clock(Arc::new(InMemoryApiKeyStore::new()), clock.clone());
        (auth, clock)
    }

    #[test]
    fn key_shape() {
        let key = generate_raw_key();
        assert!(key.starts_with("crpa_"));
        assert_eq!(key.len(), 5 + 64);
        assert!(is_well_formed(&key));

        assert!(!is_well_formed("crpa_short"));
        assert!(!is_well_formed(&key.replace("crpa_", "xxxx_")));
        assert!(!is_well_formed(&key.to_uppercase()));
    }

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            hash_api_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn issued_key_verifies_and_records_usage() {
        let (auth, _) = authenticator();
        let issued = auth.issue_key("robot-1", None).await.unwrap();
        let ip: IpAddr = "10.1.2.3".parse().unwrap();

        assert_eq!(
            auth.verify(&issued.raw_key, Some(ip)).await.as_deref(),
            Some("robot-1")
        );

        // Usage is recorded by a spawned task.
        for _ in 0..50 {
            let keys = auth.keys_for("robot-1").await.unwrap();
            if keys[0].last_used_ip == Some(ip) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("usage was never recorded");
    }

    #[tokio::test]
    async fn revoked_and_expired_keys_are_rejected() {
        let (auth, clock) = authenticator();
        let revoked = auth.issue_key("robot-1", None).await.unwrap();
        assert!(auth.revoke(revoked.key_id).await.unwrap());
        assert!(auth.verify(&revoked.raw_key, None).await.is_none());

        let expiring = auth
            .issue_key("robot-2", Some(Duration::hours(1)))
            .await
            .unwrap();
        assert!(auth.verify(&expiring.raw_key, None).await.is_some());
        clock.advance(Duration::hours(2));
        assert!(auth.verify(&expiring.raw_key, None).await.is_none());
    }

    #[tokio::test]
    async fn key_ttl_must_be_positive_and_representable() {
        let (auth, _) = authenticator();
        for ttl in [Duration::zero(), Duration::seconds(-5), Duration::MAX] {
            let err = auth.issue_key("robot-1", Some(ttl)).await.unwrap_err();
            assert!(matches!(err, OrchestratorError::Validation(_)), "{ttl:?}");
        }
        assert!(auth.keys_for("robot-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_and_malformed_keys_are_rejected() {
        let (auth, _) = authenticator();
        assert!(auth.verify(&generate_raw_key(), None).await.is_none());
        assert!(auth.verify("not-a-key", None).await.is_none());
        assert!(!auth.revoke(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn import_rejects_bad_and_duplicate_keys() {
        let (auth, _) = authenticator();
        assert!(auth.import_key("robot-1", "crpa_123").await.is_err());

        let raw = generate_raw_key();
        auth.import_key("robot-1", &raw).await.unwrap();
        assert!(auth.import_key("robot-2", &raw).await.is_err());
        assert_eq!(auth.verify(&raw, None).await.as_deref(), Some("robot-1"));
    }
}
