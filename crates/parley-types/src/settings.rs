//! Remote service settings.
//!
//! Exactly one `ServiceSettings` row is active at a time. The aggregator reads
//! the batch threshold from it and the batch worker reads the endpoint, API
//! key, user id and request timeout.
//!
//! The API key is wrapped in [`SecretString`] and is only exposed when
//! building the `Authorization` header.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default number of messages that closes a batch.
pub const DEFAULT_BATCH_THRESHOLD: u32 = 5;
/// Default timeout for one remote call, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Connection settings for the remote chat service.
#[derive(Debug)]
pub struct ServiceSettings {
    pub id: Uuid,
    pub name: String,
    pub base_url: String,
    pub api_key: SecretString,
    pub batch_threshold: u32,
    pub request_timeout_secs: u64,
    /// User identifier sent with every remote request.
    pub user_id: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceSettings {
    /// Build inactive settings with default threshold and timeout.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: SecretString,
        user_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            base_url: base_url.into(),
            api_key,
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            user_id: user_id.into(),
            is_active: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    /// A serializable view with the API key redacted.
    pub fn summary(&self) -> ServiceSettingsSummary {
        let key: Vec<char> = self.api_key.expose_secret().chars().collect();
        let key_hint = if key.len() > 4 {
            format!("...{}", key[key.len() - 4..].iter().collect::<String>())
        } else {
            "****".to_string()
        };

        ServiceSettingsSummary {
            id: self.id,
            name: self.name.clone(),
            base_url: self.base_url.clone(),
            key_hint,
            batch_threshold: self.batch_threshold,
            request_timeout_secs: self.request_timeout_secs,
            user_id: self.user_id.clone(),
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl Clone for ServiceSettings {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            base_url: self.base_url.clone(),
            api_key: SecretString::from(self.api_key.expose_secret().to_string()),
            batch_threshold: self.batch_threshold,
            request_timeout_secs: self.request_timeout_secs,
            user_id: self.user_id.clone(),
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Settings as shown to API and CLI callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettingsSummary {
    pub id: Uuid,
    pub name: String,
    pub base_url: String,
    /// Last four characters of the API key.
    pub key_hint: String,
    pub batch_threshold: u32,
    pub request_timeout_secs: u64,
    pub user_id: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
