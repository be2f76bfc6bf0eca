//! Service configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Configuration for the protocol service.
///
/// Every field has a default, so a host can deserialize a partial document
/// and fill in the rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Largest client action batch accepted.
    pub max_batch_operations: usize,
    /// Session lifetime in seconds.
    pub session_expiry_secs: u64,
    /// Key used to sign session tokens.
    pub session_secret: Vec<u8>,
    /// Properties returned by `getProperties`.
    pub properties: BTreeMap<String, String>,
}

impl ServiceConfig {
    /// Creates a configuration with default limits and a random session secret.
    pub fn new() -> Self {
        let mut secret = Vec::with_capacity(32);
        secret.extend_from_slice(Uuid::new_v4().as_bytes());
        secret.extend_from_slice(Uuid::new_v4().as_bytes());
        Self {
            max_batch_operations: 100,
            session_expiry_secs: 8 * 60 * 60,
            session_secret: secret,
            properties: BTreeMap::new(),
        }
    }

    /// Session lifetime.
    pub fn session_expiry(&self) -> Duration {
        Duration::from_secs(self.session_expiry_secs)
    }

    /// Sets the maximum client action batch size.
    pub fn with_max_batch_operations(mut self, max: usize) -> Self {
        self.max_batch_operations = max;
        self
    }

    /// Sets the session lifetime.
    pub fn with_session_expiry(mut self, expiry: Duration) -> Self {
        self.session_expiry_secs = expiry.as_secs();
        self
    }

    /// Sets the session signing secret.
    pub fn with_session_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.session_secret = secret.into();
        self
    }

    /// Adds an advertised property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new()
    }
}
