//! Authentication and session tokens.
//!
//! Sessions are signed with HMAC-SHA256 so that a forged or altered session
//! is rejected before any lookup happens. The signature covers:
//!
//! - 16 bytes: session id
//! - 8 bytes: issue timestamp (Unix millis, big-endian)
//! - the user name, UTF-8
//!
//! A valid signature is not enough on its own: the session must also still be
//! open and younger than the configured expiry.

use crate::error::{ServiceError, ServiceResult};
use hmac::{Hmac, Mac};
use objsync_protocol::{unix_millis, Session};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Verifies user credentials.
pub trait Authenticator: Send + Sync {
    /// Returns true if `credential` is valid for `user`.
    fn authenticate(&self, user: &str, credential: &str) -> bool;
}

/// Authenticator over a fixed set of users.
///
/// Only SHA-256 digests of the credentials are kept.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, [u8; 32]>,
}

impl StaticAuthenticator {
    /// Creates an authenticator with no users.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>, credential: &str) -> Self {
        self.users.insert(user.into(), Self::digest(credential));
        self
    }

    fn digest(credential: &str) -> [u8; 32] {
        Sha256::digest(credential.as_bytes()).into()
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, user: &str, credential: &str) -> bool {
        self.users
            .get(user)
            .is_some_and(|digest| *digest == Self::digest(credential))
    }
}

/// Issues, validates and closes sessions.
pub struct SessionManager {
    secret: Vec<u8>,
    expiry: Duration,
    open: RwLock<HashMap<[u8; 16], String>>,
}

impl SessionManager {
    /// Creates a manager signing with `secret`.
    pub fn new(secret: Vec<u8>, expiry: Duration) -> Self {
        Self {
            secret,
            expiry,
            open: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a session for an authenticated user.
    pub fn open(&self, user: &str) -> ServiceResult<Session> {
        let id = Uuid::new_v4().into_bytes();
        let issued_at = unix_millis();
        let token = self.sign(&id, issued_at, user)?;
        self.open.write().insert(id, user.to_string());
        info!(user, session = %Uuid::from_bytes(id), "session opened");
        Ok(Session {
            id,
            user: user.to_string(),
            issued_at,
            token,
        })
    }

    /// Fails with `AuthFailed` unless `session` is genuine, open and unexpired.
    pub fn validate(&self, session: &Session) -> ServiceResult<()> {
        let mut mac = self.mac()?;
        mac.update(&Self::signed_data(&session.id, session.issued_at, &session.user));
        if mac.verify_slice(&session.token).is_err() {
            warn!(user = %session.user, "session signature rejected");
            return Err(ServiceError::auth_failed("invalid session signature"));
        }

        let expiry_millis = self.expiry.as_millis() as u64;
        if unix_millis() > session.issued_at.saturating_add(expiry_millis) {
            return Err(ServiceError::auth_failed("session expired"));
        }

        match self.open.read().get(&session.id) {
            Some(user) if *user == session.user => Ok(()),
            _ => Err(ServiceError::auth_failed("session is not open")),
        }
    }

    /// Closes a session. Returns false if it was not open.
    pub fn close(&self, session: &Session) -> bool {
        let closed = self.open.write().remove(&session.id).is_some();
        if closed {
            info!(user = %session.user, session = %Uuid::from_bytes(session.id), "session closed");
        }
        closed
    }

    /// Closes every session and returns how many were open.
    pub fn close_all(&self) -> usize {
        let mut open = self.open.write();
        let count = open.len();
        open.clear();
        count
    }

    /// Returns the number of open sessions.
    pub fn open_count(&self) -> usize {
        self.open.read().len()
    }

    fn mac(&self) -> ServiceResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| ServiceError::internal("invalid session secret"))
    }

    fn signed_data(id: &[u8; 16], issued_at: u64, user: &str) -> Vec<u8> {
        let mut data = Vec::with_capacity(24 + user.len());
        data.extend_from_slice(id);
        data.extend_from_slice(&issued_at.to_be_bytes());
        data.extend_from_slice(user.as_bytes());
        data
    }

    fn sign(&self, id: &[u8; 16], issued_at: u64, user: &str) -> ServiceResult<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(&Self::signed_data(id, issued_at, user));
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
