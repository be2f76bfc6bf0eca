//! Object identifiers and version stamps.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in Unix milliseconds.
///
/// Version stamps and session tokens share this clock.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Identifies a server object.
///
/// A persistent oid is assigned by the object store and never changes. A
/// transient oid is a placeholder chosen by the client for an object that has
/// not been saved yet; it only means something within one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "serial", rename_all = "snake_case")]
pub enum Oid {
    /// Stable identity assigned by the store.
    Persistent(u64),
    /// Client-side placeholder.
    Transient(u64),
}

impl Oid {
    /// Returns true for store-assigned identities.
    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        matches!(self, Oid::Persistent(_))
    }

    /// Returns true for client-side placeholders.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Oid::Transient(_))
    }

    /// Returns the raw serial number.
    #[must_use]
    pub const fn serial(&self) -> u64 {
        match self {
            Oid::Persistent(serial) | Oid::Transient(serial) => *serial,
        }
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Oid::Persistent(serial) => write!(f, "P#{serial}"),
            Oid::Transient(serial) => write!(f, "T#{serial}"),
        }
    }
}

impl FromStr for Oid {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        let (prefix, serial) = s
            .split_once('#')
            .ok_or_else(|| ProtocolError::InvalidOid(s.to_string()))?;
        let serial: u64 = serial
            .parse()
            .map_err(|_| ProtocolError::InvalidOid(s.to_string()))?;
        match prefix {
            "P" => Ok(Oid::Persistent(serial)),
            "T" => Ok(Oid::Transient(serial)),
            _ => Err(ProtocolError::InvalidOid(s.to_string())),
        }
    }
}

/// Concurrency stamp attached to every persistent object.
///
/// Versions are compared for equality only. Any difference between the
/// version a client claims and the current one is a conflict; there is no
/// "newer than" relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Monotonic per-object counter.
    pub sequence: u64,
    /// User whose change produced this version.
    pub user: String,
    /// Unix millis when the version was produced.
    pub timestamp: u64,
}

impl Version {
    /// Creates a new version stamp.
    pub fn new(sequence: u64, user: impl Into<String>, timestamp: u64) -> Self {
        Self {
            sequence,
            user: user.into(),
            timestamp,
        }
    }

    /// Creates a stamp for `user` taken now.
    pub fn stamped(sequence: u64, user: impl Into<String>) -> Self {
        Self::new(sequence, user, unix_millis())
    }

    /// Returns true if this version is not the same stamp as `other`.
    #[must_use]
    pub fn differs(&self, other: &Version) -> bool {
        self != other
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}({}@{})", self.sequence, self.user, self.timestamp)
    }
}
