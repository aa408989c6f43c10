//! Self-describing object identifiers.
//!
//! An identifier has the form `<expirationUnixNanos>-<entropy>`. The numeric
//! prefix is the object's expiration instant, so expiry can be decided from
//! the identifier alone without touching any backend. The same identifier is
//! the key in both the blob store and the metadata store.

use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::services::error::StoreError;

/// Width of the random suffix. Blob and metadata stores share one namespace,
/// so both use this width.
pub const ENTROPY_LEN: usize = 32;

const SEPARATOR: char = '-';

/// A validated object identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId {
    raw: String,
    expiration: DateTime<Utc>,
}

impl ObjectId {
    /// Generate a fresh identifier for an object expiring at `expiration`.
    ///
    /// Instants past the nanosecond range of `i64` (year 2262) saturate.
    pub fn generate(expiration: DateTime<Utc>) -> Self {
        let nanos = expiration.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let entropy: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ENTROPY_LEN)
            .map(char::from)
            .collect();

        Self {
            raw: format!("{nanos}{SEPARATOR}{entropy}"),
            expiration: DateTime::from_timestamp_nanos(nanos),
        }
    }

    /// Decode the expiration instant encoded in `id`.
    ///
    /// This is the fast-path expiry gate: it never touches a backend.
    pub fn decode_expiration(id: &str) -> Result<DateTime<Utc>, StoreError> {
        id.parse::<ObjectId>().map(|id| id.expiration)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn expiration(&self) -> DateTime<Utc> {
        self.expiration
    }

    /// True once `now` has reached the encoded expiration.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }
}

impl FromStr for ObjectId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || StoreError::MalformedIdentifier(s.to_string());

        let parts: Vec<&str> = s.split(SEPARATOR).collect();
        let [nanos, entropy] = parts.as_slice() else {
            return Err(malformed());
        };
        let nanos: i64 = nanos.parse().map_err(|_| malformed())?;

        // The suffix ends up in file names, so only plain alphanumerics pass.
        if entropy.is_empty() || !entropy.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(malformed());
        }

        Ok(Self {
            raw: s.to_string(),
            expiration: DateTime::from_timestamp_nanos(nanos),
        })
    }
}

impl TryFrom<String> for ObjectId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.raw
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl AsRef<str> for ObjectId {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}
