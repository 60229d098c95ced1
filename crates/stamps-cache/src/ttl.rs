//! Cache lifetimes.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long a cached value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTtl {
    /// Expires after this many seconds. Zero is never written remotely.
    Seconds(u64),
    /// Never expires.
    Never,
}

impl CacheTtl {
    pub fn from_secs(secs: u64) -> Self {
        CacheTtl::Seconds(secs)
    }

    /// `None` for [`CacheTtl::Never`].
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            CacheTtl::Seconds(secs) => Some(Duration::from_secs(secs)),
            CacheTtl::Never => None,
        }
    }

    /// Whether a value with this lifetime should be written to the remote tier.
    pub fn is_storable(self) -> bool {
        !matches!(self, CacheTtl::Seconds(0))
    }
}

impl From<Duration> for CacheTtl {
    fn from(value: Duration) -> Self {
        CacheTtl::Seconds(value.as_secs())
    }
}

impl fmt::Display for CacheTtl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTtl::Seconds(secs) => write!(f, "{secs}s"),
            CacheTtl::Never => write!(f, "never"),
        }
    }
}

/// Remaining lifetime of a key in the remote tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

impl KeyTtl {
    /// Interprets a Redis `TTL` reply.
    pub fn from_reply(reply: i64) -> Self {
        match reply {
            -2 => KeyTtl::Missing,
            r if r < 0 => KeyTtl::Persistent,
            r => KeyTtl::Expires(Duration::from_secs(r as u64)),
        }
    }
}
