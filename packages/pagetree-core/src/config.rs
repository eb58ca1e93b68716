use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::publication::ScopeMode;

pub const LOCK_TIMEOUT_ENV: &str = "PAGETREE_LOCK_TIMEOUT_MS";
pub const VERIFY_AFTER_WRITE_ENV: &str = "PAGETREE_VERIFY_AFTER_WRITE";

/// Deployment settings for a [`crate::PageTree`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TreeConfig {
    /// How long a structural operation waits for the tree lock before
    /// failing with `ConcurrencyTimeout`.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub lock_timeout: Duration,

    /// Re-check the canonical nested set before committing each structural
    /// operation.
    pub verify_after_write: bool,

    /// Mode of new publication contexts created by the tree.
    pub default_scope: ScopeMode,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            verify_after_write: true,
            default_scope: ScopeMode::All,
        }
    }
}

impl TreeConfig {
    /// Defaults overridden by `PAGETREE_LOCK_TIMEOUT_MS` and
    /// `PAGETREE_VERIFY_AFTER_WRITE` when set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(LOCK_TIMEOUT_ENV) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                Error::InvalidOperation(format!("{LOCK_TIMEOUT_ENV} must be milliseconds, got {raw:?}"))
            })?;
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Ok(raw) = std::env::var(VERIFY_AFTER_WRITE_ENV) {
            config.verify_after_write = parse_flag(&raw).ok_or_else(|| {
                Error::InvalidOperation(format!("{VERIFY_AFTER_WRITE_ENV} must be a boolean, got {raw:?}"))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidOperation(format!("invalid tree config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout.is_zero() {
            return Err(Error::InvalidOperation(
                "lock_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(feature = "serde")]
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
