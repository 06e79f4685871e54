//! Configuration types for the cache and multicast layers.
//!
//! Every config follows the same shape: `Default`, `with_*` builders,
//! `validate()` before use, and `from_env()` for deployment overrides.
//! Invalid combinations are rejected when a cache or store is built, never
//! at call time.

use crate::error::{ConfigError, StrataResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

// ============================================================================
// MEMORY POLICY
// ============================================================================

/// Sizing and expiry for a store's in-memory cache.
///
/// Size and weight bounds are mutually exclusive, and so are the two expiry
/// modes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPolicy {
    /// Maximum number of entries
    pub max_size: Option<u64>,
    /// Maximum total weight, requires a weigher
    pub max_weight: Option<u64>,
    pub expire_after_write: Option<Duration>,
    pub expire_after_access: Option<Duration>,
}

impl MemoryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn with_max_weight(mut self, max_weight: u64) -> Self {
        self.max_weight = Some(max_weight);
        self
    }

    pub fn with_expire_after_write(mut self, ttl: Duration) -> Self {
        self.expire_after_write = Some(ttl);
        self
    }

    pub fn with_expire_after_access(mut self, ttl: Duration) -> Self {
        self.expire_after_access = Some(ttl);
        self
    }

    pub fn is_max_size_limited(&self) -> bool {
        self.max_size.is_some()
    }

    pub fn is_max_weight_limited(&self) -> bool {
        self.max_weight.is_some()
    }

    /// Validate the policy.
    pub fn validate(&self) -> StrataResult<()> {
        if self.max_size.is_some() && self.max_weight.is_some() {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "max_size".to_string(),
                option_b: "max_weight".to_string(),
            }
            .into());
        }

        if self.expire_after_write.is_some() && self.expire_after_access.is_some() {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "expire_after_write".to_string(),
                option_b: "expire_after_access".to_string(),
            }
            .into());
        }

        for (field, ttl) in [
            ("expire_after_write", self.expire_after_write),
            ("expire_after_access", self.expire_after_access),
        ] {
            if ttl == Some(Duration::ZERO) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: "0ms".to_string(),
                    reason: "expiry must be positive".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Load from environment variables, falling back to no bound and no expiry.
    ///
    /// Env vars:
    /// - `STRATA_CACHE_MAX_SIZE`
    /// - `STRATA_CACHE_MAX_WEIGHT`
    /// - `STRATA_CACHE_EXPIRE_AFTER_WRITE_MS`
    /// - `STRATA_CACHE_EXPIRE_AFTER_ACCESS_MS`
    pub fn from_env() -> Self {
        Self {
            max_size: env_parse("STRATA_CACHE_MAX_SIZE"),
            max_weight: env_parse("STRATA_CACHE_MAX_WEIGHT"),
            expire_after_write: env_millis("STRATA_CACHE_EXPIRE_AFTER_WRITE_MS"),
            expire_after_access: env_millis("STRATA_CACHE_EXPIRE_AFTER_ACCESS_MS"),
        }
    }
}

// ============================================================================
// MULTICAST CONFIG
// ============================================================================

/// Fan-out behaviour of a channel manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastConfig {
    /// Values retained for late subscribers. Zero means rendezvous.
    pub buffer_size: usize,
    /// Keep the upstream running after the last subscriber leaves.
    pub keep_upstream_alive: bool,
    /// Subscribers stay attached across upstream restarts.
    pub piggybacking_downstream: bool,
    /// Acknowledgements required before the upstream may produce again.
    pub min_acks: usize,
    /// Values a single subscriber may have queued before the upstream waits
    /// for it. Never below `buffer_size + 1`.
    #[serde(default = "default_downstream_capacity")]
    pub downstream_capacity: usize,
}

fn default_downstream_capacity() -> usize {
    16
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            buffer_size: 0,
            keep_upstream_alive: false,
            piggybacking_downstream: false,
            min_acks: 1,
            downstream_capacity: default_downstream_capacity(),
        }
    }
}

impl MulticastConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_keep_upstream_alive(mut self, keep_alive: bool) -> Self {
        self.keep_upstream_alive = keep_alive;
        self
    }

    pub fn with_piggybacking_downstream(mut self, piggyback: bool) -> Self {
        self.piggybacking_downstream = piggyback;
        self
    }

    pub fn with_min_acks(mut self, min_acks: usize) -> Self {
        self.min_acks = min_acks;
        self
    }

    pub fn with_downstream_capacity(mut self, capacity: usize) -> Self {
        self.downstream_capacity = capacity;
        self
    }

    /// Queue bound actually applied to each subscriber. A replayed buffer
    /// always fits with room for one more value.
    pub fn downstream_limit(&self) -> usize {
        self.downstream_capacity.max(self.buffer_size + 1)
    }

    /// Validate the config.
    pub fn validate(&self) -> StrataResult<()> {
        if self.keep_upstream_alive && self.buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "buffer_size".to_string(),
                value: "0".to_string(),
                reason: "keep_upstream_alive requires a buffer".to_string(),
            }
            .into());
        }

        if self.min_acks == 0 {
            return Err(ConfigError::InvalidValue {
                field: "min_acks".to_string(),
                value: "0".to_string(),
                reason: "at least one acknowledgement is required".to_string(),
            }
            .into());
        }

        if self.downstream_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "downstream_capacity".to_string(),
                value: "0".to_string(),
                reason: "subscribers need room for at least one value".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Load from environment variables with fallback to defaults.
    ///
    /// Env vars:
    /// - `STRATA_MULTICAST_BUFFER_SIZE`
    /// - `STRATA_MULTICAST_KEEP_UPSTREAM_ALIVE`
    /// - `STRATA_MULTICAST_PIGGYBACK`
    /// - `STRATA_MULTICAST_MIN_ACKS`
    /// - `STRATA_MULTICAST_DOWNSTREAM_CAPACITY`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            buffer_size: env_parse("STRATA_MULTICAST_BUFFER_SIZE").unwrap_or(defaults.buffer_size),
            keep_upstream_alive: env_parse("STRATA_MULTICAST_KEEP_UPSTREAM_ALIVE")
                .unwrap_or(defaults.keep_upstream_alive),
            piggybacking_downstream: env_parse("STRATA_MULTICAST_PIGGYBACK")
                .unwrap_or(defaults.piggybacking_downstream),
            min_acks: env_parse("STRATA_MULTICAST_MIN_ACKS").unwrap_or(defaults.min_acks),
            downstream_capacity: env_parse("STRATA_MULTICAST_DOWNSTREAM_CAPACITY")
                .unwrap_or(defaults.downstream_capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StrataError;

    #[test]
    fn test_memory_policy_default_is_valid() {
        assert!(MemoryPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_memory_policy_rejects_size_and_weight() {
        let policy = MemoryPolicy::new().with_max_size(10).with_max_weight(100);
        let err = policy.validate().unwrap_err();
        assert!(matches!(
            err,
            StrataError::Config(ConfigError::IncompatibleOptions { .. })
        ));
    }

    #[test]
    fn test_memory_policy_rejects_both_expiries() {
        let policy = MemoryPolicy::new()
            .with_expire_after_write(Duration::from_secs(1))
            .with_expire_after_access(Duration::from_secs(1));
        let msg = policy.validate().unwrap_err().to_string();
        assert!(msg.contains("expire_after_write"));
        assert!(msg.contains("expire_after_access"));
    }

    #[test]
    fn test_memory_policy_rejects_zero_ttl() {
        let policy = MemoryPolicy::new().with_expire_after_access(Duration::ZERO);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_multicast_keep_alive_requires_buffer() {
        let config = MulticastConfig::new().with_keep_upstream_alive(true);
        assert!(config.validate().is_err());
        assert!(config.with_buffer_size(1).validate().is_ok());
    }

    #[test]
    fn test_multicast_rejects_zero_acks() {
        assert!(MulticastConfig::new().with_min_acks(0).validate().is_err());
    }

    #[test]
    fn test_downstream_limit_leaves_room_past_the_buffer() {
        assert!(MulticastConfig::new().with_downstream_capacity(0).validate().is_err());

        let config = MulticastConfig::new().with_downstream_capacity(2);
        assert_eq!(config.downstream_limit(), 2);
        assert_eq!(config.with_buffer_size(5).downstream_limit(), 6);
    }

    #[test]
    fn test_multicast_config_without_capacity_deserializes() {
        let json = r#"{"buffer_size":1,"keep_upstream_alive":true,"piggybacking_downstream":false,"min_acks":1}"#;
        let config: MulticastConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.downstream_capacity, MulticastConfig::default().downstream_capacity);
    }

    #[test]
    fn test_memory_policy_serde_roundtrip() {
        let policy = MemoryPolicy::new()
            .with_max_size(64)
            .with_expire_after_write(Duration::from_millis(1500));
        let json = serde_json::to_string(&policy).unwrap();
        let back: MemoryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
