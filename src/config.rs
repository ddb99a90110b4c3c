//! Deserializable configuration for the cache, registry, and coordinator,
//! loadable from TOML via the `config` crate. Pure data — the outer HTTP
//! server's own listen address, TLS, and auth configuration are not
//! modeled here.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Which backend variant to construct: `"file_system"` or `"redis"`.
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default = "default_expire", with = "humantime_serde")]
    pub expire: Duration,

    #[serde(default = "default_grace", with = "humantime_serde")]
    pub grace: Duration,

    /// Byte ceiling enforced by the filesystem cache's background cleaner.
    #[serde(default = "default_max_size")]
    pub max_size: u64,

    /// Directory backing the filesystem cache (and, for the shared
    /// backend, spilled large-payload scratch files).
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Address of the shared key/value store, used when `backend = "redis"`.
    #[serde(default)]
    pub backend_addr: Option<String>,
}

fn default_backend() -> String {
    "file_system".to_string()
}
fn default_expire() -> Duration {
    Duration::from_secs(60)
}
fn default_grace() -> Duration {
    Duration::from_secs(1)
}
fn default_max_size() -> u64 {
    512 * 1024 * 1024
}
fn default_cache_dir() -> String {
    "qproxy_data/cache".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            expire: default_expire(),
            grace: default_grace(),
            max_size: default_max_size(),
            cache_dir: default_cache_dir(),
            backend_addr: None,
        }
    }
}

impl CacheConfig {
    /// Checks the logical consistency TOML deserialization alone can't
    /// enforce (a `max_size` of zero would deserialize fine but would make
    /// the cleaner evict everything on its very first size-pressure pass).
    pub fn validate(&self) -> Result<()> {
        if self.backend != "file_system" && self.backend != "redis" {
            return Err(anyhow!(
                "cache.backend must be \"file_system\" or \"redis\", got {:?}",
                self.backend
            ));
        }
        if self.max_size == 0 {
            return Err(anyhow!("cache.max_size cannot be 0"));
        }
        if self.expire.is_zero() {
            return Err(anyhow!("cache.expire cannot be 0"));
        }
        if self.backend == "redis" && self.backend_addr.is_none() {
            return Err(anyhow!("cache.backend_addr is required when backend = \"redis\""));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Which backend variant to construct: `"local"` or `"redis"`.
    #[serde(default = "default_registry_backend")]
    pub backend: String,

    /// Pending deadline, overriding the conventional `2 * grace` default
    /// when set explicitly.
    #[serde(default, with = "humantime_serde::option")]
    pub pending_deadline: Option<Duration>,

    #[serde(default = "default_terminal_ttl", with = "humantime_serde")]
    pub terminal_ttl: Duration,
}

fn default_registry_backend() -> String {
    "local".to_string()
}
fn default_terminal_ttl() -> Duration {
    Duration::from_millis(500)
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: default_registry_backend(),
            pending_deadline: None,
            terminal_ttl: default_terminal_ttl(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend != "local" && self.backend != "redis" {
            return Err(anyhow!(
                "registry.backend must be \"local\" or \"redis\", got {:?}",
                self.backend
            ));
        }
        if self.terminal_ttl.is_zero() {
            return Err(anyhow!("registry.terminal_ttl cannot be 0"));
        }
        if let Some(pending) = self.pending_deadline
            && pending < self.terminal_ttl
        {
            return Err(anyhow!(
                "registry.pending_deadline must be at least registry.terminal_ttl"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorSettings {
    /// Explicit grace window. Per spec.md §4.7: if unset, the coordinator
    /// falls back to `default_max_execution_time` below (a default
    /// *enabled* wait, not a disabled one); set `disable_anti_dogpile` to
    /// turn coordination off entirely, matching the spec's "if negative,
    /// disable anti-dogpile entirely" without requiring a signed duration.
    #[serde(default, with = "humantime_serde::option")]
    pub grace_time: Option<Duration>,

    /// The grace window used when `grace_time` is unset: the surrounding
    /// proxy's own max query execution time, supplied to this subsystem as
    /// a collaborator value.
    #[serde(default = "default_max_execution_time", with = "humantime_serde")]
    pub default_max_execution_time: Duration,

    /// Disables anti-dogpile coordination entirely, regardless of
    /// `grace_time`/`default_max_execution_time`.
    #[serde(default)]
    pub disable_anti_dogpile: bool,

    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: u64,

    #[serde(default)]
    pub shared_with_all_users: bool,
}

fn default_max_payload_size() -> u64 {
    512 * 1024 * 1024
}
fn default_max_execution_time() -> Duration {
    Duration::from_secs(60)
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            grace_time: Some(Duration::from_secs(5)),
            default_max_execution_time: default_max_execution_time(),
            disable_anti_dogpile: false,
            max_payload_size: default_max_payload_size(),
            shared_with_all_users: false,
        }
    }
}

impl CoordinatorSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_payload_size == 0 {
            return Err(anyhow!("coordinator.max_payload_size cannot be 0"));
        }
        if self.default_max_execution_time.is_zero() {
            return Err(anyhow!("coordinator.default_max_execution_time cannot be 0"));
        }
        Ok(())
    }

    /// Resolves the effective grace window per spec.md §4.7's three-way
    /// rule: disabled, explicit, or the collaborator-supplied default.
    pub fn resolve_grace_time(&self) -> crate::coordinator::GraceTime {
        if self.disable_anti_dogpile {
            return crate::coordinator::GraceTime::Disabled;
        }
        crate::coordinator::GraceTime::Duration(self.grace_time.unwrap_or(self.default_max_execution_time))
    }
}

/// Loads a [`CacheConfig`] / [`RegistryConfig`] / [`CoordinatorSettings`]
/// triple from a TOML file, falling back to defaults for any field the
/// file omits, then validates the resolved values for logical consistency
/// the same way the surrounding server's own config loader does.
pub fn load_from_toml_file(path: &str) -> Result<(CacheConfig, RegistryConfig, CoordinatorSettings)> {
    let source = config::Config::builder()
        .add_source(config::File::with_name(path))
        .build()?;

    let cache = source.clone().try_deserialize::<CacheSection>()?.cache;
    let registry = source.clone().try_deserialize::<RegistrySection>()?.registry;
    let coordinator = source.try_deserialize::<CoordinatorSection>()?.coordinator;

    cache.validate()?;
    registry.validate()?;
    coordinator.validate()?;

    Ok((cache, registry, coordinator))
}

#[derive(Debug, Deserialize)]
struct CacheSection {
    #[serde(default)]
    cache: CacheConfig,
}

#[derive(Debug, Deserialize)]
struct RegistrySection {
    #[serde(default)]
    registry: RegistryConfig,
}

#[derive(Debug, Deserialize)]
struct CoordinatorSection {
    #[serde(default)]
    coordinator: CoordinatorSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_config_defaults_match_documented_values() {
        let cfg = CacheConfig::default();
        assert_eq!(cfg.backend, "file_system");
        assert_eq!(cfg.expire, Duration::from_secs(60));
        assert_eq!(cfg.grace, Duration::from_secs(1));
    }

    #[test]
    fn registry_config_defaults_use_local_backend() {
        let cfg = RegistryConfig::default();
        assert_eq!(cfg.backend, "local");
        assert!(cfg.pending_deadline.is_none());
    }

    #[test]
    fn coordinator_settings_default_to_anti_dogpile_enabled() {
        let cfg = CoordinatorSettings::default();
        assert!(cfg.grace_time.is_some());
        assert!(!cfg.disable_anti_dogpile);
        assert!(!cfg.shared_with_all_users);
    }

    #[test]
    fn resolve_grace_time_uses_default_max_execution_time_when_unset() {
        let mut cfg = CoordinatorSettings::default();
        cfg.grace_time = None;
        cfg.default_max_execution_time = Duration::from_secs(42);
        match cfg.resolve_grace_time() {
            crate::coordinator::GraceTime::Duration(d) => assert_eq!(d, Duration::from_secs(42)),
            crate::coordinator::GraceTime::Disabled => panic!("expected an enabled grace window"),
        }
    }

    #[test]
    fn resolve_grace_time_prefers_explicit_value_over_default() {
        let mut cfg = CoordinatorSettings::default();
        cfg.grace_time = Some(Duration::from_millis(500));
        match cfg.resolve_grace_time() {
            crate::coordinator::GraceTime::Duration(d) => assert_eq!(d, Duration::from_millis(500)),
            crate::coordinator::GraceTime::Disabled => panic!("expected an enabled grace window"),
        }
    }

    #[test]
    fn resolve_grace_time_disabled_flag_wins_over_explicit_value() {
        let mut cfg = CoordinatorSettings::default();
        cfg.grace_time = Some(Duration::from_secs(5));
        cfg.disable_anti_dogpile = true;
        assert!(matches!(cfg.resolve_grace_time(), crate::coordinator::GraceTime::Disabled));
    }

    #[test]
    fn default_configs_validate_cleanly() {
        CacheConfig::default().validate().unwrap();
        RegistryConfig::default().validate().unwrap();
        CoordinatorSettings::default().validate().unwrap();
    }

    #[test]
    fn cache_config_rejects_zero_max_size() {
        let mut cfg = CacheConfig::default();
        cfg.max_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cache_config_rejects_unknown_backend_tag() {
        let mut cfg = CacheConfig::default();
        cfg.backend = "memcached".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cache_config_requires_backend_addr_for_redis() {
        let mut cfg = CacheConfig::default();
        cfg.backend = "redis".to_string();
        assert!(cfg.validate().is_err());
        cfg.backend_addr = Some("127.0.0.1:6379".to_string());
        cfg.validate().unwrap();
    }

    #[test]
    fn registry_config_rejects_pending_deadline_shorter_than_terminal_ttl() {
        let mut cfg = RegistryConfig::default();
        cfg.pending_deadline = Some(Duration::from_millis(1));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn coordinator_settings_rejects_zero_max_payload_size() {
        let mut cfg = CoordinatorSettings::default();
        cfg.max_payload_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn coordinator_settings_rejects_zero_default_max_execution_time() {
        let mut cfg = CoordinatorSettings::default();
        cfg.default_max_execution_time = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }
}
