//! Environment-variable-driven service configuration.
//!
//! Unlike the base crate's TOML-file `ConfigDiscovery` hierarchy, this
//! service has no on-disk configuration: the env var table below plus the
//! bind address are the entire surface. `Config::from_env()` is called once
//! at startup and the result is handed out by `Arc` to every component that
//! needs it.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Name of the gVisor OCI runtime bollard requests when enabled.
const DEFAULT_GVISOR_RUNTIME: &str = "runsc";
/// Default container-count admission cap for the circuit breaker.
const DEFAULT_MAX_CONTAINERS: u32 = 15;
/// Default memory-usage admission cap (percent) for the circuit breaker.
const DEFAULT_MAX_MEMORY_PERCENT: f64 = 85.0;
/// Default bind address when `SANDBOX_BIND_ADDR` is unset.
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Configuration errors: only ever raised by validation at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A supplied value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Process-wide configuration, constructed once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP/WebSocket server binds to.
    pub bind_addr: SocketAddr,
    /// Whether to request the gVisor runtime for new containers.
    pub use_gvisor: bool,
    /// Name of the gVisor OCI runtime (default `runsc`).
    pub gvisor_runtime: String,
    /// Substitute very-high rate limits for all tiers (development only).
    pub disable_rate_limit: bool,
    /// Container-count admission cap.
    pub circuit_max_containers: u32,
    /// Memory-usage admission cap, percent.
    pub circuit_max_memory_percent: f64,
    /// Container runtime API socket path, if overridden.
    pub container_runtime_socket: Option<String>,
    /// Development mode: skips the memory probe (host page-cache skews it)
    /// and is required to allow `disable_rate_limit`.
    pub dev_mode: bool,
}

impl Config {
    /// Build configuration from environment variables, applying defaults and
    /// validating cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfiguration`] if `SANDBOX_BIND_ADDR`
    /// does not parse, or if gVisor is requested with an empty or
    /// whitespace-containing runtime name.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env_string("SANDBOX_BIND_ADDR", DEFAULT_BIND_ADDR)
            .parse::<SocketAddr>()
            .map_err(|e| {
                ConfigError::InvalidConfiguration(format!("SANDBOX_BIND_ADDR invalid: {e}"))
            })?;

        let use_gvisor = env_bool("SANDBOX_USE_GVISOR", false);
        let gvisor_runtime = env_string("SANDBOX_GVISOR_RUNTIME", DEFAULT_GVISOR_RUNTIME);

        if use_gvisor && (gvisor_runtime.trim().is_empty() || gvisor_runtime != gvisor_runtime.trim())
        {
            return Err(ConfigError::InvalidConfiguration(
                "SANDBOX_GVISOR_RUNTIME must be non-empty and contain no whitespace".to_string(),
            ));
        }

        let dev_mode = env_bool("SANDBOX_DEV_MODE", false);
        let disable_rate_limit = env_bool("DISABLE_RATE_LIMIT", false);

        let circuit_max_containers =
            env_parse("CIRCUIT_MAX_CONTAINERS", DEFAULT_MAX_CONTAINERS)?;
        let circuit_max_memory_percent =
            env_parse("CIRCUIT_MAX_MEMORY_PERCENT", DEFAULT_MAX_MEMORY_PERCENT)?;

        let container_runtime_socket = std::env::var("SANDBOX_CONTAINER_SOCKET").ok();

        Ok(Self {
            bind_addr,
            use_gvisor,
            gvisor_runtime,
            disable_rate_limit,
            circuit_max_containers,
            circuit_max_memory_percent,
            container_runtime_socket,
            dev_mode,
        })
    }

    /// Idle-session reaper sweep interval.
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(30)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => v.to_lowercase() != "false" && !v.is_empty(),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidConfiguration(format!("{key} is not a valid value"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "SANDBOX_BIND_ADDR",
            "SANDBOX_USE_GVISOR",
            "SANDBOX_GVISOR_RUNTIME",
            "SANDBOX_DEV_MODE",
            "DISABLE_RATE_LIMIT",
            "CIRCUIT_MAX_CONTAINERS",
            "CIRCUIT_MAX_MEMORY_PERCENT",
            "SANDBOX_CONTAINER_SOCKET",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = Config::from_env().unwrap();
        assert_eq!(config.gvisor_runtime, "runsc");
        assert!(!config.use_gvisor);
        assert_eq!(config.circuit_max_containers, DEFAULT_MAX_CONTAINERS);
        assert!((config.circuit_max_memory_percent - DEFAULT_MAX_MEMORY_PERCENT).abs() < f64::EPSILON);
    }

    #[test]
    #[serial]
    fn test_gvisor_runtime_rejects_whitespace() {
        clear_env();
        std::env::set_var("SANDBOX_USE_GVISOR", "true");
        std::env::set_var("SANDBOX_GVISOR_RUNTIME", "run sc");
        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::InvalidConfiguration(_))));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_gvisor_runtime_rejects_empty() {
        clear_env();
        std::env::set_var("SANDBOX_USE_GVISOR", "true");
        std::env::set_var("SANDBOX_GVISOR_RUNTIME", "");
        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::InvalidConfiguration(_))));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_use_gvisor_false_string_is_disabled() {
        clear_env();
        std::env::set_var("SANDBOX_USE_GVISOR", "false");
        let config = Config::from_env().unwrap();
        assert!(!config.use_gvisor);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_bind_addr() {
        clear_env();
        std::env::set_var("SANDBOX_BIND_ADDR", "not-an-address");
        let result = Config::from_env();
        assert!(result.is_err());
        clear_env();
    }
}
