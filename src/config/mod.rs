//! Configuration management for the deployment gate
//!
//! Handles server, storage, signing key, sandbox and pipeline parameters. Every
//! value has a default and can be overridden with a `DEPLOY_GATE_*` environment
//! variable for container deployment.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database and audit file configuration
    pub database: DatabaseConfig,
    /// Binding token key material
    pub token: TokenConfig,
    /// Dynamic verification limits
    pub sandbox: SandboxConfig,
    /// Orchestrator retry policy and collaborators
    pub pipeline: PipelineConfig,
    /// Log verbosity ("trace", "debug", "info", "warn", "error")
    pub log_level: String,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Base directory holding `gate.db` and `audit.jsonl` (default: "data")
    pub data_dir: String,
}

/// Signing key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Path of the hex-encoded Ed25519 seed. Generated on first start when missing.
    pub signing_key_path: String,
}

/// Sandbox limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Hard wall-clock budget per verification
    pub timeout_ms: u64,
    /// Lua heap cap in bytes
    pub memory_limit_bytes: usize,
    /// Maximum simultaneous sandboxes
    pub max_concurrent: usize,
    /// Modules resolvable inside the sandbox besides the artifact's own files
    pub allowed_modules: Vec<String>,
    /// Version string exposed by the stub SDK module
    pub sdk_version: String,
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retries after the first `RegistryUnavailable` during registration and read-back
    pub registry_max_retries: u32,
    /// Base backoff between registry attempts
    pub registry_backoff_ms: u64,
    /// Backoff ceiling
    pub registry_backoff_max_ms: u64,
    /// Restate-style admin endpoint. When unset the in-process registry is used.
    pub registry_admin_url: Option<String>,
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PipelineConfig {
    /// Exponential backoff for the given zero-based retry attempt, capped at the ceiling
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplied = self
            .registry_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(multiplied.min(self.registry_backoff_max_ms))
    }
}

/// Read an environment variable, falling back to the default on absence or parse failure
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: env_or("DEPLOY_GATE_SANDBOX_TIMEOUT_MS", 2_000),
            memory_limit_bytes: env_or("DEPLOY_GATE_SANDBOX_MEMORY_BYTES", 32 * 1024 * 1024),
            max_concurrent: env_or("DEPLOY_GATE_SANDBOX_CONCURRENCY", 4),
            allowed_modules: std::env::var("DEPLOY_GATE_SANDBOX_MODULES")
                .map(|list| {
                    list.split(',')
                        .map(|m| m.trim().to_string())
                        .filter(|m| !m.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| vec!["restate".to_string(), "workflow-sdk".to_string()]),
            sdk_version: env_or("DEPLOY_GATE_SDK_VERSION", "1.0.0".to_string()),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            registry_max_retries: env_or("DEPLOY_GATE_REGISTRY_RETRIES", 3),
            registry_backoff_ms: env_or("DEPLOY_GATE_REGISTRY_BACKOFF_MS", 200),
            registry_backoff_max_ms: env_or("DEPLOY_GATE_REGISTRY_BACKOFF_MAX_MS", 5_000),
            registry_admin_url: std::env::var("DEPLOY_GATE_REGISTRY_URL").ok(),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let data_dir = env_or("DEPLOY_GATE_DATA_DIR", "data".to_string());
        Self {
            server: ServerConfig {
                host: env_or("DEPLOY_GATE_HOST", "0.0.0.0".to_string()),
                port: env_or("DEPLOY_GATE_PORT", 3004),
            },
            token: TokenConfig {
                signing_key_path: env_or(
                    "DEPLOY_GATE_SIGNING_KEY",
                    format!("{}/binding_key.hex", data_dir),
                ),
            },
            database: DatabaseConfig { data_dir },
            sandbox: SandboxConfig::default(),
            pipeline: PipelineConfig::default(),
            log_level: env_or("DEPLOY_GATE_LOG_LEVEL", "info".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(base: u64, max: u64) -> PipelineConfig {
        PipelineConfig {
            registry_max_retries: 3,
            registry_backoff_ms: base,
            registry_backoff_max_ms: max,
            registry_admin_url: None,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let cfg = pipeline(100, 10_000);
        assert_eq!(cfg.backoff(0), Duration::from_millis(100));
        assert_eq!(cfg.backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let cfg = pipeline(100, 250);
        assert_eq!(cfg.backoff(5), Duration::from_millis(250));
        assert_eq!(cfg.backoff(64), Duration::from_millis(250));
    }

    #[test]
    fn sandbox_defaults_whitelist_sdk_modules() {
        let cfg = SandboxConfig {
            allowed_modules: vec!["restate".into()],
            ..SandboxConfig::default()
        };
        assert!(cfg.allowed_modules.contains(&"restate".to_string()));
        assert!(cfg.timeout() > Duration::ZERO);
    }
}
