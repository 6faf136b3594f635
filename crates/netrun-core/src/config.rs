//! Configuration management for netrun
//!
//! This module provides configuration structures for the batch automation
//! core: pool sizing, circuit breaker thresholds, bridge timeouts, OTP
//! cache TTLs, and batch shaping.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{NetrunError, Result};

/// Top-level netrun configuration
///
/// Loaded from `netrun.toml`, every section falls back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetrunConfig {
    /// Connection pool sizing and health windows
    #[serde(default)]
    pub pool: PoolConfig,

    /// Circuit breaker thresholds for artifact storage
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Execution bridge lifecycle timeouts
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// OTP cache and pause-record TTLs
    #[serde(default)]
    pub otp: OtpConfig,

    /// Batch shaping
    #[serde(default)]
    pub batch: BatchConfig,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum cached sessions per process
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Sessions older than this are recycled even if recently used
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Sessions idle longer than this are recycled
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,

    /// Run a live prompt probe before reusing a cached session
    #[serde(default = "default_probe_on_acquire")]
    pub probe_on_acquire: bool,
}

impl PoolConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Recorded failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds after the last failure before a probe call is allowed
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,

    /// Consecutive half-open successes needed to close again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Execution bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Seconds to wait for the loop thread's ready signal
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    /// Grace period for in-flight work at shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl BridgeConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// OTP coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpConfig {
    /// TTL of a human-entered code (the code's own validity window)
    #[serde(default = "default_code_ttl_secs")]
    pub code_ttl_secs: u64,

    /// TTL of a pause record awaiting resubmission
    #[serde(default = "default_pause_ttl_secs")]
    pub pause_ttl_secs: u64,

    /// TTL of the notification dedup marker
    #[serde(default = "default_notify_ttl_secs")]
    pub notify_ttl_secs: u64,
}

impl OtpConfig {
    pub fn code_ttl(&self) -> Duration {
        Duration::from_secs(self.code_ttl_secs)
    }

    pub fn pause_ttl(&self) -> Duration {
        Duration::from_secs(self.pause_ttl_secs)
    }

    pub fn notify_ttl(&self) -> Duration {
        Duration::from_secs(self.notify_ttl_secs)
    }
}

/// Batch shaping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum devices per dispatched chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Concurrent device operations per chunk
    #[serde(default = "default_device_concurrency")]
    pub device_concurrency: usize,
}

// Default value providers
fn default_max_connections() -> usize {
    20
}

fn default_max_age_secs() -> u64 {
    3600
}

fn default_max_idle_secs() -> u64 {
    600
}

fn default_probe_on_acquire() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    2
}

fn default_ready_timeout_secs() -> u64 {
    10
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_code_ttl_secs() -> u64 {
    60
}

fn default_pause_ttl_secs() -> u64 {
    86_400
}

fn default_notify_ttl_secs() -> u64 {
    86_400
}

fn default_chunk_size() -> usize {
    100
}

fn default_device_concurrency() -> usize {
    10
}

impl NetrunConfig {
    /// Load configuration from a TOML file, or use defaults if absent
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| NetrunError::Config(format!("Failed to parse config file: {}", e)))
        } else {
            Ok(Self::default())
        }
    }

    /// Write the default configuration to a TOML file
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| NetrunError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_age_secs: default_max_age_secs(),
            max_idle_secs: default_max_idle_secs(),
            probe_on_acquire: default_probe_on_acquire(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: default_ready_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            code_ttl_secs: default_code_ttl_secs(),
            pause_ttl_secs: default_pause_ttl_secs(),
            notify_ttl_secs: default_notify_ttl_secs(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            device_concurrency: default_device_concurrency(),
        }
    }
}
