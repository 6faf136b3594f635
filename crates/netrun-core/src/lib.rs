//! # netrun-core
//!
//! Core types for netrun, the concurrency core behind unattended,
//! at-scale configuration operations on third-party network devices.
//!
//! ## Core Paradigm
//!
//! - A batch job is partitioned once into immutable buckets
//! - Manual-OTP devices are coordinated per (department, device group)
//! - "Waiting on a human" is a first-class outcome, never a failure
//! - Cross-process coordination state lives in an external TTL store

mod config;
mod error;
mod types;

pub use config::{
    BatchConfig, BreakerConfig, BridgeConfig, NetrunConfig, OtpConfig, PoolConfig,
};
pub use error::{NetrunError, Result};
pub use types::*;
