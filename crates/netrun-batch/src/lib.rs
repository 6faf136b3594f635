//! # netrun-batch
//!
//! Batch orchestration for netrun: the sync-to-async execution bridge,
//! job partitioning, OTP pause/resume coordination over a shared TTL
//! store, and the batch runner that drives devices through the session
//! pool and circuit breaker.
//!
//! A worker thread typically does:
//!
//! 1. `bridge.initialize()` once at process start
//! 2. `bridge.run(runner.run_batch(...))` per consumed task
//! 3. inspect the [`BatchReport`](netrun_core::BatchReport): paused
//!    groups go back to the queue once a human submits the code

pub mod bridge;
pub mod grouper;
pub mod otp;
pub mod runner;
pub mod store;

pub use bridge::ExecutionBridge;
pub use grouper::partition;
pub use otp::{OtpCoordinator, OtpPauseRecord};
pub use runner::{ArtifactSink, BatchRunner, DeviceJob, LogNotifier, Notifier};
pub use store::{MemoryTtlStore, TtlStore};

#[cfg(feature = "redis-store")]
pub use store::RedisTtlStore;
