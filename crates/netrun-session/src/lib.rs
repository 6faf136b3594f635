//! # netrun-session
//!
//! Session layer for netrun: the protocol-driver seam, a bounded
//! health-checked pool of authenticated sessions, a circuit breaker for
//! fragile storage dependencies, and credential resolution.
//!
//! ## Key Pattern
//!
//! All I/O happens outside locks. The pool reserves a key before probing
//! or opening so no two callers ever share a session, and the breaker's
//! mutex guards counters only, never the protected call itself.

mod circuit_breaker;
mod credentials;
mod driver;
mod pool;

pub use circuit_breaker::{BreakerStats, CircuitBreaker, CircuitState};
pub use credentials::{CredentialResolver, OtpCodeSource, SecretVault};
pub use driver::{DeviceSession, SessionDriver};
pub use pool::{ConnectionPool, PoolHandle, PoolKey, PoolStats};

#[cfg(any(test, feature = "test-support"))]
pub use credentials::mock as credential_mock;
#[cfg(any(test, feature = "test-support"))]
pub use driver::mock as driver_mock;
