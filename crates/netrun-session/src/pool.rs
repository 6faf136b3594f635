//! Bounded pool of reusable authenticated device sessions
//!
//! Sessions are cached per (host, port, username) and reused until they age
//! out, go idle too long, or fail a liveness probe. The pool never holds
//! more than `max_connections` live entries, counting sessions currently
//! handed out.
//!
//! ## Locking discipline
//!
//! One mutex protects the entry map; it is never held across I/O. An
//! acquire reserves its key by *taking the entry out of the map* under the
//! lock, then probes or opens outside the lock. A second acquire for the
//! same key waits for the reservation to clear, so two handles for one key
//! can never coexist. Unrelated keys are never blocked by a slow probe.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use netrun_core::{Credential, NetrunError, Platform, PoolConfig, Result};
use tokio::sync::Notify;

use crate::driver::{DeviceSession, SessionDriver};

/// Pool key: endpoint identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// A cached authenticated session plus its bookkeeping
pub struct PooledConnection {
    session: Box<dyn DeviceSession>,
    key: PoolKey,
    platform: Platform,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
}

impl PooledConnection {
    fn new(session: Box<dyn DeviceSession>, key: PoolKey, platform: Platform) -> Self {
        let now = Instant::now();
        Self {
            session,
            key,
            platform,
            created_at: now,
            last_used_at: now,
            use_count: 0,
        }
    }

    fn touch(&mut self) {
        self.last_used_at = Instant::now();
        self.use_count += 1;
    }

    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn idle(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    /// Age/idle window check; the live probe happens separately
    fn within_window(&self, config: &PoolConfig) -> bool {
        self.age() < config.max_age() && self.idle() < config.max_idle()
    }
}

/// Read-only pool counters for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Cached entries currently in the map
    pub size: usize,
    /// Entries handed out right now
    pub in_use: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Entries dropped via discard, failed probes, or sweeps
    pub discarded: u64,
}

struct PoolState {
    entries: HashMap<PoolKey, PooledConnection>,
    /// Keys whose entry is currently handed out (or being opened)
    reserved: HashSet<PoolKey>,
    closed: bool,
    hits: u64,
    misses: u64,
    evictions: u64,
    discarded: u64,
}

struct PoolShared {
    state: Mutex<PoolState>,
    /// Woken whenever a reservation clears or the pool closes
    released: Notify,
}

/// An acquired session, exclusively owned until released
///
/// Dropping a handle without [`ConnectionPool::release`] counts as a
/// discard: the session cannot be gracefully closed from `Drop`, so the
/// pool forgets the key rather than resurrecting an entry in unknown state.
pub struct PoolHandle {
    conn: Option<PooledConnection>,
    reused: bool,
    shared: Arc<PoolShared>,
}

impl PoolHandle {
    /// Whether this session came from the cache
    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn key(&self) -> &PoolKey {
        // conn is only None after release consumed the handle
        &self.conn.as_ref().unwrap().key
    }

    pub fn platform(&self) -> Platform {
        self.conn.as_ref().unwrap().platform
    }

    pub fn use_count(&self) -> u64 {
        self.conn.as_ref().unwrap().use_count
    }

    /// The live session, for sending commands
    pub fn session(&mut self) -> &mut Box<dyn DeviceSession> {
        &mut self.conn.as_mut().unwrap().session
    }
}

// Manual impl: the boxed session has no Debug
impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("key", &self.conn.as_ref().map(|c| &c.key))
            .field("reused", &self.reused)
            .finish()
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!("Pool handle for {} dropped without release, discarding", conn.key);
            let mut state = self.shared.state.lock().unwrap();
            state.reserved.remove(&conn.key);
            state.discarded += 1;
            drop(state);
            self.shared.released.notify_waiters();
        }
    }
}

/// Bounded, health-checked cache of authenticated sessions
pub struct ConnectionPool {
    config: PoolConfig,
    driver: Arc<dyn SessionDriver>,
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, driver: Arc<dyn SessionDriver>) -> Self {
        Self {
            config,
            driver,
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    entries: HashMap::new(),
                    reserved: HashSet::new(),
                    closed: false,
                    hits: 0,
                    misses: 0,
                    evictions: 0,
                    discarded: 0,
                }),
                released: Notify::new(),
            }),
        }
    }

    /// Acquire a session for the endpoint, reusing a healthy cached one
    ///
    /// Cache hit: the entry is taken out of the map (reserving the key),
    /// probed outside the lock, touched and returned if healthy. Cache
    /// miss: evicts the largest-idle cached entry if at capacity - or, when
    /// every slot is a handed-out handle, waits for a release - then opens
    /// a fresh session. Concurrent acquires for the same key serialize.
    pub async fn acquire(
        &self,
        host: &str,
        credential: &Credential,
        platform: Platform,
        port: u16,
    ) -> Result<PoolHandle> {
        let key = PoolKey {
            host: host.to_string(),
            port,
            username: credential.username.clone(),
        };

        // Reserve the key, waiting out any holder of the same key
        let cached = loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            // Register before checking, so a release between the check and
            // the await cannot be missed
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.closed {
                    return Err(NetrunError::PoolClosed);
                }
                if !state.reserved.contains(&key) {
                    state.reserved.insert(key.clone());
                    break state.entries.remove(&key);
                }
            }
            notified.await;
        };

        // Probe the cached entry outside the lock
        if let Some(mut conn) = cached {
            if self.probe(&mut conn).await {
                conn.touch();
                let mut state = self.shared.state.lock().unwrap();
                state.hits += 1;
                drop(state);
                tracing::debug!("Pool hit for {} (use_count {})", conn.key, conn.use_count);
                return Ok(PoolHandle {
                    conn: Some(conn),
                    reused: true,
                    shared: Arc::clone(&self.shared),
                });
            }
            tracing::debug!("Cached session for {} is unhealthy, recycling", key);
            if let Err(e) = conn.session.close().await {
                tracing::debug!("Error closing unhealthy session for {}: {}", key, e);
            }
            let mut state = self.shared.state.lock().unwrap();
            state.discarded += 1;
        }

        // Miss: make room, counting our own reservation against capacity.
        // With nothing evictable (every slot handed out), wait for a release
        // instead of opening over capacity.
        self.shared.state.lock().unwrap().misses += 1;
        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let evicted = {
                let mut state = self.shared.state.lock().unwrap();
                if state.closed {
                    state.reserved.remove(&key);
                    drop(state);
                    self.shared.released.notify_waiters();
                    return Err(NetrunError::PoolClosed);
                }
                if state.entries.len() + state.reserved.len() <= self.config.max_connections {
                    break;
                }
                Self::pick_victim(&state.entries).map(|k| {
                    state.evictions += 1;
                    // unwrap is fine: the key came from the map just now
                    state.entries.remove(&k).unwrap()
                })
            };
            match evicted {
                Some(mut evicted) => {
                    tracing::info!(
                        "Evicting idle session {} to make room for {}",
                        evicted.key,
                        key
                    );
                    if let Err(e) = evicted.session.close().await {
                        tracing::debug!("Error closing evicted session {}: {}", evicted.key, e);
                    }
                }
                None => notified.await,
            }
        }

        // Open a fresh session outside the lock; the reservation holds the slot
        let opened = self
            .driver
            .open(host, port, credential, platform)
            .await;
        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                let mut state = self.shared.state.lock().unwrap();
                state.reserved.remove(&key);
                drop(state);
                self.shared.released.notify_waiters();
                return Err(e);
            }
        };

        let mut conn = PooledConnection::new(session, key, platform);
        conn.touch();
        tracing::debug!("Opened fresh session for {}", conn.key);
        Ok(PoolHandle {
            conn: Some(conn),
            reused: false,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Return a session to the pool
    ///
    /// `discard` (or releasing after an error) closes the session instead
    /// of caching it.
    pub async fn release(&self, mut handle: PoolHandle, discard: bool) -> Result<()> {
        let mut conn = match handle.conn.take() {
            Some(conn) => conn,
            None => return Ok(()),
        };
        let key = conn.key.clone();

        let to_close = {
            let mut state = self.shared.state.lock().unwrap();
            state.reserved.remove(&key);
            // The map itself must honor capacity even under handle churn
            let has_room =
                state.entries.len() + state.reserved.len() < self.config.max_connections;
            if !discard && !state.closed && has_room {
                conn.last_used_at = Instant::now();
                state.entries.insert(key.clone(), conn);
                None
            } else {
                state.discarded += 1;
                Some(conn)
            }
        };
        self.shared.released.notify_waiters();

        if let Some(mut conn) = to_close {
            if let Err(e) = conn.session.close().await {
                tracing::debug!("Error closing discarded session {}: {}", key, e);
            }
        }
        Ok(())
    }

    /// Sweep and close entries past their idle/age windows
    ///
    /// Intended to run on a timer, independent of acquire/release traffic.
    /// Returns how many entries were closed. In-use sessions are exempt.
    pub async fn cleanup_idle(&self) -> Result<usize> {
        let stale: Vec<PooledConnection> = {
            let mut state = self.shared.state.lock().unwrap();
            let keys: Vec<PoolKey> = state
                .entries
                .iter()
                .filter(|(_, conn)| !conn.within_window(&self.config))
                .map(|(k, _)| k.clone())
                .collect();
            let removed: Vec<PooledConnection> = keys
                .iter()
                .filter_map(|k| state.entries.remove(k))
                .collect();
            state.discarded += removed.len() as u64;
            removed
        };

        let count = stale.len();
        for mut conn in stale {
            tracing::debug!("Sweeping stale session {} (idle {:?})", conn.key, conn.idle());
            if let Err(e) = conn.session.close().await {
                tracing::debug!("Error closing swept session {}: {}", conn.key, e);
            }
        }
        if count > 0 {
            tracing::info!("Idle sweep closed {} sessions", count);
        }
        Ok(count)
    }

    /// Close every cached session and refuse further acquires
    pub async fn close(&self) -> Result<()> {
        let drained: Vec<PooledConnection> = {
            let mut state = self.shared.state.lock().unwrap();
            state.closed = true;
            state.entries.drain().map(|(_, conn)| conn).collect()
        };
        self.shared.released.notify_waiters();

        for mut conn in drained {
            if let Err(e) = conn.session.close().await {
                tracing::debug!("Error closing session {} at pool close: {}", conn.key, e);
            }
        }
        tracing::info!("Connection pool closed");
        Ok(())
    }

    /// Counter snapshot
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock().unwrap();
        PoolStats {
            size: state.entries.len(),
            in_use: state.reserved.len(),
            capacity: self.config.max_connections,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            discarded: state.discarded,
        }
    }

    /// Largest idle time wins; exact ties evict the smallest key
    fn pick_victim(entries: &HashMap<PoolKey, PooledConnection>) -> Option<PoolKey> {
        entries
            .iter()
            .map(|(k, conn)| (conn.idle(), k))
            .max_by(|(idle_a, key_a), (idle_b, key_b)| {
                idle_a.cmp(idle_b).then_with(|| key_b.cmp(key_a))
            })
            .map(|(_, k)| k.clone())
    }

    /// Health probe; runs outside the map lock. Never propagates errors -
    /// a failed probe just marks the entry unhealthy.
    async fn probe(&self, conn: &mut PooledConnection) -> bool {
        if !conn.within_window(&self.config) {
            return false;
        }
        if !self.config.probe_on_acquire {
            return true;
        }
        match conn.session.prompt().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Liveness probe failed for {}: {}", conn.key, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;

    fn test_config(max_connections: usize) -> PoolConfig {
        PoolConfig {
            max_connections,
            max_age_secs: 3600,
            max_idle_secs: 600,
            probe_on_acquire: true,
        }
    }

    fn cred() -> Credential {
        Credential {
            username: "netops".to_string(),
            secret: "s3cret".to_string(),
        }
    }

    fn pool_with(driver: MockDriver, max: usize) -> ConnectionPool {
        ConnectionPool::new(test_config(max), Arc::new(driver))
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_session() {
        let pool = pool_with(MockDriver::new(), 4);

        let handle = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap();
        assert!(!handle.reused());
        pool.release(handle, false).await.unwrap();

        let handle = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap();
        assert!(handle.reused());
        assert_eq!(handle.use_count(), 2);
        pool.release(handle, false).await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn test_discard_removes_entry() {
        let pool = pool_with(MockDriver::new(), 4);

        let handle = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap();
        pool.release(handle, true).await.unwrap();

        let handle = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap();
        assert!(!handle.reused());
        pool.release(handle, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_evicts_largest_idle() {
        // Scenario: capacity 2; A idles longest, so C's arrival evicts A
        let pool = pool_with(MockDriver::new(), 2);

        let a = pool.acquire("sw-a", &cred(), Platform::IosXe, 22).await.unwrap();
        pool.release(a, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let b = pool.acquire("sw-b", &cred(), Platform::IosXe, 22).await.unwrap();
        pool.release(b, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let c = pool.acquire("sw-c", &cred(), Platform::IosXe, 22).await.unwrap();
        pool.release(c, false).await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 2);

        // B survived, A did not
        let b = pool.acquire("sw-b", &cred(), Platform::IosXe, 22).await.unwrap();
        assert!(b.reused());
        pool.release(b, false).await.unwrap();
        let a = pool.acquire("sw-a", &cred(), Platform::IosXe, 22).await.unwrap();
        assert!(!a.reused());
        pool.release(a, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_capacity() {
        let pool = pool_with(MockDriver::new(), 3);

        for i in 0..10 {
            let host = format!("sw{}", i);
            let handle = pool.acquire(&host, &cred(), Platform::IosXe, 22).await.unwrap();
            pool.release(handle, false).await.unwrap();
            let stats = pool.stats();
            assert!(stats.size + stats.in_use <= 3, "capacity exceeded: {:?}", stats);
        }
    }

    #[tokio::test]
    async fn test_acquire_waits_when_capacity_held_by_handles() {
        // Capacity 2, both slots handed out: a third acquire must park on
        // the release signal, never open a session over capacity
        let pool = Arc::new(pool_with(MockDriver::new(), 2));

        let a = pool.acquire("sw-a", &cred(), Platform::IosXe, 22).await.unwrap();
        let b = pool.acquire("sw-b", &cred(), Platform::IosXe, 22).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.acquire("sw-c", &cred(), Platform::IosXe, 22).await.unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        let stats = pool.stats();
        assert!(stats.size + stats.in_use <= 2, "capacity exceeded: {:?}", stats);

        // Releasing A frees a slot for the waiter
        pool.release(a, false).await.unwrap();
        let c = waiter.await.unwrap();
        let stats = pool.stats();
        assert!(stats.size + stats.in_use <= 2, "capacity exceeded: {:?}", stats);

        pool.release(b, false).await.unwrap();
        pool.release(c, false).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_failed_probe_recycles_entry() {
        let driver = MockDriver::new();
        // Sessions snapshot this set at open time, so poison it up front
        driver.fail_probes_for("sw1");
        let counters = Arc::clone(&driver.counters);
        let pool = pool_with(driver, 4);

        let handle = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap();
        pool.release(handle, false).await.unwrap();

        // The cached session flunks its liveness probe; a fresh one is opened
        let handle = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap();
        assert!(!handle.reused());
        pool.release(handle, false).await.unwrap();
        assert_eq!(counters.opened.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_entry_past_idle_window_recycled_on_acquire() {
        let pool = pool_with(MockDriver::new(), 4);

        let handle = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap();
        pool.release(handle, false).await.unwrap();

        // Backdate the entry past its idle window
        {
            let mut state = pool.shared.state.lock().unwrap();
            let key = PoolKey {
                host: "sw1".to_string(),
                port: 22,
                username: "netops".to_string(),
            };
            state.entries.get_mut(&key).unwrap().last_used_at =
                Instant::now() - Duration::from_secs(3600);
        }

        let handle = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap();
        assert!(!handle.reused());
        pool.release(handle, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_failure_clears_reservation() {
        let pool = pool_with(MockDriver::new().with_open_failure("sw1"), 4);

        let err = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap_err();
        assert!(matches!(err, NetrunError::Session(_)));

        // The slot must not leak: a later acquire for the key still works
        let err = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap_err();
        assert!(matches!(err, NetrunError::Session(_)));
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let pool = pool_with(MockDriver::new(), 4);
        let handle = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap();
        pool.release(handle, false).await.unwrap();

        pool.close().await.unwrap();
        let err = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap_err();
        assert!(matches!(err, NetrunError::PoolClosed));
        assert_eq!(pool.stats().size, 0);
    }

    #[tokio::test]
    async fn test_cleanup_idle_sweeps_stale_entries() {
        let driver = MockDriver::new();
        let counters = Arc::clone(&driver.counters);
        let pool = pool_with(driver, 4);

        for host in ["sw1", "sw2"] {
            let handle = pool.acquire(host, &cred(), Platform::IosXe, 22).await.unwrap();
            pool.release(handle, false).await.unwrap();
        }

        // Backdate one entry past the idle window
        {
            let mut state = pool.shared.state.lock().unwrap();
            let key = PoolKey {
                host: "sw1".to_string(),
                port: 22,
                username: "netops".to_string(),
            };
            state.entries.get_mut(&key).unwrap().last_used_at =
                Instant::now() - Duration::from_secs(601);
        }

        let swept = pool.cleanup_idle().await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(pool.stats().size, 1);
        assert_eq!(counters.closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_same_key_serialize() {
        let driver = MockDriver::new();
        let counters = Arc::clone(&driver.counters);
        let pool = Arc::new(pool_with(driver, 4));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                let h = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
                pool.release(h, false).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // One physical session served all eight acquires
        assert_eq!(counters.opened.load(std::sync::atomic::Ordering::SeqCst), 1);
        let stats = pool.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_discard() {
        let pool = pool_with(MockDriver::new(), 4);

        let handle = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap();
        drop(handle);

        assert_eq!(pool.stats().in_use, 0);
        // The key is free again
        let handle = pool.acquire("sw1", &cred(), Platform::IosXe, 22).await.unwrap();
        assert!(!handle.reused());
        pool.release(handle, false).await.unwrap();
    }
}
