//! Sync-to-async execution bridge
//!
//! Worker processes consume jobs from a synchronous task-queue framework
//! but run device operations as async I/O. The bridge owns exactly one
//! background thread running one event loop per process; worker threads
//! submit futures to it and block for the result, so many concurrent
//! device sessions multiplex over one loop without one OS thread per
//! device and without nesting event loops.
//!
//! The bridge is an explicitly constructed, explicitly owned object -
//! inject it into workers at startup rather than hiding it in a global.
//! On fork-based worker pools, construct and initialize it in the child
//! after the fork, never before: a loop inherited across a fork is
//! corrupt.

use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::thread::{self, ThreadId};

use netrun_core::{BridgeConfig, NetrunError, Result};

struct BridgeInner {
    handle: tokio::runtime::Handle,
    thread: Option<thread::JoinHandle<()>>,
    thread_id: ThreadId,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

/// Process-wide bridge between sync workers and one async event loop
///
/// `initialize` is idempotent; `run` may be called from any thread except
/// the loop's own; `shutdown` cancels outstanding work with a bounded
/// grace period. Lifecycle is tied to worker-process start/stop hooks.
pub struct ExecutionBridge {
    config: BridgeConfig,
    inner: Mutex<Option<BridgeInner>>,
}

impl ExecutionBridge {
    /// Create an uninitialized bridge; call [`initialize`](Self::initialize)
    /// from the worker-process start hook
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(None),
        }
    }

    /// Ensure the singleton loop/thread pair is running
    ///
    /// Idempotent and lock-guarded: concurrent calls yield exactly one
    /// live loop. Blocks up to the configured ready timeout for the loop
    /// thread's ready signal. If a previous loop thread has died, a fresh
    /// one is started.
    pub fn initialize(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.as_ref() {
            let alive = existing
                .thread
                .as_ref()
                .map(|t| !t.is_finished())
                .unwrap_or(false);
            if alive {
                return Ok(());
            }
            tracing::warn!("Bridge loop thread died, restarting");
            *inner = None;
        }

        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let grace = self.config.shutdown_grace();

        let thread = thread::Builder::new()
            .name("netrun-bridge".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(NetrunError::Other(format!(
                            "failed to build bridge runtime: {}",
                            e
                        ))));
                        return;
                    }
                };

                let _ = ready_tx.send(Ok((
                    runtime.handle().clone(),
                    thread::current().id(),
                )));

                // Park on the shutdown signal; submitted tasks run on
                // this same loop in the meantime
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });

                tracing::debug!("Bridge loop stopping, draining with {:?} grace", grace);
                runtime.shutdown_timeout(grace);
            })
            .map_err(|e| NetrunError::Other(format!("failed to spawn bridge thread: {}", e)))?;

        let (handle, thread_id) = ready_rx
            .recv_timeout(self.config.ready_timeout())
            .map_err(|_| {
                NetrunError::Other("timed out waiting for bridge ready signal".to_string())
            })??;

        tracing::info!("Execution bridge initialized");
        *inner = Some(BridgeInner {
            handle,
            thread: Some(thread),
            thread_id,
            shutdown_tx: Some(shutdown_tx),
        });
        Ok(())
    }

    /// Schedule `fut` onto the loop and block until it completes
    ///
    /// Results and errors propagate unchanged. Fails with
    /// [`NetrunError::WrongThread`] on the bridge's own loop thread (that
    /// would deadlock), [`NetrunError::NestedRuntime`] when the calling
    /// thread is already inside an async runtime, and
    /// [`NetrunError::BridgeNotInitialized`] when the loop is absent or
    /// dead. No ordering is guaranteed between independently submitted
    /// futures.
    pub fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = {
            let inner = self.inner.lock().unwrap();
            let inner = inner.as_ref().ok_or(NetrunError::BridgeNotInitialized)?;

            if thread::current().id() == inner.thread_id {
                return Err(NetrunError::WrongThread);
            }
            if tokio::runtime::Handle::try_current().is_ok() {
                return Err(NetrunError::NestedRuntime);
            }
            let alive = inner
                .thread
                .as_ref()
                .map(|t| !t.is_finished())
                .unwrap_or(false);
            if !alive {
                return Err(NetrunError::BridgeNotInitialized);
            }
            inner.handle.clone()
        };

        // Thread-safe handoff: the loop completes the sender, we block on
        // the receiver. If shutdown aborts the task, the sender drops and
        // recv fails.
        let (tx, rx) = std_mpsc::channel();
        handle.spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx.recv().map_err(|_| NetrunError::BridgeShutdown)
    }

    /// Stop the loop, cancelling in-flight work with the configured grace
    /// period, and join the thread. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        let taken = self.inner.lock().unwrap().take();
        let Some(mut inner) = taken else {
            return Ok(());
        };

        if let Some(tx) = inner.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = inner.thread.take() {
            // The loop exits promptly on the signal; task draining is
            // bounded by shutdown_timeout inside the thread
            if thread.join().is_err() {
                tracing::error!("Bridge loop thread panicked during shutdown");
            }
        }
        tracing::info!("Execution bridge shut down");
        Ok(())
    }

    /// Whether the loop thread is currently alive
    pub fn is_running(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .as_ref()
            .and_then(|i| i.thread.as_ref())
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ExecutionBridge {
    fn drop(&mut self) {
        // Teardown safety net; normal paths call shutdown() explicitly
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn bridge() -> ExecutionBridge {
        ExecutionBridge::new(BridgeConfig::default())
    }

    #[test]
    fn test_run_before_initialize_fails() {
        let bridge = bridge();
        let err = bridge.run(async { 1 }).unwrap_err();
        assert!(matches!(err, NetrunError::BridgeNotInitialized));
    }

    #[test]
    fn test_run_returns_value_and_propagates_errors() {
        let bridge = bridge();
        bridge.initialize().unwrap();

        assert_eq!(bridge.run(async { 2 + 2 }).unwrap(), 4);

        let result: Result<()> = bridge
            .run(async { Err(NetrunError::Session("boom".to_string())) })
            .unwrap();
        assert!(matches!(result, Err(NetrunError::Session(_))));

        bridge.shutdown().unwrap();
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let bridge = bridge();
        bridge.initialize().unwrap();
        bridge.initialize().unwrap();
        assert!(bridge.is_running());
        bridge.shutdown().unwrap();
        assert!(!bridge.is_running());
    }

    #[test]
    fn test_concurrent_initialize_yields_one_loop() {
        let bridge = Arc::new(bridge());

        let mut threads = Vec::new();
        for _ in 0..8 {
            let bridge = Arc::clone(&bridge);
            threads.push(thread::spawn(move || bridge.initialize().unwrap()));
        }
        for t in threads {
            t.join().unwrap();
        }

        assert!(bridge.is_running());
        bridge.shutdown().unwrap();
    }

    #[test]
    fn test_many_threads_submit_concurrently() {
        let bridge = Arc::new(bridge());
        bridge.initialize().unwrap();

        let mut threads = Vec::new();
        for i in 0..16u64 {
            let bridge = Arc::clone(&bridge);
            threads.push(thread::spawn(move || {
                bridge
                    .run(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        i * 2
                    })
                    .unwrap()
            }));
        }

        let mut total = 0;
        for t in threads {
            total += t.join().unwrap();
        }
        assert_eq!(total, (0..16u64).map(|i| i * 2).sum::<u64>());
        bridge.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_run_inside_runtime_is_refused() {
        let bridge = bridge();
        bridge.initialize().unwrap();

        let err = bridge.run(async { 1 }).unwrap_err();
        assert!(matches!(err, NetrunError::NestedRuntime));

        // shutdown() joins a thread; hop off the runtime for it
        tokio::task::spawn_blocking(move || bridge.shutdown().unwrap())
            .await
            .unwrap();
    }

    #[test]
    fn test_run_from_loop_thread_is_refused() {
        let bridge = Arc::new(bridge());
        bridge.initialize().unwrap();

        // Submitting from inside a task on the loop thread would deadlock;
        // the thread check must win over the nested-runtime check so the
        // caller learns the real hazard
        let probe = Arc::clone(&bridge);
        let refused = bridge
            .run(async move { matches!(probe.run(async { 1 }), Err(NetrunError::WrongThread)) })
            .unwrap();
        assert!(refused);
        bridge.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let bridge = bridge();
        bridge.initialize().unwrap();
        bridge.shutdown().unwrap();
        bridge.shutdown().unwrap();

        let err = bridge.run(async { 1 }).unwrap_err();
        assert!(matches!(err, NetrunError::BridgeNotInitialized));
    }

    #[test]
    fn test_reinitialize_after_shutdown() {
        let bridge = bridge();
        bridge.initialize().unwrap();
        bridge.shutdown().unwrap();

        bridge.initialize().unwrap();
        assert_eq!(bridge.run(async { 7 }).unwrap(), 7);
        bridge.shutdown().unwrap();
    }
}
