//! Session driver seam
//!
//! The remote-session protocol driver is an external collaborator. netrun
//! only assumes the primitives here: open a session with a resolved
//! credential, send a command, fetch the current prompt, close. Everything
//! vendor-specific (SSH transport, prompt handling, paging) lives behind
//! these traits.

use async_trait::async_trait;
use netrun_core::{Credential, Platform, Result};

/// An open, authenticated session against one device
#[async_trait]
pub trait DeviceSession: Send {
    /// Send a command and return its raw text output
    async fn send_command(&mut self, command: &str) -> Result<String>;

    /// Fetch the current prompt; used as a lightweight liveness probe
    async fn prompt(&mut self) -> Result<String>;

    /// Close the session; idempotent
    async fn close(&mut self) -> Result<()>;
}

/// Opens authenticated sessions
///
/// Authentication failures must surface as [`netrun_core::NetrunError::Auth`]
/// so the batch runner can distinguish a rejected credential from a
/// transport failure.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    async fn open(
        &self,
        host: &str,
        port: u16,
        credential: &Credential,
        platform: Platform,
    ) -> Result<Box<dyn DeviceSession>>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    //! Scripted driver/session doubles for tests

    use super::*;
    use netrun_core::NetrunError;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Shared counters observed by tests
    #[derive(Debug, Default)]
    pub struct MockCounters {
        pub opened: AtomicUsize,
        pub closed: AtomicUsize,
        pub probes: AtomicUsize,
    }

    /// A scripted driver: canned command responses, per-host failure injection
    #[derive(Default)]
    pub struct MockDriver {
        responses: HashMap<String, String>,
        auth_fail_hosts: HashSet<String>,
        open_fail_hosts: HashSet<String>,
        probe_fail_hosts: Mutex<HashSet<String>>,
        pub counters: Arc<MockCounters>,
    }

    impl MockDriver {
        pub fn new() -> Self {
            Self::default()
        }

        /// Return `output` for `command` on every session
        pub fn with_response(mut self, command: &str, output: &str) -> Self {
            self.responses.insert(command.to_string(), output.to_string());
            self
        }

        /// Sessions to `host` fail authentication
        pub fn with_auth_failure(mut self, host: &str) -> Self {
            self.auth_fail_hosts.insert(host.to_string());
            self
        }

        /// Sessions to `host` fail to open (transport error)
        pub fn with_open_failure(mut self, host: &str) -> Self {
            self.open_fail_hosts.insert(host.to_string());
            self
        }

        /// Make future prompt probes against `host` fail
        pub fn fail_probes_for(&self, host: &str) {
            self.probe_fail_hosts
                .lock()
                .unwrap()
                .insert(host.to_string());
        }
    }

    #[async_trait]
    impl SessionDriver for MockDriver {
        async fn open(
            &self,
            host: &str,
            _port: u16,
            credential: &Credential,
            _platform: Platform,
        ) -> Result<Box<dyn DeviceSession>> {
            if self.open_fail_hosts.contains(host) {
                return Err(NetrunError::Session(format!("connect to {} refused", host)));
            }
            if self.auth_fail_hosts.contains(host) || credential.secret == "bad-code" {
                return Err(NetrunError::Auth(format!(
                    "device {} rejected credentials for {}",
                    host, credential.username
                )));
            }
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSession {
                host: host.to_string(),
                responses: self.responses.clone(),
                probe_fail_hosts: Arc::new(Mutex::new(
                    self.probe_fail_hosts.lock().unwrap().clone(),
                )),
                counters: Arc::clone(&self.counters),
                sent: Vec::new(),
                closed: false,
            }))
        }
    }

    /// Session double returned by [`MockDriver`]
    pub struct MockSession {
        host: String,
        responses: HashMap<String, String>,
        probe_fail_hosts: Arc<Mutex<HashSet<String>>>,
        counters: Arc<MockCounters>,
        /// Commands sent over this session, in order
        pub sent: Vec<String>,
        closed: bool,
    }

    #[async_trait]
    impl DeviceSession for MockSession {
        async fn send_command(&mut self, command: &str) -> Result<String> {
            if self.closed {
                return Err(NetrunError::Session("session closed".to_string()));
            }
            self.sent.push(command.to_string());
            Ok(self
                .responses
                .get(command)
                .cloned()
                .unwrap_or_else(|| format!("{}# {}", self.host, command)))
        }

        async fn prompt(&mut self) -> Result<String> {
            self.counters.probes.fetch_add(1, Ordering::SeqCst);
            if self.probe_fail_hosts.lock().unwrap().contains(&self.host) {
                return Err(NetrunError::Session(format!("{}: prompt timeout", self.host)));
            }
            Ok(format!("{}#", self.host))
        }

        async fn close(&mut self) -> Result<()> {
            if !self.closed {
                self.closed = true;
                self.counters.closed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }
}
