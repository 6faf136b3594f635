//! OTP batch-authentication coordinator
//!
//! One human types one code that covers a whole (department, device group)
//! within its validity window. This coordinator tracks the cached code,
//! the pause bookkeeping for batches blocked on a missing code, and the
//! dedup gate that keeps concurrently-dispatched chunks from prompting the
//! same human twice.
//!
//! All state lives in the shared TTL store - chunks of one group may be
//! handled by different worker processes, so per-process memory is never
//! authoritative.
//!
//! ## Keys
//!
//! - `otp:{dept}:{group}` - the cached code, short TTL
//! - `otp_pause:{dept}:{group}` - JSON pause record, long TTL
//! - `otp_notify:{dept}:{group}:{digest}` - dedup marker, where `digest`
//!   is a SHA-256 over the sorted pending-device set

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use netrun_core::{NetrunError, OtpConfig, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::TtlStore;
use netrun_session::OtpCodeSource;

/// Bookkeeping for a batch paused on a missing code
///
/// Last write for a (dept, group) key fully replaces prior bookkeeping -
/// there is no merge across overlapping pauses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpPauseRecord {
    pub task_id: String,
    pub pending_device_ids: Vec<String>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Coordinates cached codes, pause records, and notification dedup
pub struct OtpCoordinator {
    store: Arc<dyn TtlStore>,
    config: OtpConfig,
}

impl OtpCoordinator {
    pub fn new(store: Arc<dyn TtlStore>, config: OtpConfig) -> Self {
        Self { store, config }
    }

    fn code_key(dept: &str, group: &str) -> String {
        format!("otp:{}:{}", dept, group)
    }

    fn pause_key(dept: &str, group: &str) -> String {
        format!("otp_pause:{}:{}", dept, group)
    }

    fn notify_key(dept: &str, group: &str, pending: &[String]) -> String {
        format!("otp_notify:{}:{}:{}", dept, group, pending_digest(pending))
    }

    /// Return the cached code for the group, or fail with the OTP-required
    /// signal carrying `pending` verbatim
    ///
    /// The read is non-consuming: every device in the group reuses the
    /// same code until TTL expiry or explicit invalidation.
    pub async fn get_or_wait(&self, dept: &str, group: &str, pending: &[String]) -> Result<String> {
        match self.store.get(&Self::code_key(dept, group)).await? {
            Some(code) => Ok(code),
            None => Err(NetrunError::OtpRequired {
                dept: dept.to_string(),
                group: group.to_string(),
                pending_devices: pending.to_vec(),
            }),
        }
    }

    /// Cache a human-entered code for the group
    pub async fn submit_code(&self, dept: &str, group: &str, code: &str) -> Result<()> {
        tracing::info!("OTP code submitted for {}:{}", dept, group);
        self.store
            .set_with_ttl(&Self::code_key(dept, group), code, self.config.code_ttl())
            .await
    }

    /// Drop the cached code the moment any device in the group reports an
    /// authentication failure, so later devices fail fast instead of
    /// retrying a code already known to be rejected
    pub async fn invalidate(&self, dept: &str, group: &str) -> Result<()> {
        tracing::warn!("Invalidating cached OTP code for {}:{}", dept, group);
        self.store.delete(&Self::code_key(dept, group)).await
    }

    /// Persist which task is blocked for the group and which device IDs
    /// remain. Last writer wins: the record is replaced wholesale.
    pub async fn record_pause(
        &self,
        task_id: &str,
        dept: &str,
        group: &str,
        pending_device_ids: Vec<String>,
        reason: &str,
    ) -> Result<()> {
        let record = OtpPauseRecord {
            task_id: task_id.to_string(),
            pending_device_ids,
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        tracing::info!(
            "Recording OTP pause for {}:{} ({} devices, task {})",
            dept,
            group,
            record.pending_device_ids.len(),
            task_id
        );
        let payload = serde_json::to_string(&record)?;
        self.store
            .set_with_ttl(&Self::pause_key(dept, group), &payload, self.config.pause_ttl())
            .await
    }

    /// Read the current pause record for the group, if any
    pub async fn load_pause(&self, dept: &str, group: &str) -> Result<Option<OtpPauseRecord>> {
        match self.store.get(&Self::pause_key(dept, group)).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Clear pause bookkeeping once the group's devices have completed
    pub async fn clear_pause(&self, dept: &str, group: &str) -> Result<()> {
        self.store.delete(&Self::pause_key(dept, group)).await
    }

    /// Dedup gate for "OTP required" notices
    ///
    /// Returns true at most once per (dept, group, pending-set) within the
    /// notify TTL. Get-then-set, not atomic: a race between two workers
    /// costs one duplicate notice, never a lost one.
    pub async fn should_notify(
        &self,
        dept: &str,
        group: &str,
        task_id: &str,
        pending: &[String],
    ) -> Result<bool> {
        let key = Self::notify_key(dept, group, pending);
        if self.store.get(&key).await?.is_some() {
            tracing::debug!(
                "Suppressing duplicate OTP notice for {}:{} (task {})",
                dept,
                group,
                task_id
            );
            return Ok(false);
        }
        self.store
            .set_with_ttl(&key, task_id, self.config.notify_ttl())
            .await?;
        Ok(true)
    }
}

/// Stable digest of a pending-device set, order-insensitive
fn pending_digest(pending: &[String]) -> String {
    let mut sorted: Vec<&str> = pending.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[async_trait]
impl OtpCodeSource for OtpCoordinator {
    async fn cached_code(&self, dept: &str, group: &str, pending: &[String]) -> Result<String> {
        self.get_or_wait(dept, group, pending).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTtlStore;

    fn coordinator() -> (Arc<MemoryTtlStore>, OtpCoordinator) {
        let store = Arc::new(MemoryTtlStore::new());
        let coord = OtpCoordinator::new(store.clone(), OtpConfig::default());
        (store, coord)
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_missing_code_raises_with_exact_pending_list() {
        let (_, coord) = coordinator();
        let pending = ids(&["r1", "r2", "r3"]);

        let err = coord.get_or_wait("noc", "core", &pending).await.unwrap_err();
        match err {
            NetrunError::OtpRequired {
                dept,
                group,
                pending_devices,
            } => {
                assert_eq!(dept, "noc");
                assert_eq!(group, "core");
                assert_eq!(pending_devices, pending);
            }
            other => panic!("expected OtpRequired, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submitted_code_is_shared_and_non_consuming() {
        let (_, coord) = coordinator();
        coord.submit_code("noc", "core", "445566").await.unwrap();

        // Every caller sees the same code until TTL or invalidation
        for _ in 0..5 {
            let code = coord.get_or_wait("noc", "core", &[]).await.unwrap();
            assert_eq!(code, "445566");
        }
    }

    #[tokio::test]
    async fn test_invalidate_forces_reprompt() {
        let (_, coord) = coordinator();
        coord.submit_code("noc", "core", "445566").await.unwrap();
        coord.invalidate("noc", "core").await.unwrap();

        let err = coord.get_or_wait("noc", "core", &ids(&["r1"])).await.unwrap_err();
        assert!(err.is_otp_required());
    }

    #[tokio::test]
    async fn test_code_expiry_via_store() {
        let (store, coord) = coordinator();
        coord.submit_code("noc", "core", "445566").await.unwrap();
        store.expire_now("otp:noc:core").await;

        let err = coord.get_or_wait("noc", "core", &[]).await.unwrap_err();
        assert!(err.is_otp_required());
    }

    #[tokio::test]
    async fn test_pause_record_round_trip() {
        let (_, coord) = coordinator();
        coord
            .record_pause("task-9", "noc", "core", ids(&["r1", "r2"]), "otp_cache_miss")
            .await
            .unwrap();

        let record = coord.load_pause("noc", "core").await.unwrap().unwrap();
        assert_eq!(record.task_id, "task-9");
        assert_eq!(record.pending_device_ids, ids(&["r1", "r2"]));
        assert_eq!(record.reason, "otp_cache_miss");

        coord.clear_pause("noc", "core").await.unwrap();
        assert!(coord.load_pause("noc", "core").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pause_record_last_writer_wins() {
        let (_, coord) = coordinator();
        coord
            .record_pause("task-1", "noc", "core", ids(&["r1", "r2", "r3"]), "miss")
            .await
            .unwrap();
        coord
            .record_pause("task-2", "noc", "core", ids(&["r4"]), "rejected")
            .await
            .unwrap();

        let record = coord.load_pause("noc", "core").await.unwrap().unwrap();
        assert_eq!(record.task_id, "task-2");
        assert_eq!(record.pending_device_ids, ids(&["r4"]));
    }

    #[tokio::test]
    async fn test_should_notify_dedups_same_pending_set() {
        let (_, coord) = coordinator();
        let pending = ids(&["r1", "r2"]);

        assert!(coord.should_notify("noc", "core", "task-1", &pending).await.unwrap());
        assert!(!coord.should_notify("noc", "core", "task-1", &pending).await.unwrap());
        // A different worker touching the same set is still suppressed
        assert!(!coord.should_notify("noc", "core", "task-2", &pending).await.unwrap());
    }

    #[tokio::test]
    async fn test_should_notify_distinguishes_pending_sets() {
        let (_, coord) = coordinator();

        assert!(coord
            .should_notify("noc", "core", "task-1", &ids(&["r1"]))
            .await
            .unwrap());
        assert!(coord
            .should_notify("noc", "core", "task-1", &ids(&["r2"]))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_pending_digest_ignores_order() {
        assert_eq!(
            pending_digest(&ids(&["b", "a"])),
            pending_digest(&ids(&["a", "b"]))
        );
        assert_ne!(
            pending_digest(&ids(&["a"])),
            pending_digest(&ids(&["a", "b"]))
        );
    }
}
