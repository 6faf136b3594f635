//! Batch execution
//!
//! The async routine a task-queue worker submits through the bridge: it
//! partitions the job, runs each bucket's devices with bounded
//! concurrency, and produces a [`BatchReport`] that always separates
//! succeeded / failed / paused so a resubmission knows exactly what to
//! skip.
//!
//! Per device the sequence is strictly ordered: resolve credential, open
//! (pool acquire), execute, persist through the circuit breaker, release.
//! Across devices there is no ordering guarantee.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use netrun_core::{
    BatchBucket, BatchConfig, BatchReport, Device, DeviceOutcome, NetrunError, Result, TaskContext,
};
use netrun_session::{
    CircuitBreaker, ConnectionPool, CredentialResolver, DeviceSession,
};

use crate::grouper::partition;
use crate::otp::OtpCoordinator;

/// The work performed on each device once a session is prepared
///
/// Returns the artifact text to persist (a config snapshot, collected
/// facts, discovered neighbors). Command templates are the caller's
/// concern.
#[async_trait]
pub trait DeviceJob: Send + Sync {
    async fn execute(&self, device: &Device, session: &mut dyn DeviceSession) -> Result<String>;
}

/// Persists collected artifacts; protected by the circuit breaker
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn store(&self, device: &Device, artifact: &str) -> Result<()>;
}

/// Emits "OTP required" notices to humans
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn otp_required(
        &self,
        dept: &str,
        group: &str,
        task_id: &str,
        pending: &[String],
    ) -> Result<()>;
}

/// Default notifier: a structured log line, nothing else
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn otp_required(
        &self,
        dept: &str,
        group: &str,
        task_id: &str,
        pending: &[String],
    ) -> Result<()> {
        tracing::warn!(
            "OTP required for {}:{} - task {} waiting on {} devices",
            dept,
            group,
            task_id,
            pending.len()
        );
        Ok(())
    }
}

struct OtpGroupCtx {
    dept: String,
    group: String,
    pending: Vec<String>,
    /// Set once the group's code is known rejected or gone; later devices
    /// short-circuit to paused instead of retrying a dead code
    rejected: Arc<AtomicBool>,
}

/// Runs partitioned batches against the pool, breaker, and coordinator
pub struct BatchRunner {
    pool: Arc<ConnectionPool>,
    resolver: Arc<CredentialResolver>,
    otp: Arc<OtpCoordinator>,
    breaker: Arc<CircuitBreaker>,
    sink: Arc<dyn ArtifactSink>,
    notifier: Arc<dyn Notifier>,
    config: BatchConfig,
}

impl BatchRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<ConnectionPool>,
        resolver: Arc<CredentialResolver>,
        otp: Arc<OtpCoordinator>,
        breaker: Arc<CircuitBreaker>,
        sink: Arc<dyn ArtifactSink>,
        notifier: Arc<dyn Notifier>,
        config: BatchConfig,
    ) -> Self {
        Self {
            pool,
            resolver,
            otp,
            breaker,
            sink,
            notifier,
            config,
        }
    }

    /// Run a batch job end to end
    ///
    /// A group blocked on a missing or rejected code produces a paused
    /// entry in the report, never a job failure. Shared-store errors do
    /// propagate - without the store the coordinator is blind.
    pub async fn run_batch(
        &self,
        ctx: &TaskContext,
        devices: Vec<Device>,
        job: Arc<dyn DeviceJob>,
    ) -> Result<BatchReport> {
        let buckets = partition(devices, self.config.chunk_size)?;
        let mut report = BatchReport::new(&ctx.task_id);

        tracing::info!(
            "Task {} (retry {}): running {} buckets",
            ctx.task_id,
            ctx.retry_count,
            buckets.len()
        );

        for bucket in buckets {
            self.run_bucket(ctx, &bucket, &job, &mut report).await?;
        }

        report.finished_at = Some(chrono::Utc::now());
        tracing::info!(
            "Task {} done: {} succeeded, {} failed, {} groups paused",
            ctx.task_id,
            report.succeeded.len(),
            report.failed.len(),
            report.paused.len()
        );
        Ok(report)
    }

    async fn run_bucket(
        &self,
        ctx: &TaskContext,
        bucket: &BatchBucket,
        job: &Arc<dyn DeviceJob>,
        report: &mut BatchReport,
    ) -> Result<()> {
        let otp_ctx = match (&bucket.dept_id, &bucket.device_group) {
            (Some(dept), Some(group)) if bucket.auth_bucket == netrun_core::AuthBucket::ManualOtp => {
                let pending: Vec<String> = bucket.devices.iter().map(|d| d.id.clone()).collect();

                // Resolve the group's code once before touching any device
                match self.otp.get_or_wait(dept, group, &pending).await {
                    Ok(_) => Some(OtpGroupCtx {
                        dept: dept.clone(),
                        group: group.clone(),
                        pending,
                        rejected: Arc::new(AtomicBool::new(false)),
                    }),
                    Err(NetrunError::OtpRequired { .. }) => {
                        self.pause_group(ctx, dept, group, pending.clone(), "otp_cache_miss")
                            .await?;
                        for device in &bucket.devices {
                            report.record(DeviceOutcome::Paused {
                                device_id: device.id.clone(),
                                dept: dept.clone(),
                                group: group.clone(),
                            });
                        }
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => None,
        };

        // Futures are built eagerly: a closure-mapped stream fails lifetime
        // inference once this future is submitted across threads
        let mut work = Vec::with_capacity(bucket.devices.len());
        for device in &bucket.devices {
            work.push(self.process_device(device, job, otp_ctx.as_ref()));
        }
        let outcomes: Vec<DeviceOutcome> = stream::iter(work)
            .buffer_unordered(self.config.device_concurrency)
            .collect()
            .await;

        // A rejected code pauses whatever the group did not finish
        if let Some(group_ctx) = &otp_ctx {
            let paused_ids: Vec<String> = outcomes
                .iter()
                .filter(|o| matches!(o, DeviceOutcome::Paused { .. }))
                .map(|o| o.device_id().to_string())
                .collect();
            if !paused_ids.is_empty() {
                self.pause_group(
                    ctx,
                    &group_ctx.dept,
                    &group_ctx.group,
                    paused_ids,
                    "otp_code_rejected",
                )
                .await?;
            }
        }

        for outcome in outcomes {
            report.record(outcome);
        }
        Ok(())
    }

    async fn pause_group(
        &self,
        ctx: &TaskContext,
        dept: &str,
        group: &str,
        pending: Vec<String>,
        reason: &str,
    ) -> Result<()> {
        self.otp
            .record_pause(&ctx.task_id, dept, group, pending.clone(), reason)
            .await?;
        if self
            .otp
            .should_notify(dept, group, &ctx.task_id, &pending)
            .await?
        {
            // A failed notice must not fail the batch; the pause record
            // already holds the resumption state
            if let Err(e) = self
                .notifier
                .otp_required(dept, group, &ctx.task_id, &pending)
                .await
            {
                tracing::error!("Failed to emit OTP notice for {}:{}: {}", dept, group, e);
            }
        }
        Ok(())
    }

    async fn process_device(
        &self,
        device: &Device,
        job: &Arc<dyn DeviceJob>,
        otp_ctx: Option<&OtpGroupCtx>,
    ) -> DeviceOutcome {
        let paused = |device: &Device, group_ctx: &OtpGroupCtx| DeviceOutcome::Paused {
            device_id: device.id.clone(),
            dept: group_ctx.dept.clone(),
            group: group_ctx.group.clone(),
        };

        if let Some(group_ctx) = otp_ctx {
            if group_ctx.rejected.load(Ordering::SeqCst) {
                return paused(device, group_ctx);
            }
        }

        let pending: &[String] = otp_ctx.map(|c| c.pending.as_slice()).unwrap_or(&[]);
        let credential = match self.resolver.resolve(device, pending).await {
            Ok(credential) => credential,
            Err(NetrunError::OtpRequired { .. }) => {
                // Code expired mid-bucket; stop the rest of the group too
                if let Some(group_ctx) = otp_ctx {
                    group_ctx.rejected.store(true, Ordering::SeqCst);
                    return paused(device, group_ctx);
                }
                return DeviceOutcome::Failed {
                    device_id: device.id.clone(),
                    reason: "otp required outside a coordinated group".to_string(),
                };
            }
            Err(e) => {
                return DeviceOutcome::Failed {
                    device_id: device.id.clone(),
                    reason: format!("credential resolution failed: {}", e),
                }
            }
        };

        let mut handle = match self
            .pool
            .acquire(&device.host, &credential, device.platform, device.port)
            .await
        {
            Ok(handle) => handle,
            Err(NetrunError::Auth(reason)) => {
                if let Some(group_ctx) = otp_ctx {
                    // Never retry a code the device already rejected
                    group_ctx.rejected.store(true, Ordering::SeqCst);
                    if let Err(e) = self.otp.invalidate(&group_ctx.dept, &group_ctx.group).await {
                        tracing::error!(
                            "Failed to invalidate OTP code for {}:{}: {}",
                            group_ctx.dept,
                            group_ctx.group,
                            e
                        );
                    }
                    return paused(device, group_ctx);
                }
                return DeviceOutcome::Failed {
                    device_id: device.id.clone(),
                    reason: format!("authentication failed: {}", reason),
                };
            }
            Err(e) => {
                return DeviceOutcome::Failed {
                    device_id: device.id.clone(),
                    reason: format!("session open failed: {}", e),
                }
            }
        };

        let artifact = match job.execute(device, handle.session().as_mut()).await {
            Ok(artifact) => artifact,
            Err(e) => {
                // The session state is unknown after a failed job; discard it
                if let Err(release_err) = self.pool.release(handle, true).await {
                    tracing::debug!("Discard after job failure also failed: {}", release_err);
                }
                return DeviceOutcome::Failed {
                    device_id: device.id.clone(),
                    reason: format!("execution failed: {}", e),
                };
            }
        };

        let stored = self.breaker.call(self.sink.store(device, &artifact)).await;

        if let Err(e) = self.pool.release(handle, false).await {
            tracing::debug!("Release for {} failed: {}", device.id, e);
        }

        match stored {
            Ok(()) => DeviceOutcome::Succeeded {
                device_id: device.id.clone(),
            },
            Err(e) => DeviceOutcome::Failed {
                device_id: device.id.clone(),
                reason: format!("artifact store failed: {}", e),
            },
        }
    }
}
