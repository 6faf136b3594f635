//! Type definitions shared across the netrun workspace

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Network operating system families the session drivers understand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    IosXe,
    NxOs,
    Junos,
    Eos,
}

impl Platform {
    /// Driver name used when opening a session
    pub fn driver_name(&self) -> &'static str {
        match self {
            Platform::IosXe => "cisco_iosxe",
            Platform::NxOs => "cisco_nxos",
            Platform::Junos => "juniper_junos",
            Platform::Eos => "arista_eos",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.driver_name())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cisco_iosxe" | "iosxe" => Ok(Platform::IosXe),
            "cisco_nxos" | "nxos" => Ok(Platform::NxOs),
            "juniper_junos" | "junos" => Ok(Platform::Junos),
            "arista_eos" | "eos" => Ok(Platform::Eos),
            _ => Err(format!("Unknown platform: {}", s)),
        }
    }
}

/// How a device's login secret is obtained
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CredentialMethod {
    /// Static secret held encrypted in the vault
    Static { username: String, secret_ref: String },
    /// Time-based code derived from a stored seed
    TotpSeed { username: String, seed_ref: String },
    /// Code typed by a human, shared by the whole (dept, group)
    ManualOtp { username: String },
}

impl CredentialMethod {
    pub fn username(&self) -> &str {
        match self {
            CredentialMethod::Static { username, .. } => username,
            CredentialMethod::TotpSeed { username, .. } => username,
            CredentialMethod::ManualOtp { username } => username,
        }
    }

    /// Manual-OTP devices need (dept, group) coordination; the rest do not
    pub fn is_manual_otp(&self) -> bool {
        matches!(self, CredentialMethod::ManualOtp { .. })
    }
}

/// A resolved username/secret pair handed to the session driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub secret: String,
}

/// A single target device in a batch job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Stable identifier used in reports and pause records
    pub id: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub platform: Platform,
    /// Department owning the device (required for manual OTP)
    #[serde(default)]
    pub dept_id: Option<String>,
    /// Tier classification sharing one credential policy (required for manual OTP)
    #[serde(default)]
    pub device_group: Option<String>,
    pub credential: CredentialMethod,
}

fn default_port() -> u16 {
    22
}

impl Device {
    /// The (dept, group) coordination key, present only when both parts are set
    pub fn otp_group(&self) -> Option<(&str, &str)> {
        match (self.dept_id.as_deref(), self.device_group.as_deref()) {
            (Some(d), Some(g)) => Some((d, g)),
            _ => None,
        }
    }
}

/// Which authentication path a bucket's devices take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthBucket {
    /// Static or seed-derived credentials - chunked freely
    Standard,
    /// Human-entered code - grouped strictly by (dept, group)
    ManualOtp,
}

/// An immutable grouping of devices produced once per job submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchBucket {
    pub auth_bucket: AuthBucket,
    pub dept_id: Option<String>,
    pub device_group: Option<String>,
    pub devices: Vec<Device>,
    /// Zero-based index of this chunk within its group
    pub batch_index: usize,
    /// Total chunks the group was sliced into
    pub batch_total: usize,
    /// Device count of the whole group before slicing
    pub group_total: usize,
}

/// Request context handed down from the task-queue framework
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: String,
    pub retry_count: u32,
}

impl TaskContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            retry_count: 0,
        }
    }
}

/// Outcome for one device within a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeviceOutcome {
    Succeeded {
        device_id: String,
    },
    Failed {
        device_id: String,
        reason: String,
    },
    /// Blocked on a human-entered code, will be retried on resubmission
    Paused {
        device_id: String,
        dept: String,
        group: String,
    },
}

impl DeviceOutcome {
    pub fn device_id(&self) -> &str {
        match self {
            DeviceOutcome::Succeeded { device_id } => device_id,
            DeviceOutcome::Failed { device_id, .. } => device_id,
            DeviceOutcome::Paused { device_id, .. } => device_id,
        }
    }
}

/// One group of devices waiting on a human-entered code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpPending {
    pub dept: String,
    pub group: String,
    pub pending_devices: Vec<String>,
}

/// Structured result of a batch run
///
/// Separates succeeded / failed / paused so a resubmission knows exactly
/// what to skip. A paused group is not a failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub task_id: String,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub paused: Vec<OtpPending>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchReport {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Self::default()
        }
    }

    /// True when every device completed and nothing is waiting on input
    pub fn is_fully_succeeded(&self) -> bool {
        self.failed.is_empty() && self.paused.is_empty()
    }

    /// True when at least one group is blocked on a human-entered code
    pub fn needs_otp(&self) -> bool {
        !self.paused.is_empty()
    }

    pub fn record(&mut self, outcome: DeviceOutcome) {
        match outcome {
            DeviceOutcome::Succeeded { device_id } => self.succeeded.push(device_id),
            DeviceOutcome::Failed { device_id, reason } => self.failed.push((device_id, reason)),
            DeviceOutcome::Paused { device_id, dept, group } => {
                match self
                    .paused
                    .iter_mut()
                    .find(|p| p.dept == dept && p.group == group)
                {
                    Some(entry) => entry.pending_devices.push(device_id),
                    None => self.paused.push(OtpPending {
                        dept,
                        group,
                        pending_devices: vec![device_id],
                    }),
                }
            }
        }
    }
}
