//! Credential resolution for the three authentication methods
//!
//! Static secrets and seed-derived codes resolve locally through the vault.
//! Manually-entered codes are shared state: one human types one code that
//! covers a whole (department, device group) within its validity window, so
//! resolution goes through the cross-process OTP cache instead.

use std::sync::Arc;

use async_trait::async_trait;
use netrun_core::{Credential, CredentialMethod, Device, NetrunError, Result};

/// External contract for secret material
///
/// The vault owns the cryptography: decrypting stored static secrets and
/// deriving time-based codes from stored seeds. netrun never sees key
/// material, only resolved strings.
#[async_trait]
pub trait SecretVault: Send + Sync {
    /// Decrypt a stored static secret
    async fn decrypt(&self, secret_ref: &str) -> Result<String>;

    /// Derive the current time-based code from a stored seed
    async fn derive_totp(&self, seed_ref: &str) -> Result<String>;
}

/// Source of cached human-entered codes
///
/// Implemented by the OTP coordinator; a cache miss surfaces as
/// [`NetrunError::OtpRequired`] carrying `pending` verbatim.
#[async_trait]
pub trait OtpCodeSource: Send + Sync {
    async fn cached_code(&self, dept: &str, group: &str, pending: &[String]) -> Result<String>;
}

/// Resolves a device's credential according to its method
pub struct CredentialResolver {
    vault: Arc<dyn SecretVault>,
    otp: Arc<dyn OtpCodeSource>,
}

impl CredentialResolver {
    pub fn new(vault: Arc<dyn SecretVault>, otp: Arc<dyn OtpCodeSource>) -> Self {
        Self { vault, otp }
    }

    /// Resolve the username/secret pair for `device`
    ///
    /// `pending` is the list of device IDs still unresolved in the same
    /// manual-OTP group; it rides along on the OTP-required signal so the
    /// pause record can name exactly what remains.
    pub async fn resolve(&self, device: &Device, pending: &[String]) -> Result<Credential> {
        match &device.credential {
            CredentialMethod::Static { username, secret_ref } => {
                let secret = self.vault.decrypt(secret_ref).await?;
                Ok(Credential {
                    username: username.clone(),
                    secret,
                })
            }
            CredentialMethod::TotpSeed { username, seed_ref } => {
                let secret = self.vault.derive_totp(seed_ref).await?;
                Ok(Credential {
                    username: username.clone(),
                    secret,
                })
            }
            CredentialMethod::ManualOtp { username } => {
                let (dept, group) = device.otp_group().ok_or_else(|| {
                    NetrunError::InvalidDevice(format!(
                        "manual-OTP device {} is missing department or device group",
                        device.id
                    ))
                })?;
                let secret = self.otp.cached_code(dept, group, pending).await?;
                Ok(Credential {
                    username: username.clone(),
                    secret,
                })
            }
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    //! In-memory vault and code-source doubles

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Vault backed by plain maps
    #[derive(Default)]
    pub struct MapVault {
        secrets: HashMap<String, String>,
        seeds: HashMap<String, String>,
    }

    impl MapVault {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_secret(mut self, secret_ref: &str, secret: &str) -> Self {
            self.secrets.insert(secret_ref.to_string(), secret.to_string());
            self
        }

        pub fn with_seed(mut self, seed_ref: &str, code: &str) -> Self {
            self.seeds.insert(seed_ref.to_string(), code.to_string());
            self
        }
    }

    #[async_trait]
    impl SecretVault for MapVault {
        async fn decrypt(&self, secret_ref: &str) -> Result<String> {
            self.secrets
                .get(secret_ref)
                .cloned()
                .ok_or_else(|| NetrunError::Auth(format!("unknown secret ref {}", secret_ref)))
        }

        async fn derive_totp(&self, seed_ref: &str) -> Result<String> {
            self.seeds
                .get(seed_ref)
                .cloned()
                .ok_or_else(|| NetrunError::Auth(format!("unknown seed ref {}", seed_ref)))
        }
    }

    /// Code source with a settable cached code per (dept, group)
    #[derive(Default)]
    pub struct FixedCodeSource {
        codes: Mutex<HashMap<(String, String), String>>,
    }

    impl FixedCodeSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_code(&self, dept: &str, group: &str, code: &str) {
            self.codes
                .lock()
                .unwrap()
                .insert((dept.to_string(), group.to_string()), code.to_string());
        }

        pub fn clear(&self, dept: &str, group: &str) {
            self.codes
                .lock()
                .unwrap()
                .remove(&(dept.to_string(), group.to_string()));
        }
    }

    #[async_trait]
    impl OtpCodeSource for FixedCodeSource {
        async fn cached_code(&self, dept: &str, group: &str, pending: &[String]) -> Result<String> {
            self.codes
                .lock()
                .unwrap()
                .get(&(dept.to_string(), group.to_string()))
                .cloned()
                .ok_or_else(|| NetrunError::OtpRequired {
                    dept: dept.to_string(),
                    group: group.to_string(),
                    pending_devices: pending.to_vec(),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{FixedCodeSource, MapVault};
    use super::*;
    use netrun_core::Platform;

    fn device(id: &str, credential: CredentialMethod) -> Device {
        Device {
            id: id.to_string(),
            host: format!("{}.example.net", id),
            port: 22,
            platform: Platform::IosXe,
            dept_id: Some("noc".to_string()),
            device_group: Some("core".to_string()),
            credential,
        }
    }

    fn resolver(otp: Arc<FixedCodeSource>) -> CredentialResolver {
        let vault = MapVault::new()
            .with_secret("kv/sw1", "hunter2")
            .with_seed("seed/sw2", "482910");
        CredentialResolver::new(Arc::new(vault), otp)
    }

    #[tokio::test]
    async fn test_static_resolution() {
        let resolver = resolver(Arc::new(FixedCodeSource::new()));
        let device = device(
            "sw1",
            CredentialMethod::Static {
                username: "ops".to_string(),
                secret_ref: "kv/sw1".to_string(),
            },
        );

        let cred = resolver.resolve(&device, &[]).await.unwrap();
        assert_eq!(cred.username, "ops");
        assert_eq!(cred.secret, "hunter2");
    }

    #[tokio::test]
    async fn test_totp_seed_resolution() {
        let resolver = resolver(Arc::new(FixedCodeSource::new()));
        let device = device(
            "sw2",
            CredentialMethod::TotpSeed {
                username: "ops".to_string(),
                seed_ref: "seed/sw2".to_string(),
            },
        );

        let cred = resolver.resolve(&device, &[]).await.unwrap();
        assert_eq!(cred.secret, "482910");
    }

    #[tokio::test]
    async fn test_manual_otp_cache_hit() {
        let otp = Arc::new(FixedCodeSource::new());
        otp.set_code("noc", "core", "112233");
        let resolver = resolver(otp);
        let device = device(
            "sw3",
            CredentialMethod::ManualOtp {
                username: "ops".to_string(),
            },
        );

        let cred = resolver.resolve(&device, &[]).await.unwrap();
        assert_eq!(cred.secret, "112233");
    }

    #[tokio::test]
    async fn test_manual_otp_miss_carries_pending() {
        let resolver = resolver(Arc::new(FixedCodeSource::new()));
        let device = device(
            "sw3",
            CredentialMethod::ManualOtp {
                username: "ops".to_string(),
            },
        );
        let pending = vec!["sw3".to_string(), "sw4".to_string()];

        let err = resolver.resolve(&device, &pending).await.unwrap_err();
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
    async fn test_manual_otp_missing_group_is_input_error() {
        let resolver = resolver(Arc::new(FixedCodeSource::new()));
        let mut device = device(
            "sw3",
            CredentialMethod::ManualOtp {
                username: "ops".to_string(),
            },
        );
        device.device_group = None;

        let err = resolver.resolve(&device, &[]).await.unwrap_err();
        assert!(matches!(err, NetrunError::InvalidDevice(_)));
    }
}
