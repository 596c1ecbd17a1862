use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Deserialize, Clone)]
pub struct AuthorityConfig {
    pub storage: StorageConfig,
    pub authority: AuthorityPaths,
    #[serde(default)]
    pub lifetimes: CertificateLifetimes,
    #[serde(default)]
    pub policy: EnrollmentPolicy,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Directories backing the request, signed and revoked stores.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub requests_dir: PathBuf,
    pub signed_dir: PathBuf,
    pub revoked_dir: PathBuf,
    /// Serial-number index directory. Defaults to `by-serial` under the
    /// signed directory, which keeps the index symlinks relative.
    #[serde(default)]
    pub signed_by_serial_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn by_serial_dir(&self) -> PathBuf {
        self.signed_by_serial_dir
            .clone()
            .unwrap_or_else(|| self.signed_dir.join("by-serial"))
    }
}

/// Where the authority's own certificate and private key live.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthorityPaths {
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertificateLifetimes {
    #[serde(default = "default_server_lifetime_days")]
    pub server_days: u32,
    #[serde(default = "default_client_lifetime_days")]
    pub client_days: u32,
}

impl Default for CertificateLifetimes {
    fn default() -> Self {
        Self {
            server_days: default_server_lifetime_days(),
            client_days: default_client_lifetime_days(),
        }
    }
}

fn default_server_lifetime_days() -> u32 {
    365
}

fn default_client_lifetime_days() -> u32 {
    120
}

/// User self-enrollment policy, which feeds profile classification.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EnrollmentPolicy {
    #[serde(default)]
    pub user_enrollment_allowed: bool,
    #[serde(default)]
    pub user_multiple_certificates: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotificationConfig {
    /// Long-poll publish URL template with a `{}` placeholder for the topic,
    /// e.g. `https://push.example.com/pub/{}`. Disabled when absent.
    #[serde(default)]
    pub long_poll_publish: Option<String>,
}

impl AuthorityConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())?;
        let config: AuthorityConfig = toml::from_str(&config_str)?;
        Ok(config)
    }

    /// Load configuration with default path (config.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[storage]
requests_dir = "store/requests"
signed_dir = "store/signed"
revoked_dir = "store/revoked"

[authority]
certificate_path = "authority/ca_crt.pem"
private_key_path = "authority/ca_key.pem"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = AuthorityConfig::from_file(file.path()).unwrap();

        assert_eq!(config.lifetimes.server_days, 365);
        assert_eq!(config.lifetimes.client_days, 120);
        assert!(!config.policy.user_enrollment_allowed);
        assert!(config.notifications.long_poll_publish.is_none());
        assert_eq!(
            config.storage.by_serial_dir(),
            PathBuf::from("store/signed/by-serial")
        );
    }

    #[test]
    fn explicit_sections_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{MINIMAL}\n[lifetimes]\nserver_days = 730\nclient_days = 30\n\n\
             [policy]\nuser_enrollment_allowed = true\n\n\
             [notifications]\nlong_poll_publish = \"https://push.example.com/pub/{{}}\"\n"
        )
        .unwrap();
        let config = AuthorityConfig::from_file(file.path()).unwrap();

        assert_eq!(config.lifetimes.server_days, 730);
        assert_eq!(config.lifetimes.client_days, 30);
        assert!(config.policy.user_enrollment_allowed);
        assert_eq!(
            config.notifications.long_poll_publish.as_deref(),
            Some("https://push.example.com/pub/{}")
        );
    }
}
