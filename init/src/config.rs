//! Boot configuration.
//!
//! Defaults come from `baas_shared::constants`. An optional JSON file
//! overrides them, and command-line flags override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use baas_shared::constants::{loop_device, paths, server, timing};
use baas_shared::errors::{BaasError, BaasResult};
use serde::Deserialize;

/// Supervisor configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct InitConfig {
    /// URL of the boot manifest
    pub manifest_url: String,

    /// Base URL of the image server
    pub image_server: String,

    /// `Origin` header value sent with every request
    pub origin: String,

    /// Directory downloaded images are written to
    pub scratch_dir: PathBuf,

    /// Root directory for partition mount points
    pub mount_root: PathBuf,

    /// Loop control node
    pub loop_control: PathBuf,

    /// Real init program
    pub init_path: PathBuf,

    /// argv passed to the real init
    pub init_argv: Vec<String>,

    /// Diagnostic log file
    pub log_path: PathBuf,

    /// Fork the image worker at boot
    pub fetch_images: bool,

    /// Exec into `init_path` after boot. When false the supervisor stays
    /// resident and only reaps children.
    pub handoff: bool,

    pub startup_delay_secs: u64,
    pub settle_delay_ms: u64,
    pub reap_interval_secs: u32,
    pub http_timeout_secs: u64,

    /// Commands run to completion before the image worker starts,
    /// e.g. `[["modprobe", "loop"], ["ifup", "ens3"]]`
    pub provision: Vec<Vec<String>>,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            manifest_url: server::MANIFEST_URL.to_string(),
            image_server: server::IMAGE_SERVER.to_string(),
            origin: server::ORIGIN.to_string(),
            scratch_dir: PathBuf::from(paths::SCRATCH_DIR),
            mount_root: PathBuf::from(paths::MOUNT_ROOT),
            loop_control: PathBuf::from(loop_device::CONTROL),
            init_path: PathBuf::from(paths::INIT_PATH),
            init_argv: vec![paths::INIT_ARGV0.to_string()],
            log_path: PathBuf::from(paths::LOG_PATH),
            fetch_images: false,
            handoff: true,
            startup_delay_secs: timing::STARTUP_DELAY_SECS,
            settle_delay_ms: timing::SETTLE_DELAY_MS,
            reap_interval_secs: timing::REAP_INTERVAL_SECS,
            http_timeout_secs: timing::HTTP_TIMEOUT_SECS,
            provision: Vec::new(),
        }
    }
}

impl InitConfig {
    /// Load configuration from `path`.
    ///
    /// A missing file yields the defaults; an unreadable or malformed file
    /// is an error.
    pub fn load(path: &Path) -> BaasResult<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(BaasError::Config(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let config: Self = serde_json::from_slice(&bytes).map_err(|e| {
            BaasError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> BaasResult<()> {
        if self.init_argv.is_empty() {
            return Err(BaasError::Config("init_argv must not be empty".to_string()));
        }
        // alarm(0) would cancel the reap alarm instead of arming it
        if self.reap_interval_secs == 0 {
            return Err(BaasError::Config(
                "reap_interval_secs must be at least 1".to_string(),
            ));
        }
        if let Some(idx) = self.provision.iter().position(|argv| argv.is_empty()) {
            return Err(BaasError::Config(format!(
                "provision command #{} is empty",
                idx
            )));
        }
        Ok(())
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_boot_protocol() {
        let config = InitConfig::default();
        assert_eq!(config.init_path, PathBuf::from("/sbin/init-orig"));
        assert_eq!(config.init_argv, vec!["init".to_string()]);
        assert_eq!(config.loop_control, PathBuf::from("/dev/loop-control"));
        assert_eq!(config.reap_interval_secs, 50);
        assert_eq!(config.settle_delay(), Duration::from_millis(5));
        assert!(config.handoff);
        assert!(!config.fetch_images);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = InitConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, InitConfig::default());
    }

    #[test]
    fn test_partial_file_overrides_only_given_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("init.json");
        std::fs::write(
            &path,
            r#"{"fetch_images": true, "mount_root": "/run/baas", "provision": [["modprobe", "loop"]]}"#,
        )
        .unwrap();

        let config = InitConfig::load(&path).unwrap();
        assert!(config.fetch_images);
        assert_eq!(config.mount_root, PathBuf::from("/run/baas"));
        assert_eq!(config.provision, vec![vec!["modprobe", "loop"]]);
        assert_eq!(config.manifest_url, server::MANIFEST_URL);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("init.json");
        std::fs::write(&path, "{ nope").unwrap();

        assert!(matches!(
            InitConfig::load(&path),
            Err(BaasError::Config(_))
        ));
    }

    #[test]
    fn test_empty_provision_command_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("init.json");
        std::fs::write(&path, r#"{"provision": [["ifup", "ens3"], []]}"#).unwrap();

        assert!(matches!(
            InitConfig::load(&path),
            Err(BaasError::Config(_))
        ));
    }

    #[test]
    fn test_zero_reap_interval_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("init.json");
        std::fs::write(&path, r#"{"reap_interval_secs": 0}"#).unwrap();

        let err = InitConfig::load(&path).unwrap_err();
        assert!(matches!(err, BaasError::Config(ref m) if m.contains("reap_interval_secs")));
    }
}
