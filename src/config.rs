use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Result, RunnerError};

/// Runner configuration. All fields are fixed at startup; nothing is
/// reloadable at runtime.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Path to the external executor binary.
    pub cli_path: PathBuf,
    /// Path to the target installation.
    pub install_path: PathBuf,
    /// Network (partition) ID, `0` to disable.
    pub network_id: u64,
    /// Number of event-retrieval workers.
    pub get_workers: usize,
    /// Number of event-execution workers.
    pub run_workers: usize,
    /// Seconds between site-discovery cycles.
    pub get_events_interval: u64,
    /// Heartbeat interval in seconds, `0` disables heartbeat reporting.
    pub heartbeat_interval: u64,
    /// Use the orchestrate site-listing command instead of the plain one.
    pub smart_site_list: bool,
    /// Include additional log data for debugging.
    pub debug: bool,
    /// Listen address for the metrics endpoint, if any.
    pub metrics_listen_addr: Option<SocketAddr>,
    /// Shared-secret token enabling the remote trigger listener.
    pub remote_token: Option<String>,
    /// Listen address for the remote trigger listener.
    pub remote_listen_addr: SocketAddr,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cli_path: PathBuf::from("/usr/local/bin/wp"),
            install_path: PathBuf::from("/var/www/html"),
            network_id: 0,
            get_workers: 1,
            run_workers: 5,
            get_events_interval: 60,
            heartbeat_interval: 60,
            smart_site_list: false,
            debug: false,
            metrics_listen_addr: None,
            remote_token: None,
            remote_listen_addr: SocketAddr::from(([0, 0, 0, 0], 7227)),
        }
    }
}

impl RunnerConfig {
    /// Validate paths and worker counts. Called once before any worker
    /// starts; failures here are fatal.
    pub fn validate(&mut self) -> Result<()> {
        self.cli_path = canonical_existing(&self.cli_path, "executor path")?;
        self.install_path = canonical_existing(&self.install_path, "installation path")?;

        if self.get_workers == 0 {
            return Err(RunnerError::InvalidConfig(
                "at least one retrieval worker is required".to_string(),
            ));
        }
        if self.run_workers == 0 {
            return Err(RunnerError::InvalidConfig(
                "at least one execution worker is required".to_string(),
            ));
        }
        if self.get_events_interval == 0 {
            return Err(RunnerError::InvalidConfig(
                "get-events-interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// True when a remote trigger listener should be started.
    pub fn remote_enabled(&self) -> bool {
        self.remote_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

fn canonical_existing(path: &PathBuf, label: &str) -> Result<PathBuf> {
    if path.as_os_str().len() <= 1 {
        return Err(RunnerError::InvalidConfig(format!(
            "empty path provided for {}",
            label
        )));
    }

    let abs = std::path::absolute(path)
        .map_err(|e| RunnerError::InvalidConfig(format!("{}: {}", label, e)))?;

    if !abs.exists() {
        return Err(RunnerError::InvalidConfig(format!(
            "{}: '{}' does not exist",
            label,
            abs.display()
        )));
    }

    Ok(abs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_config_default() {
        let cfg = RunnerConfig::default();
        assert_eq!(cfg.cli_path, PathBuf::from("/usr/local/bin/wp"));
        assert_eq!(cfg.install_path, PathBuf::from("/var/www/html"));
        assert_eq!(cfg.network_id, 0);
        assert_eq!(cfg.get_workers, 1);
        assert_eq!(cfg.run_workers, 5);
        assert_eq!(cfg.get_events_interval, 60);
        assert_eq!(cfg.heartbeat_interval, 60);
        assert!(!cfg.smart_site_list);
        assert!(cfg.metrics_listen_addr.is_none());
        assert!(!cfg.remote_enabled());
    }

    #[test]
    fn validate_rejects_missing_cli_path() {
        let mut cfg = RunnerConfig {
            cli_path: PathBuf::from("/nonexistent/bin/wp-cli-12345"),
            install_path: std::env::temp_dir(),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn validate_rejects_empty_path() {
        let mut cfg = RunnerConfig {
            cli_path: PathBuf::from(""),
            install_path: std::env::temp_dir(),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("empty path"));
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let dir = std::env::temp_dir();
        let mut cfg = RunnerConfig {
            cli_path: dir.clone(),
            install_path: dir,
            run_workers: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn remote_enabled_requires_nonempty_token() {
        let mut cfg = RunnerConfig::default();
        assert!(!cfg.remote_enabled());
        cfg.remote_token = Some(String::new());
        assert!(!cfg.remote_enabled());
        cfg.remote_token = Some("secret".to_string());
        assert!(cfg.remote_enabled());
    }
}
