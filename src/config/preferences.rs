//! Global SSH preferences

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::params::ParamsError;

fn default_true() -> bool {
    true
}

fn default_keepidle() -> u32 {
    20
}

fn default_keepintvl() -> u32 {
    10
}

fn default_keepcnt() -> u32 {
    3
}

fn default_usrtimeout() -> u32 {
    60000
}

/// Preferences shared by every session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    /// Apply `~/.ssh/config` defaults on connect
    #[serde(default = "default_true")]
    pub ssh_parseconfig: bool,

    /// Seconds of idle time before the first keepalive probe
    #[serde(default = "default_keepidle")]
    pub ssh_tcp_keepidle: u32,

    /// Seconds between keepalive probes
    #[serde(default = "default_keepintvl")]
    pub ssh_tcp_keepintvl: u32,

    /// Unanswered probes before the connection is dropped
    #[serde(default = "default_keepcnt")]
    pub ssh_tcp_keepcnt: u32,

    /// TCP_USER_TIMEOUT in milliseconds
    #[serde(default = "default_usrtimeout")]
    pub ssh_tcp_usrtimeout: u32,

    /// Override for `~/.ssh/known_hosts`
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,

    /// Override for `~/.ssh/config`
    #[serde(default)]
    pub ssh_config_path: Option<PathBuf>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            ssh_parseconfig: true,
            ssh_tcp_keepidle: default_keepidle(),
            ssh_tcp_keepintvl: default_keepintvl(),
            ssh_tcp_keepcnt: default_keepcnt(),
            ssh_tcp_usrtimeout: default_usrtimeout(),
            known_hosts_path: None,
            ssh_config_path: None,
        }
    }
}

impl Preferences {
    pub fn load(path: &Path) -> Result<Self, ParamsError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn keepidle(&self) -> Duration {
        Duration::from_secs(self.ssh_tcp_keepidle as u64)
    }

    pub fn keepintvl(&self) -> Duration {
        Duration::from_secs(self.ssh_tcp_keepintvl as u64)
    }

    pub fn user_timeout(&self) -> Duration {
        Duration::from_millis(self.ssh_tcp_usrtimeout as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let prefs = Preferences::default();
        assert!(prefs.ssh_parseconfig);
        assert_eq!(prefs.keepidle(), Duration::from_secs(20));
        assert_eq!(prefs.keepintvl(), Duration::from_secs(10));
        assert_eq!(prefs.ssh_tcp_keepcnt, 3);
        assert_eq!(prefs.user_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let prefs: Preferences =
            serde_json::from_str(r#"{"ssh_parseconfig": false, "ssh_tcp_keepcnt": 9}"#).unwrap();
        assert!(!prefs.ssh_parseconfig);
        assert_eq!(prefs.ssh_tcp_keepcnt, 9);
        assert_eq!(prefs.ssh_tcp_keepidle, 20);
    }
}
