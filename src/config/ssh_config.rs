//! SSH Config resolution
//!
//! Reads ~/.ssh/config and resolves the options that apply to one target host,
//! following OpenSSH rules:
//! - Options before the first `Host` line apply to every host
//! - `Host` patterns support `*`, `?` and `!negation`
//! - For each option the first obtained value wins
//! - `Key Value` and `Key=Value` forms are both accepted
//!
//! Only the options the session core can apply are kept: HostName, User, Port,
//! IdentityFile, CertificateFile, ProxyCommand, KexAlgorithms, Ciphers,
//! HostKeyAlgorithms, Compression and StrictHostKeyChecking.

use std::path::PathBuf;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

/// Options resolved for one host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SshConfigHost {
    /// Actual hostname (HostName directive)
    pub hostname: Option<String>,
    /// Username (User directive)
    pub user: Option<String>,
    /// Port number (Port directive)
    pub port: Option<u16>,
    /// Identity file path (IdentityFile directive)
    pub identity_file: Option<String>,
    /// Certificate file path (CertificateFile directive)
    pub certificate_file: Option<String>,
    /// ProxyCommand, `none` is dropped
    pub proxy_command: Option<String>,
    /// Comma separated key exchange list
    pub kex_algorithms: Option<String>,
    /// Comma separated cipher list
    pub ciphers: Option<String>,
    /// Comma separated host key type list
    pub host_key_algorithms: Option<String>,
    /// Compression yes/no
    pub compression: Option<bool>,
    /// StrictHostKeyChecking as a level: 0 = no, 1 = yes/ask, 2 = accept-new
    pub strict_host_key_checking: Option<i32>,
}

impl SshConfigHost {
    /// Get effective port (port or 22)
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(22)
    }

    /// True when no option applied
    pub fn is_empty(&self) -> bool {
        *self == SshConfigHost::default()
    }
}

/// SSH config parser errors
#[derive(Debug, thiserror::Error)]
pub enum SshConfigError {
    #[error("Failed to determine home directory")]
    NoHomeDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Get default SSH config path
pub fn default_ssh_config_path() -> Result<PathBuf, SshConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("config"))
        .ok_or(SshConfigError::NoHomeDir)
}

/// Read the config file and resolve `host`. A missing file resolves to nothing.
pub async fn load_host_config(
    path: Option<PathBuf>,
    host: &str,
) -> Result<SshConfigHost, SshConfigError> {
    let path = match path {
        Some(p) => p,
        None => default_ssh_config_path()?,
    };

    let content = match fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No ssh config at {:?}", path);
            return Ok(SshConfigHost::default());
        }
        Err(e) => return Err(SshConfigError::Io(e)),
    };

    Ok(resolve_host_config(&content, host))
}

/// Does a `Host` pattern list match `host`?
fn host_matches(patterns: &str, host: &str) -> bool {
    let host = host.to_lowercase();
    let mut matched = false;

    for raw in patterns.split_whitespace() {
        let (negated, pattern) = match raw.strip_prefix('!') {
            Some(p) => (true, p),
            None => (false, raw),
        };
        let hit = Pattern::new(&pattern.to_lowercase())
            .map(|p| p.matches(&host))
            .unwrap_or(false);
        if hit && negated {
            return false;
        }
        matched |= hit;
    }

    matched
}

/// Expand ~ to home directory
fn expand_tilde(value: &str) -> String {
    if let Some(stripped) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    }
    value.to_string()
}

fn parse_strict_level(value: &str) -> i32 {
    match value.to_lowercase().as_str() {
        "yes" | "ask" | "true" => 1,
        "accept-new" => 2,
        "no" | "off" | "false" => 0,
        other => other.parse().unwrap_or(0),
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T) {
    if slot.is_none() {
        *slot = Some(value);
    }
}

/// Resolve the options that apply to `host` from config content
pub fn resolve_host_config(content: &str, host: &str) -> SshConfigHost {
    let mut resolved = SshConfigHost::default();
    // Options before the first Host line are global
    let mut applies = true;

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Parse "Key Value" or "Key=Value"
        let (key, value) = match line.find(|c: char| c == '=' || c.is_whitespace()) {
            Some(pos) => {
                let key = line[..pos].trim();
                let value = line[pos..].trim_start_matches(|c: char| c == '=' || c.is_whitespace());
                (key, value.trim())
            }
            None => continue, // Skip malformed lines
        };
        let value = value.trim_matches('"');

        match key.to_lowercase().as_str() {
            "host" => {
                applies = host_matches(value, host);
                continue;
            }
            // Match blocks need command execution and user context, never applied
            "match" => {
                applies = false;
                continue;
            }
            _ => {}
        }

        if !applies {
            continue;
        }

        match key.to_lowercase().as_str() {
            "hostname" => set_once(&mut resolved.hostname, value.to_string()),
            "user" => set_once(&mut resolved.user, value.to_string()),
            "port" => {
                if let Ok(port) = value.parse() {
                    set_once(&mut resolved.port, port);
                }
            }
            "identityfile" => set_once(&mut resolved.identity_file, expand_tilde(value)),
            "certificatefile" => set_once(&mut resolved.certificate_file, expand_tilde(value)),
            "proxycommand" => {
                if !value.eq_ignore_ascii_case("none") {
                    set_once(&mut resolved.proxy_command, value.to_string());
                }
            }
            "kexalgorithms" => set_once(&mut resolved.kex_algorithms, value.to_string()),
            "ciphers" => set_once(&mut resolved.ciphers, value.to_string()),
            "hostkeyalgorithms" => set_once(&mut resolved.host_key_algorithms, value.to_string()),
            "compression" => set_once(&mut resolved.compression, value.eq_ignore_ascii_case("yes")),
            "stricthostkeychecking" => {
                set_once(&mut resolved.strict_host_key_checking, parse_strict_level(value))
            }
            _ => {} // Ignore other directives
        }
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# Comment
Compression yes

Host bastion
    HostName bastion.example.com
    User admin
    Port 2222
    IdentityFile ~/.ssh/id_bastion

Host *.internal !db.internal
    User ops
    ProxyCommand ssh -W %h:%p bastion
    Ciphers aes256-gcm@openssh.com,chacha20-poly1305@openssh.com

Host *
    User fallback
    StrictHostKeyChecking accept-new
    Compression no
"#;

    #[test]
    fn test_exact_host() {
        let cfg = resolve_host_config(SAMPLE, "bastion");
        assert_eq!(cfg.hostname.as_deref(), Some("bastion.example.com"));
        assert_eq!(cfg.user.as_deref(), Some("admin"));
        assert_eq!(cfg.port, Some(2222));
        assert!(cfg.identity_file.unwrap().ends_with("id_bastion"));
        // Global section comes first, so it wins over "Host *"
        assert_eq!(cfg.compression, Some(true));
        assert_eq!(cfg.strict_host_key_checking, Some(2));
    }

    #[test]
    fn test_wildcard_and_first_value_wins() {
        let cfg = resolve_host_config(SAMPLE, "rdp.internal");
        assert_eq!(cfg.user.as_deref(), Some("ops"));
        assert_eq!(cfg.proxy_command.as_deref(), Some("ssh -W %h:%p bastion"));
        assert_eq!(
            cfg.ciphers.as_deref(),
            Some("aes256-gcm@openssh.com,chacha20-poly1305@openssh.com")
        );
        assert_eq!(cfg.effective_port(), 22);
    }

    #[test]
    fn test_negated_pattern() {
        let cfg = resolve_host_config(SAMPLE, "db.internal");
        assert_eq!(cfg.user.as_deref(), Some("fallback"));
        assert!(cfg.proxy_command.is_none());
    }

    #[test]
    fn test_equals_form_and_none() {
        let content = "Host x\n  Port=2200\n  ProxyCommand none\n  User = \"bob\"\n";
        let cfg = resolve_host_config(content, "x");
        assert_eq!(cfg.port, Some(2200));
        assert_eq!(cfg.user.as_deref(), Some("bob"));
        assert!(cfg.proxy_command.is_none());
    }

    #[test]
    fn test_match_block_ignored() {
        let content = "Match exec \"true\"\n  User nope\nHost y\n  User yes\n";
        let cfg = resolve_host_config(content, "y");
        assert_eq!(cfg.user.as_deref(), Some("yes"));
    }

    #[test]
    fn test_no_match() {
        let content = "Host other\n  User someone\n";
        assert!(resolve_host_config(content, "mine").is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_host_config(Some(dir.path().join("nope")), "host").await.unwrap();
        assert!(cfg.is_empty());
    }
}
