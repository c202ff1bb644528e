//! Known hosts store for SSH host key verification
//!
//! Entries are keyed `host` for port 22 and `[host]:port` otherwise, the way
//! OpenSSH writes them. Hashed entries (`|1|...`) are skipped.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;
use super::host::{format_server, DEFAULT_SSH_PORT};

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches the stored entry
    Verified,
    /// No entry for this host and key type
    Unknown { fingerprint: String },
    /// Stored key differs (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

impl HostKeyVerification {
    pub fn is_verified(&self) -> bool {
        matches!(self, HostKeyVerification::Verified)
    }
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// Default `~/.ssh/known_hosts` location
pub fn default_known_hosts_path() -> PathBuf {
    super::keys::home_dir().join(".ssh").join("known_hosts")
}

/// In-memory view of one known_hosts file
pub struct KnownHostsStore {
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path: path.into(),
        };

        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts {:?}: {}", store.path, e);
        }

        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            debug!("No known_hosts at {:?}", self.path);
            return Ok(());
        }

        let content = fs::read_to_string(&self.path)?;
        let mut hosts = self.hosts.write();

        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let mut parts = line.split_whitespace();
            let (Some(names), Some(key_type), Some(key_data)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };

            let entry = HostKeyEntry {
                key_type: key_type.to_string(),
                key_data: key_data.to_string(),
            };

            for name in names.split(',').filter(|n| !n.starts_with('|')) {
                hosts
                    .entry(name.to_lowercase())
                    .or_default()
                    .push(entry.clone());
            }
        }

        debug!("Loaded {} known hosts from {:?}", hosts.len(), self.path);
        Ok(())
    }

    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == DEFAULT_SSH_PORT {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint of a public key
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    /// Verify a host's public key
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();
        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        let mut mismatch = None;
        for entry in entries.iter().filter(|e| e.key_type == key_type) {
            if entry.key_data == actual_b64 {
                debug!("Host key verified for {} ({})", lookup_key, key_type);
                return HostKeyVerification::Verified;
            }
            mismatch.get_or_insert(entry);
        }

        match mismatch {
            Some(entry) => {
                let expected_fingerprint = BASE64
                    .decode(&entry.key_data)
                    .map(|b| Self::fingerprint_bytes(&b))
                    .unwrap_or_else(|_| "unknown".to_string());
                warn!(
                    "HOST KEY CHANGED for {} ({})! Expected {}, got {}",
                    lookup_key, key_type, expected_fingerprint, fingerprint
                );
                HostKeyVerification::Changed {
                    expected_fingerprint,
                    actual_fingerprint: fingerprint,
                }
            }
            None => {
                debug!("Host {} known but no {} key stored", lookup_key, key_type);
                HostKeyVerification::Unknown { fingerprint }
            }
        }
    }

    /// Trust `key` for `host:port`, replacing any stored key of the same type.
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        let key_type = key.algorithm().as_str().to_string();
        let key_b64 = BASE64.encode(key.public_key_bytes());

        let replaced = {
            let mut hosts = self.hosts.write();
            let entries = hosts.entry(lookup_key.clone()).or_default();
            let before = entries.len();
            entries.retain(|e| e.key_type != key_type);
            let replaced = entries.len() != before;
            entries.push(HostKeyEntry {
                key_type: key_type.clone(),
                key_data: key_b64.clone(),
            });
            replaced
        };

        if replaced {
            self.rewrite()?;
        } else {
            self.append_to_file(&lookup_key, &key_type, &key_b64)?;
        }

        info!(
            "Added host key for {} ({}) to known_hosts",
            format_server(host, port),
            key_type
        );
        Ok(())
    }

    /// Forget every key of `host:port`.
    pub fn remove_host(&self, host: &str, port: u16) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        if self.hosts.write().remove(&lookup_key).is_some() {
            self.rewrite()?;
            info!("Removed host key for {} from known_hosts", lookup_key);
        }
        Ok(())
    }

    fn append_to_file(&self, host: &str, key_type: &str, key_b64: &str) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", host, key_type, key_b64)?;
        Ok(())
    }

    // Comments and hashed-only lines are kept verbatim, every plain entry is
    // regenerated from the cache.
    fn rewrite(&self) -> Result<(), SshError> {
        let hosts = self.hosts.read();
        let existing = fs::read_to_string(&self.path).unwrap_or_default();

        let mut out: Vec<String> = existing
            .lines()
            .filter(|line| {
                let line = line.trim();
                let names = line.split_whitespace().next().unwrap_or("");
                line.starts_with('#') || names.split(',').all(|n| n.starts_with('|'))
            })
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();

        let mut keys: Vec<_> = hosts.keys().collect();
        keys.sort();
        for host in keys {
            for entry in &hosts[host] {
                out.push(format!("{} {} {}", host, entry.key_type, entry.key_data));
            }
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, out.join("\n") + "\n")?;
        Ok(())
    }
}
