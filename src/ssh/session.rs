//! SSH Session Core
//!
//! One [`Session`] is one SSH transport plus everything needed to build and
//! authenticate it. It is created from connection parameters, connected once,
//! authenticated by `auth.rs` / `auth_driver.rs`, then shared by a tunnel,
//! shell or SFTP wrapper.
//!
//! Transport calls are serialized through an async mutex that is locked per
//! call and never held across local I/O. The lock is taken as an owned guard,
//! so futures holding it stay `Send` and can be spawned.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::charset::RemoteCharset;
use super::client::RusshConnector;
use super::error::SshError;
use super::host::{format_server, parse_server, DEFAULT_SSH_PORT};
use super::keys::{default_identity, home_dir, resolve_identity};
use super::known_hosts::default_known_hosts_path;
use super::transport::{AuthReply, ConnectRequest, Connector, Transport};
use crate::config::{load_host_config, ConnectionParams, Preferences, SshConfigHost};

/// Authentication method, stored as `ssh_auth` / `ssh_tunnel_auth`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    Password = 0,
    PublicKey = 1,
    Agent = 2,
    AutoPublicKey = 3,
    Gssapi = 4,
    KbdInteractive = 5,
}

impl AuthMethod {
    /// Unknown ids fall back to password.
    pub fn from_id(id: i64) -> Self {
        match id {
            1 => AuthMethod::PublicKey,
            2 => AuthMethod::Agent,
            3 => AuthMethod::AutoPublicKey,
            4 => AuthMethod::Gssapi,
            5 => AuthMethod::KbdInteractive,
            _ => AuthMethod::Password,
        }
    }

    pub fn id(self) -> i64 {
        self as i64
    }
}

/// Negotiation overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOptions {
    pub kex: Option<String>,
    pub ciphers: Option<String>,
    pub hostkeys: Option<String>,
    pub compression: bool,
    /// 0 = ask for unknown keys, > 0 = reject unknown keys
    pub stricthostkeycheck: i32,
    pub proxycommand: Option<String>,
    pub charset: Option<String>,
}

/// Parameter key for `base`: `ssh_<base>` or `ssh_tunnel_<base>`
pub fn param_key(base: &str, is_tunnel: bool) -> String {
    if is_tunnel {
        format!("ssh_tunnel_{}", base)
    } else {
        format!("ssh_{}", base)
    }
}

/// Key of the login name parameter
pub fn username_key(is_tunnel: bool) -> &'static str {
    if is_tunnel {
        "ssh_tunnel_username"
    } else {
        "username"
    }
}

/// Key of the saved password parameter
pub fn password_key(is_tunnel: bool) -> &'static str {
    if is_tunnel {
        "ssh_tunnel_password"
    } else {
        "password"
    }
}

type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Exclusive use of the connected transport for one call
pub(crate) type TransportGuard = OwnedMutexGuard<Box<dyn Transport>>;

/// One SSH transport and its settings
pub struct Session {
    id: String,
    pub server: String,
    pub port: u16,
    pub user: Option<String>,
    pub auth: AuthMethod,
    password: Option<Zeroizing<String>>,
    passphrase: Option<Zeroizing<String>>,
    pub privkeyfile: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub options: SessionOptions,
    is_tunnel: bool,
    tunnel_entrance: Option<(String, u16)>,
    preferences: Preferences,
    connector: Arc<dyn Connector>,
    transport: parking_lot::Mutex<Option<SharedTransport>>,
    pub(crate) authenticated: bool,
    pub(crate) multi_auth: bool,
    /// Set when the server's host key stopped matching known_hosts
    pub(crate) host_key_rejected: bool,
    error: parking_lot::Mutex<Option<String>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("server", &format_server(&self.server, self.port))
            .field("user", &self.user)
            .field("auth", &self.auth)
            .field("is_tunnel", &self.is_tunnel)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

impl Session {
    /// Build a session from connection parameters.
    ///
    /// Tunnel sessions read the `ssh_tunnel_*` keys; an empty tunnel server
    /// means the connection's own server on port 22.
    pub fn from_params(params: &dyn ConnectionParams, is_tunnel: bool) -> Self {
        let key = |base: &str| param_key(base, is_tunnel);

        let (server, port) = if is_tunnel {
            match params.get_non_empty("ssh_tunnel_server") {
                Some(s) => parse_server(&s, DEFAULT_SSH_PORT),
                None => {
                    let host = params
                        .get_non_empty("server")
                        .map(|s| parse_server(&s, DEFAULT_SSH_PORT).0)
                        .unwrap_or_else(|| "localhost".to_string());
                    (host, DEFAULT_SSH_PORT)
                }
            }
        } else {
            let server = params
                .get_non_empty("server")
                .unwrap_or_else(|| "localhost".to_string());
            parse_server(&server, DEFAULT_SSH_PORT)
        };

        let home = home_dir();
        let privkeyfile = match params.get_non_empty(&key("privatekey")) {
            Some(p) => Some(resolve_identity(&p, &home)),
            None => default_identity(&home),
        };
        let certfile = params
            .get_non_empty(&key("certfile"))
            .map(|p| resolve_identity(&p, &home));

        let options = SessionOptions {
            kex: params.get_non_empty(&key("kex_algorithms")),
            ciphers: params.get_non_empty(&key("ciphers")),
            hostkeys: params.get_non_empty(&key("hostkeytypes")),
            compression: params.get_int(&key("compression"), 0) == 1,
            stricthostkeycheck: params.get_int(&key("stricthostkeycheck"), 0) as i32,
            proxycommand: params.get_non_empty(&key("proxycommand")),
            charset: params.get_non_empty("ssh_charset"),
        };

        let session = Self {
            id: Uuid::new_v4().to_string(),
            server,
            port,
            user: params.get_non_empty(username_key(is_tunnel)),
            auth: AuthMethod::from_id(params.get_int(&key("auth"), 0)),
            password: params.get_non_empty(password_key(is_tunnel)).map(Zeroizing::new),
            passphrase: params.get_non_empty(&key("passphrase")).map(Zeroizing::new),
            privkeyfile,
            certfile,
            options,
            is_tunnel,
            tunnel_entrance: None,
            preferences: Preferences::default(),
            connector: Arc::new(RusshConnector),
            transport: parking_lot::Mutex::new(None),
            authenticated: false,
            multi_auth: false,
            host_key_rejected: false,
            error: parking_lot::Mutex::new(None),
        };

        debug!(
            "Session {} initialized for {} (tunnel: {}, auth: {:?})",
            session.id,
            format_server(&session.server, session.port),
            is_tunnel,
            session.auth
        );
        session
    }

    /// A new, unconnected session with the same settings.
    pub fn fork(&self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            server: self.server.clone(),
            port: self.port,
            user: self.user.clone(),
            auth: self.auth,
            password: self.password.clone(),
            passphrase: self.passphrase.clone(),
            privkeyfile: self.privkeyfile.clone(),
            certfile: self.certfile.clone(),
            options: self.options.clone(),
            is_tunnel: self.is_tunnel,
            tunnel_entrance: self.tunnel_entrance.clone(),
            preferences: self.preferences.clone(),
            connector: self.connector.clone(),
            transport: parking_lot::Mutex::new(None),
            authenticated: false,
            multi_auth: false,
            host_key_rejected: false,
            error: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_preferences(mut self, preferences: Preferences) -> Self {
        self.preferences = preferences;
        self
    }

    /// Local end of the tunnel this (non-tunnel) session connects through.
    pub fn set_tunnel_entrance(&mut self, host: impl Into<String>, port: u16) {
        self.tunnel_entrance = Some((host.into(), port));
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_tunnel(&self) -> bool {
        self.is_tunnel
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_multi_auth(&self) -> bool {
        self.multi_auth
    }

    /// The last attempt stopped because the host key no longer matched.
    pub fn is_host_key_rejected(&self) -> bool {
        self.host_key_rejected
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().map(String::as_str)
    }

    pub fn set_password(&mut self, password: Option<&str>) {
        self.password = password.map(|p| Zeroizing::new(p.to_string()));
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref().map(String::as_str)
    }

    pub fn set_passphrase(&mut self, passphrase: Option<&str>) {
        self.passphrase = passphrase.map(|p| Zeroizing::new(p.to_string()));
    }

    /// Forget cached password and passphrase.
    pub fn clear_secrets(&mut self) {
        self.password = None;
        self.passphrase = None;
    }

    /// Encoding of remote file names (`ssh_charset`)
    pub fn charset(&self) -> RemoteCharset {
        RemoteCharset::from_label(self.options.charset.as_deref())
    }

    /// Login name, resolved on connect.
    pub fn user_name(&self) -> String {
        self.user.clone().unwrap_or_default()
    }

    /// Last recorded error message
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("Session {} error: {}", self.id, message);
        *self.error.lock() = Some(message);
    }

    pub fn clear_error(&self) {
        *self.error.lock() = None;
    }

    /// Lock the transport for one call.
    pub(crate) async fn transport(&self) -> Result<TransportGuard, SshError> {
        let shared = self.transport.lock().clone().ok_or(SshError::Disconnected)?;
        Ok(shared.lock_owned().await)
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.lock().is_some()
    }

    fn apply_ssh_config(&mut self, cfg: &SshConfigHost, connect_host: &mut String, via_entrance: bool) {
        if !via_entrance {
            if let Some(hostname) = &cfg.hostname {
                *connect_host = hostname.clone();
            }
        }
        if self.user.is_none() {
            self.user = cfg.user.clone();
        }
        if self.options.proxycommand.is_none() {
            self.options.proxycommand = cfg.proxy_command.clone();
        }
        if self.options.kex.is_none() {
            self.options.kex = cfg.kex_algorithms.clone();
        }
        if self.options.ciphers.is_none() {
            self.options.ciphers = cfg.ciphers.clone();
        }
        if self.options.hostkeys.is_none() {
            self.options.hostkeys = cfg.host_key_algorithms.clone();
        }
        if !self.options.compression {
            self.options.compression = cfg.compression.unwrap_or(false);
        }
        if self.options.stricthostkeycheck == 0 {
            self.options.stricthostkeycheck = cfg.strict_host_key_checking.unwrap_or(0);
        }
        if self.privkeyfile.is_none() {
            self.privkeyfile = cfg.identity_file.as_ref().map(PathBuf::from);
        }
        if self.certfile.is_none() {
            self.certfile = cfg.certificate_file.as_ref().map(PathBuf::from);
        }
    }

    /// Open the transport and probe "none" authentication.
    pub async fn connect(&mut self) -> Result<(), SshError> {
        let (mut host, port) = match (&self.tunnel_entrance, self.is_tunnel) {
            (None, true) => (self.server.clone(), self.port),
            (Some((host, port)), false) => (host.clone(), *port),
            _ => {
                let msg = "tunnel sessions cannot have a tunnel entrance and other sessions need one";
                self.set_error(msg);
                return Err(SshError::Internal(msg.into()));
            }
        };

        // Behind a local tunnel the config entry of the real server applies
        let via_entrance = !self.is_tunnel && host == "127.0.0.1";
        let config_host = if via_entrance {
            self.server.clone()
        } else {
            host.clone()
        };

        if self.preferences.ssh_parseconfig {
            match load_host_config(self.preferences.ssh_config_path.clone(), &config_host).await {
                Ok(cfg) => self.apply_ssh_config(&cfg, &mut host, via_entrance),
                Err(e) => warn!("Could not parse SSH config for {}: {}", config_host, e),
            }
        }

        if self.user.is_none() {
            self.user = Some(whoami::username());
        }
        let user = self.user_name();

        let request = ConnectRequest {
            host,
            port,
            user: user.clone(),
            kex: self.options.kex.clone(),
            ciphers: self.options.ciphers.clone(),
            hostkeys: self.options.hostkeys.clone(),
            compression: self.options.compression,
            proxy_command: self.options.proxycommand.clone(),
            known_hosts_path: self
                .preferences
                .known_hosts_path
                .clone()
                .unwrap_or_else(default_known_hosts_path),
            preferences: self.preferences.clone(),
        };

        let mut transport = match self.connector.connect(&request).await {
            Ok(t) => t,
            Err(e) => {
                self.set_error(format!("Could not start SSH session. {}", e));
                return Err(e);
            }
        };

        match transport.auth_none(&user).await {
            Ok(AuthReply::Success) => {
                info!("Session {}: server accepted \"none\" authentication", self.id);
                self.authenticated = true;
            }
            Ok(reply) => debug!("Session {}: \"none\" probe returned {:?}", self.id, reply),
            Err(e) => debug!("Session {}: \"none\" probe failed: {}", self.id, e),
        }

        *self.transport.lock() = Some(Arc::new(Mutex::new(transport)));
        info!(
            "Session {} connected to {} as {}",
            self.id,
            format_server(&request.host, request.port),
            user
        );
        Ok(())
    }

    /// Close the transport, if open.
    pub async fn disconnect(&self) {
        let transport = self.transport.lock().take();
        if let Some(shared) = transport {
            shared.lock_owned().await.disconnect().await;
            debug!("Session {} disconnected", self.id);
        }
    }
}
