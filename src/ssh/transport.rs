//! Transport seam
//!
//! [`Transport`] is everything the session core, the authenticator and the
//! tunnels need from one SSH connection. [`Connector`] opens one. The russh
//! implementations live in `client.rs`; tests plug in scripted ones.

use std::fmt;
use std::ops::BitOr;
use std::path::PathBuf;

use async_trait::async_trait;
use russh::client::Msg;
use russh::keys::{Certificate, PrivateKey};
use russh::Channel;
use tokio::sync::mpsc;

use super::channel::ChannelLink;
use super::error::SshError;
use super::keyboard_interactive::KbiPrompt;
use super::known_hosts::HostKeyVerification;
use crate::config::Preferences;

/// Authentication methods offered by the server
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodSet(u32);

impl MethodSet {
    pub const NONE: Self = Self(0x01);
    pub const PASSWORD: Self = Self(0x02);
    pub const PUBLICKEY: Self = Self(0x04);
    pub const HOSTBASED: Self = Self(0x08);
    pub const INTERACTIVE: Self = Self(0x10);
    pub const GSSAPI_MIC: Self = Self(0x20);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & 0x3f)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Build from SSH method names (`password`, `publickey`, ...); unknown names are ignored.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        names.into_iter().fold(Self::empty(), |set, name| {
            set | match name {
                "none" => Self::NONE,
                "password" => Self::PASSWORD,
                "publickey" => Self::PUBLICKEY,
                "hostbased" => Self::HOSTBASED,
                "keyboard-interactive" => Self::INTERACTIVE,
                "gssapi-with-mic" => Self::GSSAPI_MIC,
                _ => Self::empty(),
            }
        })
    }
}

impl BitOr for MethodSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for MethodSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(MethodSet, &str); 6] = [
            (MethodSet::NONE, "none"),
            (MethodSet::PASSWORD, "password"),
            (MethodSet::PUBLICKEY, "publickey"),
            (MethodSet::HOSTBASED, "hostbased"),
            (MethodSet::INTERACTIVE, "keyboard-interactive"),
            (MethodSet::GSSAPI_MIC, "gssapi-with-mic"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(m, _)| self.contains(*m))
            .map(|(_, n)| *n)
            .collect();
        write!(f, "MethodSet({})", names.join(","))
    }
}

/// Outcome of one authentication call
#[derive(Debug, Clone, PartialEq)]
pub enum AuthReply {
    Success,
    /// Accepted, but the server requires another method
    Partial,
    /// Retry the same call
    Again,
    Denied(String),
    Error(String),
}

/// Outcome of one keyboard-interactive round
#[derive(Debug, Clone, PartialEq)]
pub enum KbdIntReply {
    Done(AuthReply),
    InfoRequest {
        name: String,
        instructions: String,
        prompts: Vec<KbiPrompt>,
    },
}

/// A channel the server opened for a remote listen
#[derive(Debug)]
pub struct ForwardedChannel {
    pub link: ChannelLink,
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

/// Forwarded channels, in arrival order
pub type ForwardInbox = mpsc::UnboundedReceiver<ForwardedChannel>;

/// One SSH connection
#[async_trait]
pub trait Transport: Send {
    /// Check the server host key against known_hosts.
    async fn verify_host_key(&mut self) -> Result<HostKeyVerification, SshError>;

    /// Store the server host key in known_hosts.
    async fn trust_host_key(&mut self) -> Result<(), SshError>;

    /// Methods the server currently accepts.
    async fn methods(&mut self) -> MethodSet;

    async fn auth_none(&mut self, user: &str) -> Result<AuthReply, SshError>;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<AuthReply, SshError>;

    async fn auth_publickey(&mut self, user: &str, key: PrivateKey) -> Result<AuthReply, SshError>;

    async fn auth_certificate(
        &mut self,
        user: &str,
        key: PrivateKey,
        cert: Certificate,
    ) -> Result<AuthReply, SshError>;

    /// Try every key held by the SSH agent.
    async fn auth_agent(&mut self, user: &str) -> Result<AuthReply, SshError>;

    async fn kbdint_start(&mut self, user: &str) -> Result<KbdIntReply, SshError>;

    async fn kbdint_respond(&mut self, responses: Vec<String>) -> Result<KbdIntReply, SshError>;

    async fn auth_gssapi(&mut self, _user: &str) -> Result<AuthReply, SshError> {
        Err(SshError::Unsupported("GSSAPI authentication".into()))
    }

    /// Open a direct-tcpip channel to `host:port`.
    async fn open_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        originator: &str,
        originator_port: u16,
    ) -> Result<ChannelLink, SshError>;

    /// Ask the server to listen on `address:port`; returns the bound port.
    async fn request_forward(&mut self, address: &str, port: u16) -> Result<u16, SshError>;

    async fn cancel_forward(&mut self, address: &str, port: u16) -> Result<(), SshError>;

    /// Receiver of forwarded channels; only the first call returns it.
    fn take_forward_inbox(&mut self) -> Option<ForwardInbox>;

    /// Open a session channel (shell, exec, subsystem).
    async fn open_session_channel(&mut self) -> Result<Channel<Msg>, SshError> {
        Err(SshError::Unsupported("session channels".into()))
    }

    async fn disconnect(&mut self);
}

/// Everything needed to open one SSH connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Comma separated lists; `None` keeps the library defaults
    pub kex: Option<String>,
    pub ciphers: Option<String>,
    pub hostkeys: Option<String>,
    pub compression: bool,
    pub proxy_command: Option<String>,
    pub known_hosts_path: PathBuf,
    pub preferences: Preferences,
}

/// Opens transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>, SshError>;
}
