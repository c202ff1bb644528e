//! SSH module - sessions, authentication and channels
//!
//! Built on the russh library.
//!
//! # Features
//! - Direct and ProxyCommand connections with TCP keepalive tuning
//! - `~/.ssh/config` defaults and host key verification via `~/.ssh/known_hosts`
//! - Password, public key (with certificates), agent, automatic public key
//!   and keyboard-interactive (OTP / 2FA) authentication
//! - Interactive retry driver with host-key confirmation
//! - Shell and SFTP channels on an authenticated session

mod agent;
pub mod auth;
pub mod auth_driver;
pub mod channel;
pub mod charset;
mod client;
mod error;
pub mod host;
pub mod keyboard_interactive;
pub mod keys;
pub mod known_hosts;
mod proxy;
pub mod session;
pub mod sftp;
pub mod shell;
pub mod transport;

pub use agent::is_agent_available;
pub use auth::{authenticate, next_method, AuthResult};
pub use auth_driver::{
    authenticate_interactive, AuthPrompt, CredentialKind, CredentialRequest, PromptReply,
};
pub use channel::{ChannelLink, ChannelPeer, ChannelRead};
pub use charset::RemoteCharset;
pub use client::{ClientHandler, RusshConnector, RusshTransport};
pub use error::SshError;
pub use host::{format_server, parse_server, DEFAULT_SSH_PORT};
pub use keyboard_interactive::KbiPrompt;
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use proxy::{expand_proxy_command, ProxyCommandStream};
pub use session::{AuthMethod, Session, SessionOptions};
pub use sftp::{RemoteEntry, SftpChannel};
pub use shell::{ExitCallback, Shell, ShellOptions};
pub use transport::{
    AuthReply, ConnectRequest, Connector, ForwardInbox, ForwardedChannel, KbdIntReply, MethodSet,
    Transport,
};
