//! ssh-tunnel-core - SSH sessions and tunnels for remote desktop clients
//!
//! Establishes one authenticated SSH transport per [`ssh::Session`] and
//! multiplexes local, X11 and reverse forwarded streams over it with
//! [`forwarding::Tunnel`].
//!
//! Typical flow:
//! 1. [`ssh::Session::from_params`] reads connection parameters
//! 2. [`ssh::Session::connect`] opens the transport
//! 3. [`ssh::authenticate_interactive`] authenticates, prompting as needed
//! 4. a [`forwarding::Tunnel`], [`ssh::Shell`] or [`ssh::SftpChannel`] takes the session

pub mod config;
pub mod forwarding;
pub mod logging;
pub mod ssh;

pub use config::{ConnectionParams, ParamStore, Preferences};
pub use forwarding::{Tunnel, TunnelCallbacks, TunnelInfo, TunnelKind};
pub use logging::{init_logging, LoggingError, LoggingHandle};
pub use ssh::{
    authenticate_interactive, AuthMethod, AuthPrompt, AuthResult, Session, SshError,
};
