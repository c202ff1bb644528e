//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("The public SSH key changed!")]
    HostKeyChanged,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("SSH Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("SSH Agent error: {0}")]
    AgentError(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Broken caller contract, never caused by user input.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SshError {
    /// Errors that re-entering a credential cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SshError::HostKeyChanged
                | SshError::Unsupported(_)
                | SshError::ConfigError(_)
                | SshError::Internal(_)
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

// String form, so errors can cross an IPC boundary
impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
