//! SFTP channel
//!
//! Opens the `sftp` subsystem on an authenticated session and hands the
//! channel stream to a `russh-sftp` client.

use russh_sftp::client::SftpSession;
use tracing::{debug, info};

use super::error::SshError;
use super::session::Session;

/// One remote directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// An SFTP client bound to its own session
pub struct SftpChannel {
    session: Session,
    sftp: SftpSession,
    cwd: String,
}

impl SftpChannel {
    /// Open the subsystem and initialize the client.
    pub async fn open(session: Session) -> Result<Self, SshError> {
        let opened = match session.transport().await {
            Ok(mut t) => t.open_session_channel().await,
            Err(e) => Err(e),
        };
        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                session.set_error(format!("Could not create SFTP session. {}", e));
                return Err(e);
            }
        };

        if let Err(e) = channel.request_subsystem(true, "sftp").await {
            session.set_error(format!("Could not create SFTP session. {}", e));
            return Err(SshError::ChannelError(e.to_string()));
        }

        let sftp = match SftpSession::new(channel.into_stream()).await {
            Ok(sftp) => sftp,
            Err(e) => {
                session.set_error(format!("Could not start SFTP session. {}", e));
                return Err(SshError::ProtocolError(e.to_string()));
            }
        };

        let cwd = sftp
            .canonicalize(".")
            .await
            .map_err(|e| SshError::ProtocolError(e.to_string()))?;

        info!("SFTP session opened for {} in {}", session.id(), cwd);
        Ok(Self { session, sftp, cwd })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn client(&self) -> &SftpSession {
        &self.sftp
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Entries of `path` (relative paths resolve against the working directory).
    pub async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SshError> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.cwd.trim_end_matches('/'), path)
        };
        debug!("Listing {}", path);

        let entries = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| SshError::ProtocolError(e.to_string()))?;

        Ok(entries
            .filter(|e| e.file_name() != "." && e.file_name() != "..")
            .map(|e| {
                let meta = e.metadata();
                RemoteEntry {
                    name: e.file_name(),
                    is_dir: meta.is_dir(),
                    size: meta.size.unwrap_or(0),
                }
            })
            .collect())
    }

    /// Close the SFTP client and the session.
    pub async fn free(self) {
        if let Err(e) = self.sftp.close().await {
            debug!("SFTP close failed: {}", e);
        }
        self.session.disconnect().await;
    }
}
