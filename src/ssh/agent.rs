//! Agent-backed public key authentication
//!
//! The agent holds the keys and signs the server challenge; the session only
//! ever sees public halves. Unix reaches the agent through `SSH_AUTH_SOCK`,
//! Windows through the OpenSSH named pipe.

use std::future::Future;

use russh::client::{AuthResult, Handle};
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info};

use super::client::ClientHandler;
use super::error::SshError;

type AgentConnection = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

#[cfg(windows)]
const AGENT_PIPE: &str = r"\\.\pipe\openssh-ssh-agent";

/// Signs with the agent; the key is cloned so the future stays `Send`.
struct AgentSigner<'a>(&'a mut AgentConnection);

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key = key.clone();
        async move {
            self.0
                .sign_request(&key, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

async fn connect_agent() -> Result<AgentConnection, SshError> {
    #[cfg(unix)]
    {
        AgentClient::connect_env()
            .await
            .map(AgentClient::dynamic)
            .map_err(|e| SshError::AgentNotAvailable(format!("{} (is SSH_AUTH_SOCK set?)", e)))
    }

    #[cfg(windows)]
    {
        AgentClient::connect_named_pipe(AGENT_PIPE)
            .await
            .map(AgentClient::dynamic)
            .map_err(|e| SshError::AgentNotAvailable(e.to_string()))
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(SshError::AgentNotAvailable("no agent transport on this platform".into()))
    }
}

/// Offer the agent's identities in order.
///
/// Stops at the first success or partial success; otherwise returns the
/// server's last rejection. An empty agent is an error.
pub(crate) async fn offer_agent_identities(
    handle: &mut Handle<ClientHandler>,
    user: &str,
) -> Result<AuthResult, SshError> {
    let mut agent = connect_agent().await?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| SshError::AgentError(format!("Could not list identities. {}", e)))?;
    if identities.is_empty() {
        return Err(SshError::AgentError("The agent holds no identities".into()));
    }
    debug!("Agent offers {} identities", identities.len());

    let mut rejected = None;
    for identity in identities {
        let comment = identity.comment().to_string();
        let result = handle
            .authenticate_publickey_with(user, identity, None, &mut AgentSigner(&mut agent))
            .await
            .map_err(|e| SshError::AgentError(format!("Signing with {:?} failed. {}", comment, e)))?;

        match result {
            AuthResult::Success
            | AuthResult::Failure {
                partial_success: true,
                ..
            } => {
                info!("Agent identity {:?} accepted", comment);
                return Ok(result);
            }
            failure => {
                debug!("Agent identity {:?} rejected", comment);
                rejected = Some(failure);
            }
        }
    }

    rejected.ok_or_else(|| SshError::AgentError("No agent identity was tried".into()))
}

/// Quick check for an agent endpoint; connecting may still fail.
pub fn is_agent_available() -> bool {
    if cfg!(unix) {
        std::env::var_os("SSH_AUTH_SOCK").is_some_and(|s| !s.is_empty())
    } else {
        cfg!(windows)
    }
}
