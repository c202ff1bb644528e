//! Interactive Auth Driver
//!
//! Runs the host-key gate, then loops [`authenticate`] against an
//! [`AuthPrompt`] collaborator. Each credential type gets at most three
//! authentication calls on one transport: the saved secret, then up to two
//! prompted ones.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::auth::{authenticate, AuthResult};
use super::host::format_server;
use super::known_hosts::HostKeyVerification;
use super::session::{param_key, password_key, username_key, AuthMethod, Session};
use crate::config::ConnectionParams;

/// Prompted retries after the first attempt
const MAX_PROMPTED_ATTEMPTS: usize = 2;

/// Upper bound on factors accepted through partial successes
const MAX_AUTH_FACTORS: usize = 4;

/// What the prompt collects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Password,
    Passphrase,
    KerberosToken,
    Otp,
}

impl CredentialKind {
    pub fn for_method(method: AuthMethod) -> Self {
        match method {
            AuthMethod::Password => CredentialKind::Password,
            AuthMethod::PublicKey | AuthMethod::Agent | AuthMethod::AutoPublicKey => {
                CredentialKind::Passphrase
            }
            AuthMethod::Gssapi => CredentialKind::KerberosToken,
            AuthMethod::KbdInteractive => CredentialKind::Otp,
        }
    }

    /// Parameter holding the saved secret; OTP codes are never saved.
    pub fn param_key(self, is_tunnel: bool) -> Option<String> {
        match self {
            CredentialKind::Password => Some(password_key(is_tunnel).to_string()),
            CredentialKind::Passphrase => Some(param_key("passphrase", is_tunnel)),
            CredentialKind::KerberosToken => Some(param_key("kerberos_token", is_tunnel)),
            CredentialKind::Otp => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CredentialKind::Password => "SSH password",
            CredentialKind::Passphrase => "SSH private key passphrase",
            CredentialKind::KerberosToken => "SSH Kerberos/GSSAPI",
            CredentialKind::Otp => "Enter TOTP/OTP/2FA code",
        }
    }
}

/// A credential dialog request
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialRequest {
    pub kind: CredentialKind,
    pub title: String,
    pub label: String,
    /// Shown only for password prompts
    pub username: Option<String>,
    pub username_editable: bool,
    pub default_secret: Option<String>,
    /// Offer a "save" checkbox
    pub can_remember: bool,
}

/// Answer of a credential dialog
#[derive(Debug, Clone, PartialEq)]
pub enum PromptReply {
    Ok {
        username: Option<String>,
        secret: String,
        remember: bool,
    },
    Cancel,
}

/// User-facing side of authentication
#[async_trait]
pub trait AuthPrompt: Send + Sync {
    /// Ask whether to trust an unknown or changed host key.
    async fn confirm_host_key(&self, message: &str, verification: &HostKeyVerification) -> bool;

    async fn request_credential(&self, request: &CredentialRequest) -> PromptReply;
}

/// Question shown for an untrusted host key
pub fn host_key_message(verification: &HostKeyVerification) -> Option<String> {
    match verification {
        HostKeyVerification::Verified => None,
        HostKeyVerification::Unknown { fingerprint } => Some(format!(
            "The server is unknown. The public key fingerprint is:\n{}\n\nDo you trust the new public key?",
            fingerprint
        )),
        HostKeyVerification::Changed {
            actual_fingerprint, ..
        } => Some(format!(
            "Warning: The server has changed its public key. This means you are either under attack,\n\
             or the administrator has changed the key. The new public key fingerprint is:\n{}\n\n\
             Do you trust the new public key?",
            actual_fingerprint
        )),
    }
}

/// `Some` ends authentication before any credential is sent.
async fn host_key_gate(session: &Session, prompt: &dyn AuthPrompt) -> Option<AuthResult> {
    let verification = match session.transport().await {
        Ok(mut t) => t.verify_host_key().await,
        Err(e) => Err(e),
    };
    let verification = match verification {
        Ok(v) => v,
        Err(e) => {
            session.set_error(format!("Could not check list of known SSH hosts. {}", e));
            return Some(AuthResult::FatalError);
        }
    };

    let message = host_key_message(&verification)?;
    let server = format_server(&session.server, session.port);

    if session.options.stricthostkeycheck > 0 {
        warn!("Rejecting untrusted host key of {} (strict checking)", server);
        session.set_error(format!(
            "Host key verification failed for {}. {}",
            server,
            message.lines().next().unwrap_or_default()
        ));
        return Some(AuthResult::FatalError);
    }

    if !prompt.confirm_host_key(&message, &verification).await {
        info!("Host key of {} declined", server);
        return Some(AuthResult::UserCancel);
    }

    let stored = match session.transport().await {
        Ok(mut t) => t.trust_host_key().await,
        Err(e) => Err(e),
    };
    match stored {
        Ok(()) => {
            info!("Host key of {} added to known_hosts", server);
            None
        }
        Err(e) => {
            session.set_error(format!("Could not check list of known SSH hosts. {}", e));
            Some(AuthResult::FatalError)
        }
    }
}

fn credential_request(
    session: &Session,
    kind: CredentialKind,
    params: &dyn ConnectionParams,
    disable_storing: bool,
) -> CredentialRequest {
    let title = if session.is_tunnel() {
        "SSH tunnel credentials"
    } else {
        "SSH credentials"
    };

    match kind {
        CredentialKind::Otp => CredentialRequest {
            kind,
            title: "Keyboard interactive login, TOTP/OTP/2FA".into(),
            label: kind.label().into(),
            username: None,
            username_editable: false,
            default_secret: None,
            can_remember: false,
        },
        CredentialKind::Password => CredentialRequest {
            kind,
            title: title.into(),
            label: kind.label().into(),
            username: params.get_string(username_key(session.is_tunnel())),
            username_editable: !session.is_tunnel(),
            default_secret: session.password().map(str::to_string),
            can_remember: !disable_storing,
        },
        _ => CredentialRequest {
            kind,
            title: title.into(),
            label: kind.label().into(),
            username: None,
            username_editable: false,
            default_secret: kind
                .param_key(session.is_tunnel())
                .and_then(|k| params.get_string(&k)),
            can_remember: !disable_storing,
        },
    }
}

/// Authenticate `session`, asking `prompt` for anything missing.
///
/// Returns [`AuthResult::Reconnect`] after a password prompt changed the
/// login of a direct session; the transport is already closed then.
pub async fn authenticate_interactive(
    session: &mut Session,
    prompt: &dyn AuthPrompt,
    params: &dyn ConnectionParams,
) -> AuthResult {
    if let Some(result) = host_key_gate(session, prompt).await {
        return result;
    }

    let disable_storing = params.get_int("disablepasswordstoring", 0) != 0;
    let mut result = AuthResult::FatalError;

    for factor in 0..MAX_AUTH_FACTORS {
        let kind = CredentialKind::for_method(session.auth);
        let key = kind.param_key(session.is_tunnel());
        let saved = key.as_deref().and_then(|k| params.get_non_empty(k));

        debug!(
            "Session {}: factor {} with {:?} ({:?})",
            session.id(),
            factor + 1,
            session.auth,
            kind
        );
        result = authenticate(session, saved.as_deref()).await;

        let mut attempt = 0;
        while attempt < MAX_PROMPTED_ATTEMPTS && result == AuthResult::AuthFailedRetryAfterPrompt {
            attempt += 1;
            if let Some(e) = session.error() {
                debug!("Retrying authentication because {}", e);
            }
            if session.is_host_key_rejected() {
                return AuthResult::FatalError;
            }
            if kind == CredentialKind::KerberosToken {
                session.set_error("Kerberos token prompt is not supported");
                return AuthResult::FatalError;
            }

            let request = credential_request(session, kind, params, disable_storing);
            let (username, secret, remember) = match prompt.request_credential(&request).await {
                PromptReply::Ok {
                    username,
                    secret,
                    remember,
                } => (username, zeroize::Zeroizing::new(secret), remember),
                PromptReply::Cancel => return AuthResult::UserCancel,
            };

            if let Some(key) = &key {
                if remember && !disable_storing {
                    params.set_string(key, Some(&secret));
                } else {
                    params.set_string(key, None);
                }
            }

            match kind {
                CredentialKind::Password if !session.is_tunnel() && !session.is_multi_auth() => {
                    if let Some(user) = username.filter(|u| !u.is_empty()) {
                        params.set_string(username_key(false), Some(&user));
                        session.user = Some(user);
                    }
                    session.set_password(Some(&secret));
                    session.disconnect().await;
                    info!("Session {}: reconnecting with new credentials", session.id());
                    return AuthResult::Reconnect;
                }
                CredentialKind::Otp => session.set_password(Some(&secret)),
                _ => {}
            }

            result = authenticate(session, Some(&secret)).await;
            debug!(
                "Authentication attempt {} returned {:?}: {:?}",
                attempt + 1,
                result,
                session.error()
            );
        }

        if result != AuthResult::Partial {
            break;
        }
    }

    match result {
        AuthResult::AuthFailedRetryAfterPrompt | AuthResult::Again | AuthResult::Partial => {
            warn!(
                "Session {}: SSH authentication failed: {:?}",
                session.id(),
                session.error()
            );
            AuthResult::FatalError
        }
        other => other,
    }
}
