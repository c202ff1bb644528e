//! SSH Authenticator
//!
//! One call to [`authenticate`] is one attempt with the session's current
//! method. Every method funnels its transport reply through [`finish`], which
//! records the outcome on the session and, after a partial success, picks the
//! next method with [`next_method`].

use tracing::{debug, info, warn};

use super::error::SshError;
use super::keyboard_interactive::{answer_all, MAX_KBI_ROUNDS};
use super::keys::{
    bind_certificate, existing_identities, home_dir, load_certificate, load_private_key_async,
    load_public_key, public_key_path,
};
use super::session::{AuthMethod, Session};
use super::transport::{AuthReply, KbdIntReply, MethodSet};

/// Outcome of one authentication attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Success,
    /// A factor was accepted; the session now holds the next method to try
    Partial,
    Again,
    /// Ask the user for a fresh secret and try again
    AuthFailedRetryAfterPrompt,
    UserCancel,
    FatalError,
    /// The session user changed; discard the transport and connect again
    Reconnect,
}

/// Either a transport reply to post-process, or an early outcome
enum Attempt {
    Reply(Result<AuthReply, SshError>),
    Done(AuthResult),
}

/// Method to continue with after a partial success, `None` when nothing usable is left.
///
/// A single offered method is used as is; with several, public key wins over
/// keyboard-interactive, which wins over password. Host-based leaves the
/// current method unchanged.
pub fn next_method(current: AuthMethod, methods: MethodSet) -> Option<AuthMethod> {
    if methods.contains(MethodSet::PUBLICKEY) {
        Some(AuthMethod::PublicKey)
    } else if methods.contains(MethodSet::INTERACTIVE) {
        Some(AuthMethod::KbdInteractive)
    } else if methods.contains(MethodSet::PASSWORD) {
        Some(AuthMethod::Password)
    } else if methods.contains(MethodSet::HOSTBASED) {
        Some(current)
    } else {
        None
    }
}

fn fatal(session: &Session, message: impl Into<String>) -> Attempt {
    session.set_error(message);
    Attempt::Done(AuthResult::FatalError)
}

/// Shared post-processing of every method's transport reply.
async fn finish(session: &mut Session, reply: Result<AuthReply, SshError>, failure: &str) -> AuthResult {
    match reply {
        Ok(AuthReply::Success) => {
            info!("Session {} authenticated with {:?}", session.id(), session.auth);
            session.authenticated = true;
            session.clear_error();
            AuthResult::Success
        }
        Ok(AuthReply::Partial) => {
            session.clear_secrets();
            session.multi_auth = true;

            let methods = match session.transport().await {
                Ok(mut t) => t.methods().await,
                Err(e) => {
                    session.set_error(format!("{} {}", failure, e));
                    return AuthResult::FatalError;
                }
            };

            match next_method(session.auth, methods) {
                Some(next) => {
                    info!(
                        "Session {}: partial success with {:?}, continuing with {:?} ({:?})",
                        session.id(),
                        session.auth,
                        next,
                        methods
                    );
                    session.auth = next;
                    AuthResult::Partial
                }
                None => {
                    session.set_error(format!(
                        "{} User auth method not supported: {:?}",
                        failure, methods
                    ));
                    AuthResult::FatalError
                }
            }
        }
        Ok(AuthReply::Again) => AuthResult::Again,
        Ok(AuthReply::Denied(msg)) | Ok(AuthReply::Error(msg)) => {
            session.authenticated = false;
            session.set_error(format!("{} {}", failure, msg));
            AuthResult::AuthFailedRetryAfterPrompt
        }
        Err(e) if e.is_fatal() => {
            session.authenticated = false;
            session.set_error(format!("{} {}", failure, e));
            AuthResult::FatalError
        }
        Err(e) => {
            session.authenticated = false;
            session.set_error(format!("{} {}", failure, e));
            AuthResult::AuthFailedRetryAfterPrompt
        }
    }
}

/// Re-verify the server host key; `Some` stops the attempt.
async fn recheck_host_key(session: &mut Session) -> Option<AuthResult> {
    let verification = match session.transport().await {
        Ok(mut t) => t.verify_host_key().await,
        Err(e) => Err(e),
    };

    session.host_key_rejected = false;
    match verification {
        Ok(v) if v.is_verified() => None,
        Ok(v) => {
            warn!("Session {}: host key no longer trusted ({:?})", session.id(), v);
            session.host_key_rejected = true;
            session.set_error(SshError::HostKeyChanged.to_string());
            Some(AuthResult::AuthFailedRetryAfterPrompt)
        }
        Err(e) => {
            session.set_error(format!("Could not check list of known SSH hosts. {}", e));
            Some(AuthResult::FatalError)
        }
    }
}

async fn password_attempt(session: &Session, user: &str) -> Result<AuthReply, SshError> {
    let password = zeroize::Zeroizing::new(session.password().unwrap_or_default().to_string());
    let mut t = session.transport().await?;
    t.auth_password(user, &password).await
}

/// Keyboard-interactive, answering every prompt with the cached OTP.
async fn kbdint_attempt(session: &Session, user: &str) -> Attempt {
    let otp = zeroize::Zeroizing::new(session.password().unwrap_or_default().to_string());
    if otp.is_empty() {
        session.set_error("OTP code is empty");
        return Attempt::Done(AuthResult::AuthFailedRetryAfterPrompt);
    }

    let mut reply = match session.transport().await {
        Ok(mut t) => t.kbdint_start(user).await,
        Err(e) => Err(e),
    };

    for round in 0..MAX_KBI_ROUNDS {
        match reply {
            Ok(KbdIntReply::Done(r)) => return Attempt::Reply(Ok(r)),
            Err(e) => return Attempt::Reply(Err(e)),
            Ok(KbdIntReply::InfoRequest {
                name,
                instructions,
                prompts,
            }) => {
                debug!(
                    "Keyboard-interactive round {} ({:?} / {:?}): {} prompt(s)",
                    round + 1,
                    name,
                    instructions,
                    prompts.len()
                );
                let answers = answer_all(&prompts, &otp);
                reply = match session.transport().await {
                    Ok(mut t) => t.kbdint_respond(answers).await,
                    Err(e) => Err(e),
                };
            }
        }
    }

    Attempt::Reply(Ok(AuthReply::Denied(
        "Too many keyboard-interactive rounds".into(),
    )))
}

async fn publickey_attempt(session: &Session, user: &str) -> Attempt {
    let Some(privkey) = session.privkeyfile.clone() else {
        return fatal(
            session,
            "Could not authenticate with public SSH key. SSH identity file not selected.",
        );
    };

    let pubkey = public_key_path(&privkey);
    if pubkey.exists() {
        if let Err(e) = load_public_key(&pubkey) {
            return fatal(session, format!("Public SSH key cannot be imported. {}", e));
        }
    }

    let passphrase = session
        .passphrase()
        .map(|p| zeroize::Zeroizing::new(p.to_string()));
    let key = match load_private_key_async(&privkey, passphrase.as_deref().map(String::as_str)).await {
        Ok(key) => key,
        Err(e) => {
            if passphrase.is_none() {
                session.set_error("No saved SSH passphrase supplied. Asking user to enter it.");
            } else {
                session.set_error(format!("Could not authenticate with public SSH key. {}", e));
            }
            return Attempt::Done(AuthResult::AuthFailedRetryAfterPrompt);
        }
    };

    let Some(certfile) = session.certfile.clone() else {
        return Attempt::Reply(match session.transport().await {
            Ok(mut t) => t.auth_publickey(user, key).await,
            Err(e) => Err(e),
        });
    };

    let cert = match load_certificate(&certfile) {
        Ok(cert) => cert,
        Err(e) => return fatal(session, format!("SSH certificate cannot be imported. {}", e)),
    };
    if let Err(e) = bind_certificate(&cert, &key) {
        return fatal(
            session,
            format!("SSH certificate cannot be copied into the private SSH key. {}", e),
        );
    }

    let reply = match session.transport().await {
        Ok(mut t) => t.auth_certificate(user, key, cert).await,
        Err(e) => Err(e),
    };
    match reply {
        Ok(AuthReply::Denied(msg)) | Ok(AuthReply::Error(msg)) => fatal(
            session,
            format!("Could not authenticate using SSH certificate. {}", msg),
        ),
        Err(e) => fatal(
            session,
            format!("Could not authenticate using SSH certificate. {}", e),
        ),
        other => Attempt::Reply(other),
    }
}

fn accepted(reply: &Result<AuthReply, SshError>) -> bool {
    matches!(
        reply,
        Ok(AuthReply::Success) | Ok(AuthReply::Partial) | Ok(AuthReply::Again)
    )
}

async fn agent_attempt(session: &Session, user: &str) -> Result<AuthReply, SshError> {
    let mut t = session.transport().await?;
    t.auth_agent(user).await
}

/// Agent keys first, then every existing default identity.
async fn auto_publickey_attempt(session: &Session, user: &str) -> Result<AuthReply, SshError> {
    let reply = agent_attempt(session, user).await;
    if accepted(&reply) {
        return reply;
    }
    debug!("Agent authentication did not succeed: {:?}", reply);

    let passphrase = session
        .passphrase()
        .map(|p| zeroize::Zeroizing::new(p.to_string()));
    let mut last = reply;

    for identity in existing_identities(&home_dir()) {
        let key = match load_private_key_async(&identity, passphrase.as_deref().map(String::as_str)).await {
            Ok(key) => key,
            Err(e) => {
                debug!("Skipping identity {:?}: {}", identity, e);
                continue;
            }
        };

        let reply = {
            let mut t = session.transport().await?;
            t.auth_publickey(user, key).await
        };
        if accepted(&reply) {
            info!("Identity {:?} accepted", identity);
            return reply;
        }
        last = reply;
    }

    last
}

/// Run one authentication attempt with the session's current method.
///
/// `secret`, when given, replaces both the cached password and passphrase.
pub async fn authenticate(session: &mut Session, secret: Option<&str>) -> AuthResult {
    if session.authenticated {
        return AuthResult::Success;
    }

    if let Some(result) = recheck_host_key(session).await {
        return result;
    }

    if let Some(secret) = secret {
        session.set_password(Some(secret));
        session.set_passphrase(Some(secret));
    }

    let methods = match session.transport().await {
        Ok(mut t) => t.methods().await,
        Err(e) => {
            session.set_error(format!("Could not authenticate. {}", e));
            return AuthResult::FatalError;
        }
    };
    debug!(
        "Session {}: server methods {:?}, using {:?}",
        session.id(),
        methods,
        session.auth
    );

    let user = session.user_name();
    let (attempt, failure) = match session.auth {
        AuthMethod::Password => {
            let failure = "Could not authenticate with SSH password.";
            if !methods.contains(MethodSet::PASSWORD) && !methods.contains(MethodSet::INTERACTIVE) {
                (fatal(session, format!("{} Method not offered by the server.", failure)), failure)
            } else {
                let mut attempt = None;
                if methods.contains(MethodSet::PASSWORD) {
                    attempt = Some(Attempt::Reply(password_attempt(session, &user).await));
                }
                let settled = matches!(&attempt, Some(Attempt::Reply(r)) if accepted(r));
                if !settled && methods.contains(MethodSet::INTERACTIVE) {
                    debug!("Trying keyboard-interactive with the password");
                    attempt = Some(kbdint_attempt(session, &user).await);
                }
                match attempt {
                    Some(a) => (a, failure),
                    None => (Attempt::Done(AuthResult::FatalError), failure),
                }
            }
        }
        AuthMethod::KbdInteractive => {
            let failure = "Could not authenticate with TOTP/OTP/2FA.";
            if methods.contains(MethodSet::INTERACTIVE) {
                (kbdint_attempt(session, &user).await, failure)
            } else {
                (fatal(session, format!("{} Method not offered by the server.", failure)), failure)
            }
        }
        AuthMethod::PublicKey => {
            let failure = "Could not authenticate with public SSH key.";
            if methods.contains(MethodSet::PUBLICKEY) {
                (publickey_attempt(session, &user).await, failure)
            } else {
                (fatal(session, format!("{} Method not offered by the server.", failure)), failure)
            }
        }
        AuthMethod::Agent => (
            Attempt::Reply(agent_attempt(session, &user).await),
            "Could not authenticate automatically with SSH agent.",
        ),
        AuthMethod::AutoPublicKey => {
            let failure = "Could not authenticate automatically with public SSH key.";
            if methods.contains(MethodSet::PUBLICKEY) {
                (Attempt::Reply(auto_publickey_attempt(session, &user).await), failure)
            } else {
                (fatal(session, format!("{} Method not offered by the server.", failure)), failure)
            }
        }
        AuthMethod::Gssapi => {
            let failure = "Could not authenticate with SSH GSSAPI/Kerberos.";
            if methods.contains(MethodSet::GSSAPI_MIC) {
                let reply = match session.transport().await {
                    Ok(mut t) => t.auth_gssapi(&user).await,
                    Err(e) => Err(e),
                };
                (Attempt::Reply(reply), failure)
            } else {
                (fatal(session, format!("{} Method not offered by the server.", failure)), failure)
            }
        }
    };

    match attempt {
        Attempt::Done(result) => result,
        Attempt::Reply(reply) => finish(session, reply, failure).await,
    }
}
