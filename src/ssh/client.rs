//! SSH Client implementation using russh
//!
//! [`RusshConnector`] opens the TCP (or ProxyCommand) stream, tunes keepalive
//! and runs the handshake. [`RusshTransport`] adapts the resulting
//! `Handle<ClientHandler>` to [`Transport`].

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{self, AuthResult, Handle, KeyboardInteractiveAuthResponse, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{Certificate, PrivateKey, PublicKey};
use russh::{Channel, Disconnect, Preferred};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::agent::{is_agent_available, offer_agent_identities};
use super::channel::ChannelLink;
use super::error::SshError;
use super::host::format_server;
use super::keyboard_interactive::KbiPrompt;
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use super::proxy::{expand_proxy_command, ProxyCommandStream};
use super::transport::{
    AuthReply, ConnectRequest, Connector, ForwardInbox, ForwardedChannel, KbdIntReply, MethodSet,
    Transport,
};
use crate::config::Preferences;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client handler for russh callbacks
///
/// - records the server host key; verification happens in the auth layer
///   so the user can be asked about unknown or changed keys
/// - routes forwarded-tcpip channels to the forward inbox
pub struct ClientHandler {
    server_key: Arc<Mutex<Option<PublicKey>>>,
    forwards: mpsc::UnboundedSender<ForwardedChannel>,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!("Server host key: {}", KnownHostsStore::fingerprint(server_public_key));
        *self.server_key.lock() = Some(server_public_key.clone());
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        info!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let forwarded = ForwardedChannel {
            link: ChannelLink::spawn(channel),
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        };

        if self.forwards.send(forwarded).is_err() {
            warn!("No tunnel is accepting forwarded channels, dropping it");
        }
        Ok(())
    }
}

/// Pick the entries of `available` named in the comma separated `wanted`, in
/// the order they are listed. `None` when nothing matched.
fn pick_names<T: Clone>(available: &[T], wanted: &str, name: impl Fn(&T) -> &str) -> Option<Vec<T>> {
    let picked: Vec<T> = wanted
        .split(',')
        .map(str::trim)
        .filter_map(|w| available.iter().find(|a| name(a) == w).cloned())
        .collect();
    (!picked.is_empty()).then_some(picked)
}

/// Algorithm preferences from the session's overrides
pub fn build_preferred(request: &ConnectRequest) -> Preferred {
    let mut preferred = Preferred::default();

    if let Some(list) = &request.kex {
        match pick_names(&preferred.kex, list, |n| n.as_ref()) {
            Some(mut kex) => {
                // Protocol extension markers are not real algorithms
                kex.extend(preferred.kex.iter().filter(|n| {
                    let n: &str = n.as_ref();
                    n.starts_with("ext-info-") || n.starts_with("kex-strict-")
                }).cloned());
                preferred.kex = Cow::Owned(kex);
            }
            None => warn!("No supported key exchange in {:?}, keeping defaults", list),
        }
    }

    if let Some(list) = &request.ciphers {
        match pick_names(&preferred.cipher, list, |n| n.as_ref()) {
            Some(ciphers) => preferred.cipher = Cow::Owned(ciphers),
            None => warn!("No supported cipher in {:?}, keeping defaults", list),
        }
    }

    if let Some(list) = &request.hostkeys {
        match pick_names(&preferred.key, list, |a| a.as_str()) {
            Some(keys) => preferred.key = Cow::Owned(keys),
            None => warn!("No supported host key type in {:?}, keeping defaults", list),
        }
    }

    if request.compression {
        let mut compression = preferred.compression.to_vec();
        compression.sort_by_key(|n| {
            let n: &str = n.as_ref();
            n == "none"
        });
        preferred.compression = Cow::Owned(compression);
    }

    preferred
}

/// Enable TCP keepalive and, where the OS supports it, probe and timeout tuning.
fn apply_keepalive(stream: &TcpStream, prefs: &Preferences) -> std::io::Result<()> {
    stream.set_nodelay(true)?;

    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(prefs.keepidle())
        .with_interval(prefs.keepintvl());
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd"))]
    let keepalive = keepalive.with_retries(prefs.ssh_tcp_keepcnt);
    socket.set_tcp_keepalive(&keepalive)?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    socket.set_tcp_user_timeout(Some(prefs.user_timeout()))?;

    Ok(())
}

/// Opens russh transports
#[derive(Debug, Default, Clone)]
pub struct RusshConnector;

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>, SshError> {
        let target = format_server(&request.host, request.port);
        info!("Connecting to SSH server at {}", target);

        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            preferred: build_preferred(request),
            ..Default::default()
        });

        let server_key = Arc::new(Mutex::new(None));
        let (forwards, inbox) = mpsc::unbounded_channel();
        let handler = ClientHandler {
            server_key: server_key.clone(),
            forwards,
        };

        let handshake = async {
            match &request.proxy_command {
                Some(template) => {
                    let command =
                        expand_proxy_command(template, &request.host, request.port, &request.user);
                    let stream = ProxyCommandStream::spawn(&command)?;
                    client::connect_stream(config, stream, handler).await
                }
                None => {
                    let stream = TcpStream::connect((request.host.as_str(), request.port))
                        .await
                        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;
                    if let Err(e) = apply_keepalive(&stream, &request.preferences) {
                        warn!("Failed to tune TCP keepalive for {}: {}", target, e);
                    }
                    client::connect_stream(config, stream, handler).await
                }
            }
        };

        let handle = tokio::time::timeout(CONNECT_TIMEOUT, handshake)
            .await
            .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", target)))?
            .map_err(|e| match e {
                SshError::ProtocolError(msg) => SshError::ConnectionFailed(msg),
                other => other,
            })?;

        debug!("SSH handshake with {} completed", target);

        Ok(Box::new(RusshTransport {
            handle,
            host: request.host.clone(),
            port: request.port,
            known_hosts: KnownHostsStore::open(&request.known_hosts_path),
            server_key,
            methods: MethodSet::empty(),
            forward_inbox: Some(inbox),
        }))
    }
}

/// [`Transport`] over a russh client handle
pub struct RusshTransport {
    handle: Handle<ClientHandler>,
    host: String,
    port: u16,
    known_hosts: KnownHostsStore,
    server_key: Arc<Mutex<Option<PublicKey>>>,
    methods: MethodSet,
    forward_inbox: Option<ForwardInbox>,
}

impl RusshTransport {
    fn server_key(&self) -> Result<PublicKey, SshError> {
        self.server_key
            .lock()
            .clone()
            .ok_or_else(|| SshError::ProtocolError("server host key not received".into()))
    }

    fn record_methods(&mut self, remaining: &russh::MethodSet) {
        self.methods = MethodSet::from_names(remaining.iter().map(|m| {
            let name: &str = m.into();
            name
        }));
        debug!("Server accepts {:?}", self.methods);
    }

    fn map_auth(&mut self, result: AuthResult) -> AuthReply {
        match result {
            AuthResult::Success => AuthReply::Success,
            AuthResult::Failure {
                remaining_methods,
                partial_success,
            } => {
                self.record_methods(&remaining_methods);
                if partial_success {
                    AuthReply::Partial
                } else {
                    AuthReply::Denied("Access denied".into())
                }
            }
        }
    }

    fn map_kbdint(&mut self, response: KeyboardInteractiveAuthResponse) -> KbdIntReply {
        match response {
            KeyboardInteractiveAuthResponse::Success => KbdIntReply::Done(AuthReply::Success),
            KeyboardInteractiveAuthResponse::Failure {
                remaining_methods,
                partial_success,
            } => KbdIntReply::Done(self.map_auth(AuthResult::Failure {
                remaining_methods,
                partial_success,
            })),
            KeyboardInteractiveAuthResponse::InfoRequest {
                name,
                instructions,
                prompts,
            } => KbdIntReply::InfoRequest {
                name,
                instructions,
                prompts: prompts
                    .into_iter()
                    .map(|p| KbiPrompt {
                        prompt: p.prompt,
                        echo: p.echo,
                    })
                    .collect(),
            },
        }
    }

    async fn rsa_hash(&self) -> Option<russh::keys::HashAlg> {
        self.handle.best_supported_rsa_hash().await.ok().flatten().flatten()
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn verify_host_key(&mut self) -> Result<HostKeyVerification, SshError> {
        let key = self.server_key()?;
        Ok(self.known_hosts.verify(&self.host, self.port, &key))
    }

    async fn trust_host_key(&mut self) -> Result<(), SshError> {
        let key = self.server_key()?;
        self.known_hosts.add_host(&self.host, self.port, &key)
    }

    async fn methods(&mut self) -> MethodSet {
        self.methods
    }

    async fn auth_none(&mut self, user: &str) -> Result<AuthReply, SshError> {
        let result = self.handle.authenticate_none(user).await?;
        Ok(self.map_auth(result))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<AuthReply, SshError> {
        let result = self.handle.authenticate_password(user, password).await?;
        Ok(self.map_auth(result))
    }

    async fn auth_publickey(&mut self, user: &str, key: PrivateKey) -> Result<AuthReply, SshError> {
        let hash = self.rsa_hash().await;
        let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash);
        let result = self.handle.authenticate_publickey(user, key).await?;
        Ok(self.map_auth(result))
    }

    async fn auth_certificate(
        &mut self,
        user: &str,
        key: PrivateKey,
        cert: Certificate,
    ) -> Result<AuthReply, SshError> {
        let result = self
            .handle
            .authenticate_openssh_cert(user, Arc::new(key), cert)
            .await?;
        Ok(self.map_auth(result))
    }

    async fn auth_agent(&mut self, user: &str) -> Result<AuthReply, SshError> {
        if !is_agent_available() {
            return Err(SshError::AgentNotAvailable("no agent endpoint".into()));
        }
        let result = offer_agent_identities(&mut self.handle, user).await?;
        Ok(self.map_auth(result))
    }

    async fn kbdint_start(&mut self, user: &str) -> Result<KbdIntReply, SshError> {
        let response = self
            .handle
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await?;
        Ok(self.map_kbdint(response))
    }

    async fn kbdint_respond(&mut self, responses: Vec<String>) -> Result<KbdIntReply, SshError> {
        let response = self
            .handle
            .authenticate_keyboard_interactive_respond(responses)
            .await?;
        Ok(self.map_kbdint(response))
    }

    async fn open_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        originator: &str,
        originator_port: u16,
    ) -> Result<ChannelLink, SshError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, originator, originator_port as u32)
            .await
            .map_err(|e| {
                SshError::ChannelError(format!(
                    "Failed to open direct-tcpip channel to {}: {}",
                    format_server(host, port),
                    e
                ))
            })?;
        Ok(ChannelLink::spawn(channel))
    }

    async fn request_forward(&mut self, address: &str, port: u16) -> Result<u16, SshError> {
        let bound = self.handle.tcpip_forward(address, port as u32).await?;
        Ok(if port == 0 { bound as u16 } else { port })
    }

    async fn cancel_forward(&mut self, address: &str, port: u16) -> Result<(), SshError> {
        self.handle.cancel_tcpip_forward(address, port as u32).await?;
        Ok(())
    }

    fn take_forward_inbox(&mut self) -> Option<ForwardInbox> {
        self.forward_inbox.take()
    }

    async fn open_session_channel(&mut self) -> Result<Channel<Msg>, SshError> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to open session channel: {}", e)))
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Disconnect from {} failed: {}", format_server(&self.host, self.port), e);
        }
    }
}
