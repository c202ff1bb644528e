//! Scripted transport and prompt shared by the integration tests

#![allow(dead_code)]

pub mod keys;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::keys::{Certificate, PrivateKey};
use tokio::sync::mpsc;

use ssh_tunnel_core::config::{ConnectionParams, ParamStore, Preferences};
use ssh_tunnel_core::ssh::{
    AuthPrompt, AuthReply, ChannelLink, ChannelPeer, ConnectRequest, Connector, CredentialRequest,
    ForwardInbox, ForwardedChannel, HostKeyVerification, KbdIntReply, KbiPrompt, MethodSet,
    PromptReply, Session, SshError, Transport,
};

/// Server behaviour, shared between the test and every transport it opens
pub struct ServerState {
    pub host_key: HostKeyVerification,
    /// Answers to host key checks, used before falling back to `host_key`
    pub host_key_script: VecDeque<HostKeyVerification>,
    pub methods: MethodSet,
    /// Methods offered after a partial success
    pub methods_after_partial: MethodSet,
    /// Replies to password attempts; `Denied` once empty
    pub password_replies: VecDeque<AuthReply>,
    /// Replies to public key attempts; `Denied` once empty
    pub publickey_replies: VecDeque<AuthReply>,
    /// Replies to certificate attempts; `Denied` once empty
    pub certificate_replies: VecDeque<AuthReply>,
    /// Replies to agent attempts; `Denied` once empty
    pub agent_replies: VecDeque<AuthReply>,
    /// Code the keyboard-interactive round accepts
    pub otp: Option<String>,
    /// Every call that carried a credential, e.g. `password:secret`
    pub auth_calls: Vec<String>,
    pub connects: usize,
    pub disconnects: usize,
    pub direct_tcpip: Vec<(String, u16)>,
    pub forwards: Vec<(String, u16)>,
    pub cancelled_forwards: Vec<(String, u16)>,
    /// Remote listen ports the server refuses
    pub refused_ports: Vec<u16>,
    /// Remote listen requests never complete
    pub stall_forwards: bool,
    /// Ordered record of stalled requests being dropped and of disconnects
    pub events: Vec<&'static str>,
    forward_tx: Option<mpsc::UnboundedSender<ForwardedChannel>>,
    forward_rx: Option<ForwardInbox>,
    peers: mpsc::UnboundedSender<ChannelPeer>,
    next_channel: u32,
}

pub type SharedState = Arc<Mutex<ServerState>>;

pub struct MockServer {
    pub state: SharedState,
    /// Remote ends of opened direct-tcpip channels
    pub peers: mpsc::UnboundedReceiver<ChannelPeer>,
}

impl MockServer {
    pub fn new(methods: MethodSet) -> Self {
        let (peers_tx, peers) = mpsc::unbounded_channel();
        let state = ServerState {
            host_key: HostKeyVerification::Verified,
            host_key_script: VecDeque::new(),
            methods,
            methods_after_partial: MethodSet::empty(),
            password_replies: VecDeque::new(),
            publickey_replies: VecDeque::new(),
            certificate_replies: VecDeque::new(),
            agent_replies: VecDeque::new(),
            otp: None,
            auth_calls: Vec::new(),
            connects: 0,
            disconnects: 0,
            direct_tcpip: Vec::new(),
            forwards: Vec::new(),
            cancelled_forwards: Vec::new(),
            refused_ports: Vec::new(),
            stall_forwards: false,
            events: Vec::new(),
            forward_tx: None,
            forward_rx: None,
            peers: peers_tx,
            next_channel: 1,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            peers,
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            state: self.state.clone(),
        })
    }

    pub fn auth_calls(&self) -> Vec<String> {
        self.state.lock().auth_calls.clone()
    }

    /// Deliver a channel the server opened for a remote listen.
    pub fn push_forwarded(&self, id: u32, port: u32) -> Option<ChannelPeer> {
        let tx = self.state.lock().forward_tx.clone()?;
        let (link, peer) = ChannelLink::loopback(id);
        tx.send(ForwardedChannel {
            link,
            connected_address: String::new(),
            connected_port: port,
            originator_address: "203.0.113.7".into(),
            originator_port: 50022,
        })
        .ok()?;
        Some(peer)
    }
}

struct MockConnector {
    state: SharedState,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _request: &ConnectRequest) -> Result<Box<dyn Transport>, SshError> {
        let mut state = self.state.lock();
        state.connects += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.forward_tx = Some(tx);
        state.forward_rx = Some(rx);
        Ok(Box::new(MockTransport {
            state: self.state.clone(),
        }))
    }
}

struct MockTransport {
    state: SharedState,
}

/// Records that a stalled request was dropped
struct StallGuard(SharedState);

impl Drop for StallGuard {
    fn drop(&mut self) {
        self.0.lock().events.push("stalled request dropped");
    }
}

impl MockTransport {
    /// Record `call` and pop the next scripted reply.
    fn scripted(&self, call: &str, pick: fn(&mut ServerState) -> &mut VecDeque<AuthReply>) -> AuthReply {
        let reply = {
            let mut state = self.state.lock();
            state.auth_calls.push(call.to_string());
            pick(&mut *state)
                .pop_front()
                .unwrap_or_else(|| AuthReply::Denied(call.to_string()))
        };
        self.reply(reply)
    }

    fn reply(&self, reply: AuthReply) -> AuthReply {
        if reply == AuthReply::Partial {
            let mut state = self.state.lock();
            state.methods = state.methods_after_partial;
        }
        reply
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn verify_host_key(&mut self) -> Result<HostKeyVerification, SshError> {
        let mut state = self.state.lock();
        Ok(match state.host_key_script.pop_front() {
            Some(scripted) => scripted,
            None => state.host_key.clone(),
        })
    }

    async fn trust_host_key(&mut self) -> Result<(), SshError> {
        self.state.lock().host_key = HostKeyVerification::Verified;
        Ok(())
    }

    async fn methods(&mut self) -> MethodSet {
        self.state.lock().methods
    }

    async fn auth_none(&mut self, _user: &str) -> Result<AuthReply, SshError> {
        Ok(AuthReply::Denied("none".into()))
    }

    async fn auth_password(&mut self, _user: &str, password: &str) -> Result<AuthReply, SshError> {
        let reply = {
            let mut state = self.state.lock();
            state.auth_calls.push(format!("password:{}", password));
            state
                .password_replies
                .pop_front()
                .unwrap_or_else(|| AuthReply::Denied("password".into()))
        };
        Ok(self.reply(reply))
    }

    async fn auth_publickey(&mut self, _user: &str, _key: PrivateKey) -> Result<AuthReply, SshError> {
        Ok(self.scripted("publickey", |s| &mut s.publickey_replies))
    }

    async fn auth_certificate(
        &mut self,
        _user: &str,
        _key: PrivateKey,
        _cert: Certificate,
    ) -> Result<AuthReply, SshError> {
        Ok(self.scripted("certificate", |s| &mut s.certificate_replies))
    }

    async fn auth_agent(&mut self, _user: &str) -> Result<AuthReply, SshError> {
        Ok(self.scripted("agent", |s| &mut s.agent_replies))
    }

    async fn kbdint_start(&mut self, _user: &str) -> Result<KbdIntReply, SshError> {
        self.state.lock().auth_calls.push("kbdint".into());
        Ok(KbdIntReply::InfoRequest {
            name: String::new(),
            instructions: String::new(),
            prompts: vec![KbiPrompt {
                prompt: "Verification code: ".into(),
                echo: false,
            }],
        })
    }

    async fn kbdint_respond(&mut self, responses: Vec<String>) -> Result<KbdIntReply, SshError> {
        let mut state = self.state.lock();
        state.auth_calls.push(format!("kbdint:{}", responses.join(",")));
        let accepted = state.otp.is_some() && responses.first() == state.otp.as_ref();
        Ok(KbdIntReply::Done(if accepted {
            AuthReply::Success
        } else {
            AuthReply::Denied("keyboard-interactive".into())
        }))
    }

    async fn open_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        _originator: &str,
        _originator_port: u16,
    ) -> Result<ChannelLink, SshError> {
        let mut state = self.state.lock();
        state.direct_tcpip.push((host.to_string(), port));
        let id = state.next_channel;
        state.next_channel += 1;
        let (link, peer) = ChannelLink::loopback(id);
        state
            .peers
            .send(peer)
            .map_err(|_| SshError::ChannelError("test dropped the peer receiver".into()))?;
        Ok(link)
    }

    async fn request_forward(&mut self, address: &str, port: u16) -> Result<u16, SshError> {
        let stall = {
            let mut state = self.state.lock();
            state.forwards.push((address.to_string(), port));
            if state.refused_ports.contains(&port) {
                return Err(SshError::ProtocolError(format!("port {} refused", port)));
            }
            state.stall_forwards
        };
        if stall {
            let _guard = StallGuard(self.state.clone());
            std::future::pending::<()>().await;
        }
        Ok(if port == 0 { 40022 } else { port })
    }

    async fn cancel_forward(&mut self, address: &str, port: u16) -> Result<(), SshError> {
        self.state
            .lock()
            .cancelled_forwards
            .push((address.to_string(), port));
        Ok(())
    }

    fn take_forward_inbox(&mut self) -> Option<ForwardInbox> {
        self.state.lock().forward_rx.take()
    }

    async fn disconnect(&mut self) {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.events.push("disconnect");
    }
}

/// Prompt answering from a script and recording every request
pub struct ScriptedPrompt {
    pub trust_host_key: bool,
    pub host_key_questions: Mutex<Vec<String>>,
    pub replies: Mutex<VecDeque<PromptReply>>,
    pub requests: Mutex<Vec<CredentialRequest>>,
}

impl ScriptedPrompt {
    pub fn new(replies: impl IntoIterator<Item = PromptReply>) -> Self {
        Self {
            trust_host_key: true,
            host_key_questions: Mutex::new(Vec::new()),
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Trusts host keys, cancels every credential request.
    pub fn silent() -> Self {
        Self::new(Vec::new())
    }

    pub fn declining_host_key() -> Self {
        Self {
            trust_host_key: false,
            ..Self::silent()
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl AuthPrompt for ScriptedPrompt {
    async fn confirm_host_key(&self, message: &str, _verification: &HostKeyVerification) -> bool {
        self.host_key_questions.lock().push(message.to_string());
        self.trust_host_key
    }

    async fn request_credential(&self, request: &CredentialRequest) -> PromptReply {
        self.requests.lock().push(request.clone());
        self.replies.lock().pop_front().unwrap_or(PromptReply::Cancel)
    }
}

pub fn secret(value: &str) -> PromptReply {
    PromptReply::Ok {
        username: None,
        secret: value.to_string(),
        remember: false,
    }
}

pub fn preferences() -> Preferences {
    Preferences {
        ssh_parseconfig: false,
        ..Default::default()
    }
}

/// A connected tunnel session against `server`.
pub async fn tunnel_session(server: &MockServer, params: &ParamStore) -> Session {
    let mut session = Session::from_params(params, true)
        .with_connector(server.connector())
        .with_preferences(preferences());
    session
        .connect()
        .await
        .expect("mock connect never fails");
    session
}

/// A connected direct session reaching `server` through a local tunnel entrance.
pub async fn direct_session(server: &MockServer, params: &ParamStore) -> Session {
    let mut session = Session::from_params(params, false)
        .with_connector(server.connector())
        .with_preferences(preferences());
    session.set_tunnel_entrance("127.0.0.1", 40000);
    session
        .connect()
        .await
        .expect("mock connect never fails");
    session
}

pub fn saved(params: &ParamStore, key: &str) -> Option<String> {
    params.get_string(key)
}
