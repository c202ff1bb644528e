//! Tunnel Multiplexer
//!
//! A [`Tunnel`] owns an authenticated [`Session`] and one worker task that
//! carries any number of (SSH channel, local socket) pairs:
//!
//! - **local**: `127.0.0.1:<local_port>` → direct-tcpip to `dest:port`
//! - **X11**: remote listen on `6000 + n`, each forwarded channel connected to
//!   the local X server socket
//! - **reverse**: one remote listen, its first forwarded channel connected to
//!   `127.0.0.1:<local_port>`
//!
//! The worker stops when no pair is left, when `free()` is called or when the
//! wait step fails. Owners learn about progress through [`TunnelCallbacks`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::local_socket::LocalSocket;
use super::pump::{pump_once, SCRATCH_LEN};
use super::registry::ChannelRegistry;
use super::x11::{
    local_socket_path_in, PollGate, REMOTE_DISPLAY_FIRST, REMOTE_DISPLAY_LAST, X11_BASE_PORT,
    X11_UNIX_DIR,
};
use crate::ssh::{ChannelLink, ForwardInbox, ForwardedChannel, Session, SshError};

/// Wait for the first forwarded channel
const FIRST_ACCEPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Minimum spacing of polls for further X11 connections
const X11_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long `free()` waits for the worker before aborting it
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    Local,
    X11,
    Reverse,
}

/// Snapshot handed to callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub id: String,
    pub kind: TunnelKind,
    /// X11 display number allocated on the server
    pub remote_display: Option<u16>,
    /// Destination port (local) or remote listen port (X11, reverse)
    pub port: u16,
}

/// Returning `false` aborts the tunnel
pub type InitCallback = Box<dyn Fn(&TunnelInfo) -> bool + Send + Sync>;
pub type TunnelCallback = Box<dyn Fn(&TunnelInfo) + Send + Sync>;

#[derive(Default)]
pub struct TunnelCallbacks {
    /// Remote listen is in place (X11, reverse)
    pub init: Option<InitCallback>,
    /// First forwarded channel arrived (X11, reverse)
    pub connect: Option<TunnelCallback>,
    /// Worker is about to stop
    pub disconnect: Option<TunnelCallback>,
    /// Worker has stopped
    pub destroy: Option<TunnelCallback>,
}

struct Shared {
    id: String,
    session: Session,
    callbacks: TunnelCallbacks,
    kind: parking_lot::Mutex<Option<TunnelKind>>,
    running: AtomicBool,
    freed: AtomicBool,
    finished: AtomicBool,
    stop: CancellationToken,
    accept_cancel: CancellationToken,
    remote_display: AtomicU16,
    port: AtomicU16,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn info(&self) -> TunnelInfo {
        let display = self.remote_display.load(Ordering::SeqCst);
        TunnelInfo {
            id: self.id.clone(),
            kind: (*self.kind.lock()).unwrap_or(TunnelKind::Local),
            remote_display: (display > 0).then_some(display),
            port: self.port.load(Ordering::SeqCst),
        }
    }

    fn fire(&self, callback: &Option<TunnelCallback>) {
        if self.freed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(cb) = callback {
            cb(&self.info());
        }
    }

    fn init(&self) -> bool {
        match &self.callbacks.init {
            Some(cb) => cb(&self.info()),
            None => true,
        }
    }

    async fn open_direct(&self, dest: &str, port: u16) -> Option<ChannelLink> {
        let opened = match self.session.transport().await {
            Ok(mut t) => t.open_direct_tcpip(dest, port, "127.0.0.1", 0).await,
            Err(e) => Err(e),
        };
        match opened {
            Ok(link) => Some(link),
            Err(e) => {
                self.session
                    .set_error(format!("Could not connect to SSH tunnel. {}", e));
                None
            }
        }
    }

    async fn take_inbox(&self) -> Option<ForwardInbox> {
        let inbox = match self.session.transport().await {
            Ok(mut t) => t.take_forward_inbox(),
            Err(_) => None,
        };
        if inbox.is_none() {
            self.session
                .set_error("Could not request port forwarding. Forwarded channels unavailable");
        }
        inbox
    }

    /// First forwarded channel, within [`FIRST_ACCEPT_TIMEOUT`]
    async fn accept_first(&self, inbox: &mut ForwardInbox) -> Option<ForwardedChannel> {
        let accepted = tokio::select! {
            r = tokio::time::timeout(FIRST_ACCEPT_TIMEOUT, inbox.recv()) => r.ok().flatten(),
            _ = self.stop.cancelled() => return None,
        };
        if accepted.is_none() {
            self.session.set_error("The server did not respond.");
        }
        accepted
    }
}

/// Where new pairs come from while pumping
enum Source {
    Listener {
        listener: Option<TcpListener>,
        dest: String,
        port: u16,
    },
    X11 {
        inbox: Option<ForwardInbox>,
        socket: PathBuf,
        gate: PollGate,
    },
    Reverse {
        local_port: u16,
    },
}

pub struct Tunnel {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    bind_localhost: bool,
    x11_socket_dir: PathBuf,
}

impl Tunnel {
    /// Wrap an authenticated session.
    pub fn new(session: Session, callbacks: TunnelCallbacks) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4().to_string(),
                session,
                callbacks,
                kind: parking_lot::Mutex::new(None),
                running: AtomicBool::new(false),
                freed: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                stop: CancellationToken::new(),
                accept_cancel: CancellationToken::new(),
                remote_display: AtomicU16::new(0),
                port: AtomicU16::new(0),
            }),
            worker: None,
            bind_localhost: false,
            x11_socket_dir: PathBuf::from(X11_UNIX_DIR),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn session(&self) -> &Session {
        &self.shared.session
    }

    /// Last recorded error
    pub fn error(&self) -> Option<String> {
        self.shared.session.error()
    }

    pub fn kind(&self) -> Option<TunnelKind> {
        *self.shared.kind.lock()
    }

    pub fn remote_display(&self) -> Option<u16> {
        self.shared.info().remote_display
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    fn start(&mut self, kind: TunnelKind, source: Source) -> Result<(), SshError> {
        if self.worker.is_some() {
            return Err(SshError::Internal("tunnel already opened".into()));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            let msg = format!("Could not start tunnel worker. {}", e);
            self.shared.session.set_error(msg.clone());
            SshError::Internal(msg)
        })?;

        *self.shared.kind.lock() = Some(kind);
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let bind_localhost = self.bind_localhost;
        self.worker = Some(runtime.spawn(run_worker(shared, source, bind_localhost)));
        info!("Tunnel {} started ({:?})", self.shared.id, kind);
        Ok(())
    }

    /// Forward `127.0.0.1:<local_port>` to `host:port`; returns the bound local port.
    pub fn open_local(&mut self, host: &str, port: u16, local_port: u16) -> Result<u16, SshError> {
        let session = &self.shared.session;
        if port == 0 {
            session.set_error("Assign a destination port.");
            return Err(SshError::ConfigError("Assign a destination port.".into()));
        }

        let listener = bind_local(local_port).map_err(|msg| {
            session.set_error(msg);
            SshError::ConnectionFailed(msg.into())
        })?;
        let bound = listener.local_addr().map(|a| a.port()).unwrap_or(local_port);

        self.shared.port.store(port, Ordering::SeqCst);
        self.start(
            TunnelKind::Local,
            Source::Listener {
                listener: Some(listener),
                dest: host.to_string(),
                port,
            },
        )?;
        info!("Local forward 127.0.0.1:{} -> {}:{}", bound, host, port);
        Ok(bound)
    }

    /// Look for local X server sockets in `dir` instead of `/tmp/.X11-unix`.
    pub fn set_x11_socket_dir(&mut self, dir: impl Into<PathBuf>) {
        self.x11_socket_dir = dir.into();
    }

    /// Forward X11 connections from the server to `local_display`.
    pub fn open_x11(&mut self, local_display: &str, bind_localhost: bool) -> Result<(), SshError> {
        let Some(socket) = local_socket_path_in(&self.x11_socket_dir, local_display) else {
            let msg = format!("Invalid X display {:?}", local_display);
            self.shared.session.set_error(msg.clone());
            return Err(SshError::ConfigError(msg));
        };
        self.bind_localhost = bind_localhost;
        self.start(
            TunnelKind::X11,
            Source::X11 {
                inbox: None,
                socket,
                gate: PollGate::new(X11_POLL_INTERVAL),
            },
        )
    }

    /// Listen on the server's `port` and connect the first forwarded channel
    /// to `127.0.0.1:<local_port>`.
    pub fn open_reverse(&mut self, port: u16, local_port: u16) -> Result<(), SshError> {
        self.shared.port.store(port, Ordering::SeqCst);
        self.start(TunnelKind::Reverse, Source::Reverse { local_port })
    }

    /// Close the local listener; a parked accept returns at once.
    pub fn cancel_accept(&self) {
        self.shared.accept_cancel.cancel();
    }

    /// True before the tunnel is opened and once its worker has stopped.
    pub fn is_terminated(&self) -> bool {
        self.worker.is_none() || self.shared.finished.load(Ordering::SeqCst)
    }

    /// Stop the worker, release the X11 listen and close the session.
    ///
    /// Disconnect and destroy callbacks do not run after this.
    pub async fn free(mut self) {
        self.shared.freed.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.stop.cancel();
        self.shared.accept_cancel.cancel();

        if let Some(mut worker) = self.worker.take() {
            let joined = match tokio::time::timeout(JOIN_TIMEOUT, &mut worker).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Tunnel {} worker did not stop, aborting", self.shared.id);
                    worker.abort();
                    worker.await
                }
            };
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    error!("Tunnel worker failed: {}", e);
                }
            }
        }

        if self.kind() == Some(TunnelKind::X11) {
            if let Some(display) = self.remote_display() {
                let address = forward_address(self.bind_localhost);
                let cancelled = match self.shared.session.transport().await {
                    Ok(mut t) => t.cancel_forward(address, X11_BASE_PORT + display).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = cancelled {
                    debug!("Could not cancel X11 forward: {}", e);
                }
            }
        }

        self.shared.session.disconnect().await;
        info!("Tunnel {} freed", self.shared.id);
    }
}

fn forward_address(bind_localhost: bool) -> &'static str {
    if bind_localhost {
        "localhost"
    } else {
        ""
    }
}

fn bind_local(port: u16) -> Result<TcpListener, &'static str> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|_| "Could not create socket.")?;
    socket
        .set_reuse_address(true)
        .map_err(|_| "Could not create socket.")?;

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    socket
        .bind(&addr.into())
        .map_err(|_| "Could not bind server socket to local port.")?;
    socket
        .listen(1)
        .map_err(|_| "Could not listen to local port.")?;
    socket
        .set_nonblocking(true)
        .map_err(|_| "Could not listen to local port.")?;

    TcpListener::from_std(socket.into()).map_err(|_| "Could not listen to local port.")
}

async fn connect_x11(shared: &Shared, path: &Path, registry: &mut ChannelRegistry<LocalSocket>, fc: ForwardedChannel) {
    match connect_display(path).await {
        Ok(socket) => {
            debug!(
                "X11 connection from {}:{} -> {:?}",
                fc.originator_address, fc.originator_port, path
            );
            registry.add(fc.link, socket);
        }
        Err(e) => {
            shared
                .session
                .set_error(format!("Could not connect to X display {:?}. {}", path, e));
            fc.link.close();
        }
    }
}

#[cfg(unix)]
async fn connect_display(path: &std::path::Path) -> std::io::Result<LocalSocket> {
    LocalSocket::connect_unix(path).await
}

#[cfg(not(unix))]
async fn connect_display(_path: &std::path::Path) -> std::io::Result<LocalSocket> {
    Err(std::io::ErrorKind::Unsupported.into())
}

/// Set up the first pair (or the remote listen) for the tunnel kind.
async fn establish(
    shared: &Shared,
    source: &mut Source,
    registry: &mut ChannelRegistry<LocalSocket>,
    bind_localhost: bool,
) -> bool {
    match (shared.info().kind, source) {
        (TunnelKind::Local, Source::Listener { listener, dest, port }) => {
            let Some(l) = listener.as_ref() else {
                return false;
            };
            let accepted = tokio::select! {
                r = l.accept() => r,
                _ = shared.accept_cancel.cancelled() => return false,
                _ = shared.stop.cancelled() => return false,
            };
            let stream = match accepted {
                Ok((stream, peer)) => {
                    debug!("Tunnel {} accepted {}", shared.id, peer);
                    stream
                }
                Err(e) => {
                    shared
                        .session
                        .set_error(format!("Local socket not accepted. {}", e));
                    return false;
                }
            };
            let _ = stream.set_nodelay(true);
            match shared.open_direct(dest, *port).await {
                Some(link) => {
                    registry.add(link, LocalSocket::from(stream));
                    true
                }
                None => false,
            }
        }

        (TunnelKind::X11, Source::X11 { inbox, socket, .. }) => {
            let Some(taken) = shared.take_inbox().await else {
                return false;
            };
            let inbox = inbox.insert(taken);

            let address = forward_address(bind_localhost);
            let mut last_error = None;
            for n in REMOTE_DISPLAY_FIRST..=REMOTE_DISPLAY_LAST {
                let requested = match shared.session.transport().await {
                    Ok(mut t) => t.request_forward(address, X11_BASE_PORT + n).await,
                    Err(e) => Err(e),
                };
                match requested {
                    Ok(_) => {
                        shared.remote_display.store(n, Ordering::SeqCst);
                        shared.port.store(X11_BASE_PORT + n, Ordering::SeqCst);
                        info!("X11 forwarding on remote display {}", n);
                        break;
                    }
                    Err(e) => last_error = Some(e),
                }
            }
            if shared.remote_display.load(Ordering::SeqCst) == 0 {
                shared.session.set_error(format!(
                    "Could not request port forwarding. {}",
                    last_error.map(|e| e.to_string()).unwrap_or_default()
                ));
                return false;
            }

            if !shared.init() {
                return false;
            }
            let Some(first) = shared.accept_first(inbox).await else {
                return false;
            };
            shared.fire(&shared.callbacks.connect);
            connect_x11(shared, socket, registry, first).await;
            true
        }

        (TunnelKind::Reverse, Source::Reverse { local_port }) => {
            let Some(mut inbox) = shared.take_inbox().await else {
                return false;
            };
            let remote_port = shared.port.load(Ordering::SeqCst);
            let requested = match shared.session.transport().await {
                Ok(mut t) => t.request_forward("", remote_port).await,
                Err(e) => Err(e),
            };
            let bound = match requested {
                Ok(bound) => bound,
                Err(e) => {
                    shared
                        .session
                        .set_error(format!("Could not request port forwarding. {}", e));
                    return false;
                }
            };
            shared.port.store(bound, Ordering::SeqCst);

            if !shared.init() {
                return false;
            }
            let Some(first) = shared.accept_first(&mut inbox).await else {
                return false;
            };
            shared.fire(&shared.callbacks.connect);

            // One connection is all a reverse tunnel carries
            let cancelled = match shared.session.transport().await {
                Ok(mut t) => t.cancel_forward("", bound).await,
                Err(e) => Err(e),
            };
            if let Err(e) = cancelled {
                debug!("Could not cancel reverse forward: {}", e);
            }

            let addr = SocketAddr::from(([127, 0, 0, 1], *local_port));
            match LocalSocket::connect_tcp(addr).await {
                Ok(socket) => {
                    registry.add(first.link, socket);
                    true
                }
                Err(e) => {
                    debug!("Reverse tunnel local connect failed: {}", e);
                    shared
                        .session
                        .set_error(format!("Cannot connect to local port {}.", local_port));
                    first.link.close();
                    false
                }
            }
        }

        _ => {
            shared
                .session
                .set_error("Tunnel kind does not match its source");
            false
        }
    }
}

/// Pump until no pair is left, the tunnel stops or the wait fails.
async fn pump_pairs(
    shared: &Shared,
    source: &mut Source,
    registry: &mut ChannelRegistry<LocalSocket>,
    scratch: &mut [u8],
) {
    while shared.is_running() {
        if let Source::X11 {
            inbox: Some(inbox),
            socket,
            gate,
        } = source
        {
            if gate.ready() {
                while let Ok(fc) = inbox.try_recv() {
                    connect_x11(shared, socket, registry, fc).await;
                }
            }
        }

        if registry.is_empty() {
            debug!("Tunnel {}: no pairs left", shared.id);
            break;
        }

        let pumped = tokio::select! {
            r = pump_once(registry, scratch, &shared.session) => r,
            _ = shared.stop.cancelled() => break,
        };
        if let Err(e) = pumped {
            shared
                .session
                .set_error(format!("Could not wait on tunnel sockets. {}", e));
            break;
        }
        if !shared.is_running() {
            break;
        }

        // Clients may open more connections during the session
        if let Source::Listener {
            listener,
            dest,
            port,
        } = source
        {
            if shared.accept_cancel.is_cancelled() {
                *listener = None;
            }
            let accepted = listener.as_ref().and_then(|l| l.accept().now_or_never());
            if let Some(Ok((stream, peer))) = accepted {
                debug!("Tunnel {} accepted {}", shared.id, peer);
                let _ = stream.set_nodelay(true);
                match shared.open_direct(dest, *port).await {
                    Some(link) => registry.add(link, LocalSocket::from(stream)),
                    None => {
                        warn!("Could not open new SSH connection: {:?}", shared.session.error());
                        shared.running.store(false, Ordering::SeqCst);
                    }
                }
            }
        }
    }
}

async fn run_worker(shared: Arc<Shared>, mut source: Source, bind_localhost: bool) {
    let mut registry = ChannelRegistry::new();
    let mut scratch = vec![0u8; SCRATCH_LEN];

    loop {
        if !establish(&shared, &mut source, &mut registry, bind_localhost).await {
            break;
        }
        pump_pairs(&shared, &mut source, &mut registry, &mut scratch).await;
        registry.close_all();

        // A local tunnel goes back to accepting while its listener is open
        let listening = matches!(
            &source,
            Source::Listener { listener: Some(_), .. }
        ) && !shared.accept_cancel.is_cancelled();
        if !(shared.info().kind == TunnelKind::Local && listening && shared.is_running()) {
            break;
        }
        debug!("Tunnel {} waiting for the next connection", shared.id);
    }

    registry.close_all();
    shared.running.store(false, Ordering::SeqCst);
    if let Some(e) = shared.session.error() {
        debug!("Tunnel {} stopped: {}", shared.id, e);
    }
    shared.fire(&shared.callbacks.disconnect);
    shared.finished.store(true, Ordering::SeqCst);
    shared.fire(&shared.callbacks.destroy);
    info!("Tunnel {} worker exited", shared.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamStore;

    fn tunnel() -> Tunnel {
        let params = ParamStore::from_pairs([("server", "h")]);
        Tunnel::new(Session::from_params(&params, true), TunnelCallbacks::default())
    }

    #[tokio::test]
    async fn test_destination_port_required() {
        let mut t = tunnel();
        assert!(matches!(
            t.open_local("desktop", 0, 0),
            Err(SshError::ConfigError(_))
        ));
        assert_eq!(t.error().as_deref(), Some("Assign a destination port."));
        assert!(t.is_terminated());
    }

    #[test]
    fn test_open_needs_runtime() {
        let mut t = tunnel();
        assert!(t.open_reverse(5900, 5900).is_err());
        assert!(t.error().is_some_and(|e| e.starts_with("Could not start tunnel worker.")));
        assert!(t.is_terminated());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_worker_future_is_send() {
        let t = tunnel();
        let worker = run_worker(t.shared.clone(), Source::Reverse { local_port: 5900 }, false);
        assert_send(&worker);
    }

    #[tokio::test]
    async fn test_invalid_x_display_is_rejected() {
        let mut t = tunnel();
        assert!(matches!(
            t.open_x11("wayland-0", true),
            Err(SshError::ConfigError(_))
        ));
        assert!(t.error().is_some_and(|e| e.contains("wayland-0")));
        assert!(t.is_terminated());
    }

    #[tokio::test]
    async fn test_bind_local_in_use() {
        let first = bind_local(0).unwrap();
        let port = first.local_addr().unwrap().port();
        // Reuse of a listening port still fails
        assert_eq!(
            bind_local(port).err(),
            Some("Could not bind server socket to local port.")
        );
    }
}
