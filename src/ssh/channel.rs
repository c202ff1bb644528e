//! Channel Owner Task
//!
//! Each SSH channel is owned by exactly one task. The tunnel pump talks to it
//! through a [`ChannelLink`]:
//! - inbound data (main and extended streams) arrives on a bounded queue, so a
//!   slow local consumer stops the owner from draining the SSH window
//! - outbound data, EOF and close are queued as [`ChannelCommand`]s on a
//!   bounded queue too; the pump stops reading a socket while its channel's
//!   queue is full
//!
//! [`ChannelLink::loopback`] builds a link backed by a [`ChannelPeer`] instead of
//! a russh channel, for tests.

use std::future::Future;

use bytes::{Bytes, BytesMut};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};
use tracing::{debug, trace};

use super::error::SshError;

/// Inbound chunks buffered per channel
const INBOUND_DEPTH: usize = 64;

/// Outbound commands buffered per channel
pub const OUTBOUND_DEPTH: usize = 64;

/// Commands sent to the channel owner
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    Data(Bytes),
    Eof,
    Close,
}

/// Result of a non-blocking channel read
#[derive(Debug, PartialEq)]
pub enum ChannelRead {
    Data(Bytes),
    Empty,
    Eof,
}

/// Pump-side handle of a channel owner task
pub struct ChannelLink {
    id: u32,
    inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<ChannelCommand>,
    peeked: Option<Bytes>,
    eof: bool,
}

impl ChannelLink {
    /// Hand `channel` to a new owner task.
    pub fn spawn(channel: Channel<Msg>) -> Self {
        let id: u32 = channel.id().into();
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_DEPTH);
        let (outbound, cmd_rx) = mpsc::channel(OUTBOUND_DEPTH);

        tokio::spawn(run_channel_owner(channel, inbound_tx, cmd_rx));

        Self {
            id,
            inbound,
            outbound,
            peeked: None,
            eof: false,
        }
    }

    /// A link whose remote end is driven by the returned [`ChannelPeer`].
    pub fn loopback(id: u32) -> (Self, ChannelPeer) {
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_DEPTH);
        let (outbound, cmd_rx) = mpsc::channel(OUTBOUND_DEPTH);

        let link = Self {
            id,
            inbound,
            outbound,
            peeked: None,
            eof: false,
        };
        let peer = ChannelPeer {
            to_local: Some(inbound_tx),
            from_local: cmd_rx,
        };
        (link, peer)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait until data or EOF can be read without blocking. Cancel-safe.
    pub async fn readable(&mut self) {
        if self.peeked.is_some() || self.eof {
            return;
        }
        match self.inbound.recv().await {
            Some(chunk) => self.peeked = Some(chunk),
            None => self.eof = true,
        }
    }

    /// Read everything currently queued, up to `limit` bytes (at least one chunk).
    pub fn try_read(&mut self, limit: usize) -> ChannelRead {
        let mut out = BytesMut::new();

        if let Some(chunk) = self.peeked.take() {
            out.extend_from_slice(&chunk);
        }

        while out.len() < limit {
            match self.inbound.try_recv() {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.eof = true;
                    break;
                }
            }
        }

        if !out.is_empty() {
            ChannelRead::Data(out.freeze())
        } else if self.eof {
            ChannelRead::Eof
        } else {
            ChannelRead::Empty
        }
    }

    /// True while another [`write`](Self::write) fits in the outbound queue.
    pub fn can_write(&self) -> bool {
        self.outbound.capacity() > 0
    }

    /// Resolves once the outbound queue has room. Cancel-safe, and does not
    /// borrow the link, so it can be raced against [`readable`](Self::readable).
    pub fn writable(&self) -> impl Future<Output = ()> + Send + 'static {
        let outbound = self.outbound.clone();
        async move {
            // The permit is only a wake-up; dropping it returns the slot
            let _ = outbound.reserve().await;
        }
    }

    /// Queue `data` for the remote side. Check [`can_write`](Self::can_write) first.
    pub fn write(&self, data: &[u8]) -> Result<(), SshError> {
        match self.outbound.try_send(ChannelCommand::Data(Bytes::copy_from_slice(data))) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SshError::ChannelError(format!(
                "channel {} outbound queue is full",
                self.id
            ))),
            Err(TrySendError::Closed(_)) => {
                Err(SshError::ChannelError(format!("channel {} closed", self.id)))
            }
        }
    }

    pub fn send_eof(&self) {
        self.send_control(vec![ChannelCommand::Eof]);
    }

    /// Send EOF and close the channel.
    pub fn close(&self) {
        self.send_control(vec![ChannelCommand::Eof, ChannelCommand::Close]);
    }

    /// Queue control commands behind any data; a full queue hands the rest
    /// to a task that waits for room.
    fn send_control(&self, commands: Vec<ChannelCommand>) {
        let mut commands = commands.into_iter();
        while let Some(cmd) = commands.next() {
            match self.outbound.try_send(cmd) {
                Ok(()) => {}
                Err(TrySendError::Full(cmd)) => {
                    let rest: Vec<_> = std::iter::once(cmd).chain(commands).collect();
                    let outbound = self.outbound.clone();
                    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                        runtime.spawn(async move {
                            for cmd in rest {
                                if outbound.send(cmd).await.is_err() {
                                    break;
                                }
                            }
                        });
                    }
                    return;
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }
}

impl std::fmt::Debug for ChannelLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLink")
            .field("id", &self.id)
            .field("eof", &self.eof)
            .finish()
    }
}

async fn run_channel_owner(
    mut channel: Channel<Msg>,
    inbound_tx: mpsc::Sender<Bytes>,
    mut cmd_rx: mpsc::Receiver<ChannelCommand>,
) {
    let id = channel.id();
    debug!("Channel owner started for {:?}", id);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ChannelCommand::Data(data)) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        debug!("Channel {:?} write failed: {}", id, e);
                        break;
                    }
                }
                Some(ChannelCommand::Eof) => {
                    let _ = channel.eof().await;
                }
                Some(ChannelCommand::Close) | None => break,
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    trace!("Channel {:?} received {} bytes", id, data.len());
                    if inbound_tx.send(Bytes::copy_from_slice(&data)).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    let _ = channel.close().await;
    debug!("Channel owner exited for {:?}", id);
}

/// Remote end of a loopback [`ChannelLink`]
pub struct ChannelPeer {
    to_local: Option<mpsc::Sender<Bytes>>,
    from_local: mpsc::Receiver<ChannelCommand>,
}

impl ChannelPeer {
    /// Deliver `data` to the link as if the server sent it.
    pub async fn send(&self, data: &[u8]) -> Result<(), SshError> {
        match &self.to_local {
            Some(tx) => tx
                .send(Bytes::copy_from_slice(data))
                .await
                .map_err(|_| SshError::Disconnected),
            None => Err(SshError::Disconnected),
        }
    }

    /// Signal EOF to the link.
    pub fn eof(&mut self) {
        self.to_local = None;
    }

    /// Next command issued by the link, `None` once the link is dropped.
    pub async fn recv(&mut self) -> Option<ChannelCommand> {
        self.from_local.recv().await
    }

    /// Collect written data until EOF, close or drop.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(cmd) = self.from_local.recv().await {
            match cmd {
                ChannelCommand::Data(data) => out.extend_from_slice(&data),
                ChannelCommand::Eof | ChannelCommand::Close => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_read_coalesces() {
        let (mut link, peer) = ChannelLink::loopback(7);
        peer.send(b"hello ").await.unwrap();
        peer.send(b"world").await.unwrap();

        link.readable().await;
        assert_eq!(link.try_read(10240), ChannelRead::Data(Bytes::from_static(b"hello world")));
        assert_eq!(link.try_read(10240), ChannelRead::Empty);
    }

    #[tokio::test]
    async fn test_loopback_eof() {
        let (mut link, mut peer) = ChannelLink::loopback(1);
        peer.send(b"x").await.unwrap();
        peer.eof();

        link.readable().await;
        assert_eq!(link.try_read(10240), ChannelRead::Data(Bytes::from_static(b"x")));
        link.readable().await;
        assert_eq!(link.try_read(10240), ChannelRead::Eof);
    }

    #[tokio::test]
    async fn test_loopback_write_and_close() {
        let (link, mut peer) = ChannelLink::loopback(2);
        link.write(b"abc").unwrap();
        link.close();

        assert_eq!(
            peer.recv().await,
            Some(ChannelCommand::Data(Bytes::from_static(b"abc")))
        );
        assert_eq!(peer.recv().await, Some(ChannelCommand::Eof));
        assert_eq!(peer.recv().await, Some(ChannelCommand::Close));
    }

    #[tokio::test]
    async fn test_full_outbound_queue_refuses_writes() {
        let (link, mut peer) = ChannelLink::loopback(4);
        for _ in 0..OUTBOUND_DEPTH {
            assert!(link.can_write());
            link.write(b"x").unwrap();
        }
        assert!(!link.can_write());
        assert!(link.write(b"y").is_err());

        // Close still lands behind the queued data once the peer drains
        link.close();
        assert_eq!(peer.read_to_end().await.len(), OUTBOUND_DEPTH);
        assert_eq!(peer.recv().await, Some(ChannelCommand::Close));
    }

    #[tokio::test]
    async fn test_writable_wakes_when_peer_drains() {
        let (link, mut peer) = ChannelLink::loopback(5);
        for _ in 0..OUTBOUND_DEPTH {
            link.write(b"x").unwrap();
        }
        let waiting = tokio::time::timeout(std::time::Duration::from_millis(20), link.writable()).await;
        assert!(waiting.is_err());

        peer.recv().await.unwrap();
        link.writable().await;
        assert!(link.can_write());
    }

    #[tokio::test]
    async fn test_write_after_peer_drop_fails() {
        let (link, peer) = ChannelLink::loopback(3);
        drop(peer);
        assert!(link.write(b"x").is_err());
    }
}
