//! Tunnel pump
//!
//! One iteration waits (200 ms at most) until any socket or channel of the
//! registry can make progress, then runs three phases over all pairs in order:
//! 1. socket → channel, through a shared scratch buffer, while the channel's
//!    outbound queue has room
//! 2. channel → pending buffer, for pairs with nothing pending
//! 3. pending buffer → socket
//!
//! A pair that fails in any phase is removed on the spot.

use std::io;
use std::time::Duration;

use futures_util::future::select_all;
use tracing::{debug, trace};

use super::local_socket::LocalSocket;
use super::registry::{flush_pending, ChannelRegistry, FlushOutcome, Pair, PendingBuffer};
use crate::ssh::{ChannelRead, Session};

pub const WAIT_TIMEOUT: Duration = Duration::from_millis(200);

/// Size of the socket → channel scratch buffer
pub const SCRATCH_LEN: usize = 10240;

/// Largest chunk taken from a channel into one pending buffer
const CHANNEL_READ_LIMIT: usize = 256 * 1024;

/// Resolves when `pair` has something to do.
async fn pair_ready(pair: &mut Pair<LocalSocket>) -> io::Result<()> {
    let Pair {
        channel,
        socket,
        pending,
    } = pair;

    let channel_full = !channel.can_write();
    match (pending.is_some(), channel_full) {
        (true, false) => tokio::select! {
            r = socket.readable() => r,
            r = socket.writable() => r,
        },
        (true, true) => tokio::select! {
            _ = channel.writable() => Ok(()),
            r = socket.writable() => r,
        },
        (false, false) => tokio::select! {
            r = socket.readable() => r,
            _ = channel.readable() => Ok(()),
        },
        (false, true) => tokio::select! {
            _ = channel.writable() => Ok(()),
            _ = channel.readable() => Ok(()),
        },
    }
}

/// Wait until a pair is ready; `Ok(false)` on timeout.
pub async fn wait_ready(registry: &mut ChannelRegistry<LocalSocket>) -> io::Result<bool> {
    if registry.is_empty() {
        tokio::time::sleep(WAIT_TIMEOUT).await;
        return Ok(false);
    }

    let mut waits = Vec::with_capacity(registry.len());
    for pair in registry.iter_mut() {
        waits.push(Box::pin(pair_ready(pair)));
    }
    match tokio::time::timeout(WAIT_TIMEOUT, select_all(waits)).await {
        Ok((result, _, _)) => result.map(|_| true),
        Err(_) => Ok(false),
    }
}

/// Phase 1: drain readable sockets into their channels.
pub fn pump_sockets(registry: &mut ChannelRegistry<LocalSocket>, scratch: &mut [u8], session: &Session) {
    let mut i = 0;
    while let Some(pair) = registry.get_mut(i) {
        let mut disconnected = false;

        // A full channel leaves the socket unread; its data waits in the kernel
        while pair.channel.can_write() {
            match pair.socket.try_read(scratch) {
                Ok(0) => {
                    session.set_error("Could not read from tunnel listening socket. Connection closed");
                    disconnected = true;
                    break;
                }
                Ok(n) => {
                    trace!("Socket → channel {}: {} bytes", pair.channel.id(), n);
                    if let Err(e) = pair.channel.write(&scratch[..n]) {
                        session.set_error(format!("Could not write to SSH channel. {}", e));
                        disconnected = true;
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    session.set_error(format!("Could not read from tunnel listening socket. {}", e));
                    disconnected = true;
                    break;
                }
            }
        }

        if disconnected {
            debug!("Tunnel pair disconnected: {:?}", session.error());
            registry.remove(i);
            continue;
        }
        i += 1;
    }
}

/// Phases 2 and 3: fill pending buffers from channels, then flush them.
pub fn pump_channels(registry: &mut ChannelRegistry<LocalSocket>, session: &Session) {
    let mut i = 0;
    while let Some(pair) = registry.get_mut(i) {
        let mut disconnected = false;

        if pair.pending.is_none() {
            match pair.channel.try_read(CHANNEL_READ_LIMIT) {
                ChannelRead::Data(data) => {
                    trace!("Channel {} → socket: {} bytes", pair.channel.id(), data.len());
                    pair.pending = Some(PendingBuffer::new(data));
                }
                ChannelRead::Empty => {}
                ChannelRead::Eof => {
                    session.set_error("Could not poll SSH channel. Channel closed");
                    disconnected = true;
                }
            }
        }

        if !disconnected && flush_pending(&mut pair.socket, &mut pair.pending) == FlushOutcome::Failed {
            session.set_error("Could not send data to tunnel listening socket.");
            disconnected = true;
        }

        if disconnected {
            debug!("Connection to SSH tunnel dropped: {:?}", session.error());
            registry.remove(i);
            continue;
        }
        i += 1;
    }
}

/// Wait once and run all phases. An error means the wait itself failed.
pub async fn pump_once(
    registry: &mut ChannelRegistry<LocalSocket>,
    scratch: &mut [u8],
    session: &Session,
) -> io::Result<()> {
    wait_ready(registry).await?;
    pump_sockets(registry, scratch, session);
    pump_channels(registry, session);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamStore;
    use crate::ssh::channel::{ChannelCommand, OUTBOUND_DEPTH};
    use crate::ssh::ChannelLink;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn session() -> Session {
        Session::from_params(&ParamStore::from_pairs([("server", "h")]), true)
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let session = session();
        let (mut client, server) = socket_pair().await;
        let (link, mut peer) = ChannelLink::loopback(1);
        let mut registry = ChannelRegistry::new();
        registry.add(link, LocalSocket::from(server));
        let mut scratch = vec![0u8; SCRATCH_LEN];

        client.write_all(b"ping").await.unwrap();
        peer.send(b"pong").await.unwrap();

        let mut sent = Vec::new();
        let mut received = Vec::new();
        for _ in 0..20 {
            pump_once(&mut registry, &mut scratch, &session).await.unwrap();
            while let Ok(Some(ChannelCommand::Data(d))) =
                tokio::time::timeout(Duration::from_millis(10), peer.recv()).await
            {
                sent.extend_from_slice(&d);
            }
            let mut buf = [0u8; 16];
            if let Ok(Ok(n)) =
                tokio::time::timeout(Duration::from_millis(10), client.read(&mut buf)).await
            {
                received.extend_from_slice(&buf[..n]);
            }
            if sent == b"ping" && received == b"pong" {
                break;
            }
        }

        assert_eq!(sent, b"ping");
        assert_eq!(received, b"pong");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_socket_close_removes_pair() {
        let session = session();
        let (client, server) = socket_pair().await;
        let (link, mut peer) = ChannelLink::loopback(2);
        let mut registry = ChannelRegistry::new();
        registry.add(link, LocalSocket::from(server));
        let mut scratch = vec![0u8; SCRATCH_LEN];

        drop(client);
        for _ in 0..20 {
            pump_once(&mut registry, &mut scratch, &session).await.unwrap();
            if registry.is_empty() {
                break;
            }
        }

        assert!(registry.is_empty());
        assert_eq!(peer.recv().await, Some(ChannelCommand::Eof));
        assert!(session.error().is_some());
    }

    #[tokio::test]
    async fn test_channel_eof_after_drain_removes_pair() {
        let session = session();
        let (mut client, server) = socket_pair().await;
        let (link, mut peer) = ChannelLink::loopback(3);
        let mut registry = ChannelRegistry::new();
        registry.add(link, LocalSocket::from(server));
        let mut scratch = vec![0u8; SCRATCH_LEN];

        peer.send(b"last words").await.unwrap();
        peer.eof();
        for _ in 0..20 {
            pump_once(&mut registry, &mut scratch, &session).await.unwrap();
            if registry.is_empty() {
                break;
            }
        }
        assert!(registry.is_empty());

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"last words");
    }

    /// A pair whose kernel buffers fill after a few kilobytes
    async fn small_buffer_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        let client = socket.connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        socket2::SockRef::from(&server).set_send_buffer_size(4096).unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_blocked_socket_keeps_channel_data_pending() {
        const TOTAL: usize = 16 * 64 * 1024;
        let session = session();
        let (mut client, server) = small_buffer_pair().await;
        let (link, peer) = ChannelLink::loopback(4);
        let mut registry = ChannelRegistry::new();
        registry.add(link, LocalSocket::from(server));
        let mut scratch = vec![0u8; SCRATCH_LEN];

        let chunk = vec![7u8; 64 * 1024];
        for _ in 0..16 {
            peer.send(&chunk).await.unwrap();
        }
        for _ in 0..10 {
            pump_once(&mut registry, &mut scratch, &session).await.unwrap();
        }
        // Nobody reads the client side: the pair stays, its data waits
        assert_eq!(registry.len(), 1);
        assert!(registry.pending_bytes() > 0);

        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            let mut total = 0;
            while total < TOTAL {
                let n = client.read(&mut buf).await.unwrap();
                assert!(n > 0);
                assert!(buf[..n].iter().all(|&b| b == 7));
                total += n;
            }
            total
        });
        for _ in 0..5000 {
            if reader.is_finished() {
                break;
            }
            pump_once(&mut registry, &mut scratch, &session).await.unwrap();
        }

        assert_eq!(reader.await.unwrap(), TOTAL);
        assert_eq!(registry.pending_bytes(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_full_channel_leaves_socket_unread() {
        let total = SCRATCH_LEN * (OUTBOUND_DEPTH + 8);
        let session = session();
        let (mut client, server) = socket_pair().await;
        let (link, mut peer) = ChannelLink::loopback(5);
        let mut registry = ChannelRegistry::new();
        registry.add(link, LocalSocket::from(server));
        let mut scratch = vec![0u8; SCRATCH_LEN];

        let writer = tokio::spawn(async move {
            let payload: Vec<u8> = (0..total).map(|i| (i % 241) as u8).collect();
            client.write_all(&payload).await.unwrap();
            (client, payload)
        });
        for _ in 0..10 {
            pump_once(&mut registry, &mut scratch, &session).await.unwrap();
        }
        // The peer drains nothing, so reading stopped at the queue bound
        assert_eq!(registry.len(), 1);
        assert!(!registry.get_mut(0).unwrap().channel.can_write());

        let drain = tokio::spawn(async move {
            let mut carried = Vec::new();
            while carried.len() < total {
                match peer.recv().await {
                    Some(ChannelCommand::Data(d)) => carried.extend_from_slice(&d),
                    other => panic!("unexpected channel command {:?}", other),
                }
            }
            carried
        });
        for _ in 0..5000 {
            if drain.is_finished() {
                break;
            }
            pump_once(&mut registry, &mut scratch, &session).await.unwrap();
        }

        let (_client, payload) = writer.await.unwrap();
        assert_eq!(drain.await.unwrap(), payload);
        assert_eq!(registry.len(), 1);
    }
}
