//! Local end of a tunnel pair: a TCP connection or, for X11, a Unix socket.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// Non-blocking write half used when flushing pending channel data
pub trait NonBlockingWrite {
    /// Write without waiting; `WouldBlock` when the socket buffer is full.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

#[derive(Debug)]
pub enum LocalSocket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl LocalSocket {
    pub async fn connect_tcp(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(LocalSocket::Tcp(stream))
    }

    #[cfg(unix)]
    pub async fn connect_unix(path: &std::path::Path) -> io::Result<Self> {
        Ok(LocalSocket::Unix(UnixStream::connect(path).await?))
    }

    pub async fn readable(&self) -> io::Result<()> {
        match self {
            LocalSocket::Tcp(s) => s.readable().await,
            #[cfg(unix)]
            LocalSocket::Unix(s) => s.readable().await,
        }
    }

    pub async fn writable(&self) -> io::Result<()> {
        match self {
            LocalSocket::Tcp(s) => s.writable().await,
            #[cfg(unix)]
            LocalSocket::Unix(s) => s.writable().await,
        }
    }

    /// Read without waiting; `Ok(0)` is end of stream.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            LocalSocket::Tcp(s) => s.try_read(buf),
            #[cfg(unix)]
            LocalSocket::Unix(s) => s.try_read(buf),
        }
    }
}

impl NonBlockingWrite for LocalSocket {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LocalSocket::Tcp(s) => s.try_write(buf),
            #[cfg(unix)]
            LocalSocket::Unix(s) => s.try_write(buf),
        }
    }
}

impl From<TcpStream> for LocalSocket {
    fn from(stream: TcpStream) -> Self {
        LocalSocket::Tcp(stream)
    }
}

#[cfg(unix)]
impl From<UnixStream> for LocalSocket {
    fn from(stream: UnixStream) -> Self {
        LocalSocket::Unix(stream)
    }
}
