//! ProxyCommand transport
//!
//! Runs the configured command through `sh -c` and uses its stdio as the SSH
//! byte stream, handed to `russh::client::connect_stream()`.
//!
//! Tokens expanded in the command line:
//! - `%h` target host
//! - `%p` target port
//! - `%r` remote user
//! - `%%` a literal `%`

use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::info;

use super::error::SshError;

/// Expand `%h`, `%p`, `%r` and `%%`. Unknown tokens are kept as written.
pub fn expand_proxy_command(template: &str, host: &str, port: u16, user: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push_str(host),
            Some('p') => out.push_str(&port.to_string()),
            Some('r') => out.push_str(user),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }

    out
}

/// Stdio of a proxy command as one duplex stream
pub struct ProxyCommandStream {
    // Held so the process is killed when the stream drops
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ProxyCommandStream {
    /// Spawn `command` (already expanded) under `sh -c`.
    pub fn spawn(command: &str) -> Result<Self, SshError> {
        info!("Starting proxy command: {}", command);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SshError::ConnectionFailed(format!("Failed to start proxy command: {}", e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SshError::Internal("proxy command stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SshError::Internal("proxy command stdout not piped".into()))?;

        Ok(Self {
            _child: child,
            stdin,
            stdout,
        })
    }
}

impl AsyncRead for ProxyCommandStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyCommandStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_expand_tokens() {
        assert_eq!(
            expand_proxy_command("ssh -W %h:%p -l %r jump", "rdp.internal", 3389, "alice"),
            "ssh -W rdp.internal:3389 -l alice jump"
        );
        assert_eq!(expand_proxy_command("nc %h 100%%", "h", 1, "u"), "nc h 100%");
        assert_eq!(expand_proxy_command("x %z %", "h", 1, "u"), "x %z %");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stream_round_trips_through_cat() {
        let mut stream = ProxyCommandStream::spawn("cat").unwrap();
        stream.write_all(b"SSH-2.0-test\r\n").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 14];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0-test\r\n");
    }
}
