//! X11 forwarding helpers

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Remote displays probed for a free listen, `6000 + n`
pub const REMOTE_DISPLAY_FIRST: u16 = 10;
pub const REMOTE_DISPLAY_LAST: u16 = 99;

/// TCP port of X display `n`
pub const X11_BASE_PORT: u16 = 6000;

/// Directory holding the local X servers' sockets
pub const X11_UNIX_DIR: &str = "/tmp/.X11-unix";

/// Display number of an X display string (`:0`, `:1.0`, `localhost:10.0`, `unix:2`).
pub fn parse_display(display: &str) -> Option<u32> {
    let (_, rest) = display.rsplit_once(':')?;
    let number = rest.split('.').next()?;
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    number.parse().ok()
}

/// Unix socket of a local display
pub fn local_socket_path(display: &str) -> Option<PathBuf> {
    local_socket_path_in(Path::new(X11_UNIX_DIR), display)
}

/// Socket of `display` under `dir` instead of [`X11_UNIX_DIR`]
pub fn local_socket_path_in(dir: &Path, display: &str) -> Option<PathBuf> {
    parse_display(display).map(|n| dir.join(format!("X{}", n)))
}

/// Rate limit for polling forwarded X11 connections
#[derive(Debug)]
pub struct PollGate {
    interval: Duration,
    last: Instant,
}

impl PollGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    /// True at most once per interval.
    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    fn ready_at(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_display() {
        assert_eq!(parse_display(":0"), Some(0));
        assert_eq!(parse_display(":1.0"), Some(1));
        assert_eq!(parse_display("localhost:10.0"), Some(10));
        assert_eq!(parse_display("unix:2"), Some(2));
        assert_eq!(parse_display("wayland-0"), None);
        assert_eq!(parse_display(":"), None);
        assert_eq!(parse_display(":x"), None);
    }

    #[test]
    fn test_local_socket_path() {
        assert_eq!(
            local_socket_path(":3.0"),
            Some(PathBuf::from("/tmp/.X11-unix/X3"))
        );
        assert_eq!(
            local_socket_path_in(Path::new("/run/x"), "unix:12"),
            Some(PathBuf::from("/run/x/X12"))
        );
        assert_eq!(local_socket_path_in(Path::new("/run/x"), "wayland-0"), None);
    }

    #[test]
    fn test_poll_gate() {
        let start = Instant::now();
        let mut gate = PollGate {
            interval: Duration::from_millis(100),
            last: start,
        };
        assert!(!gate.ready_at(start + Duration::from_millis(50)));
        assert!(gate.ready_at(start + Duration::from_millis(120)));
        assert!(!gate.ready_at(start + Duration::from_millis(150)));
        assert!(gate.ready_at(start + Duration::from_millis(230)));
    }
}
