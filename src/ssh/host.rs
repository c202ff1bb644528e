//! `host[:port]` resolution for connection parameters

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Split a server string into host and port.
///
/// Accepted forms:
/// - `host` / `host:port`
/// - `[v6addr]` / `[v6addr]:port`
/// - a bare IPv6 address (more than one `:` and no brackets), which carries no port
///
/// A missing or unparsable port yields `default_port`.
pub fn parse_server(input: &str, default_port: u16) -> (String, u16) {
    let input = input.trim();

    if let Some(rest) = input.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }

    if input.matches(':').count() == 1 {
        if let Some((host, port)) = input.split_once(':') {
            return (host.to_string(), port.parse().unwrap_or(default_port));
        }
    }

    (input.to_string(), default_port)
}

/// Format a host/port pair the way it is written in `known_hosts` and logs.
pub fn format_server(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
