//! Server Address Parsing
//!
//! Accepted forms:
//!
//! ```text
//! cache1                        TCP, port 11211, weight 1
//! cache1:11212                  TCP, explicit port
//! cache1:11212:3                TCP, weight 3
//! [::1]:11211:2                 IPv6 literal
//! /var/run/memcached.sock       UNIX domain socket
//! /var/run/memcached.sock:2     UNIX domain socket, weight 2
//! memcached://user:pw@a:1,b:2   several TCP servers with credentials
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Port memcached listens on by default
pub const DEFAULT_PORT: u16 = 11211;

/// Where a server can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

/// Username and password embedded in a `memcached://` URI.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One configured memcached instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub endpoint: Endpoint,
    /// Relative share of the key space, always at least 1
    pub weight: u32,
    pub credentials: Option<Credentials>,
}

impl ServerAddr {
    /// Creates a TCP server with weight 1.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: Endpoint::Tcp {
                host: host.into(),
                port,
            },
            weight: 1,
            credentials: None,
        }
    }

    /// Creates a UNIX socket server with weight 1.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: Endpoint::Unix { path: path.into() },
            weight: 1,
            credentials: None,
        }
    }

    /// Sets the weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// The name used for logging and for placing the server on the ring:
    /// `host:port`, or the socket path.
    pub fn name(&self) -> String {
        match &self.endpoint {
            Endpoint::Tcp { host, port } if host.contains(':') => format!("[{}]:{}", host, port),
            Endpoint::Tcp { host, port } => format!("{}:{}", host, port),
            Endpoint::Unix { path } => path.display().to_string(),
        }
    }

    /// Parses a single `host[:port[:weight]]` or `/path[:weight]` entry.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidServer("empty address".to_string()));
        }

        if input.starts_with('/') {
            return parse_unix(input);
        }

        let (host, rest) = split_host(input)?;
        let mut parts = match rest {
            Some(rest) => rest.split(':').collect::<Vec<_>>(),
            None => Vec::new(),
        };
        if parts.len() > 2 {
            return Err(Error::InvalidServer(format!("too many fields in '{}'", input)));
        }

        let weight = if parts.len() == 2 {
            parse_weight(parts.pop().unwrap_or_default(), input)?
        } else {
            1
        };
        let port = match parts.pop() {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| Error::InvalidServer(format!("invalid port in '{}'", input)))?,
            None => DEFAULT_PORT,
        };

        Ok(ServerAddr::tcp(host, port).with_weight(weight))
    }
}

impl FromStr for ServerAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ServerAddr::parse(s)
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Parses a list of server strings. Each entry may itself be a comma
/// separated list or a `memcached://` URI.
pub fn parse_servers<S: AsRef<str>>(entries: &[S]) -> Result<Vec<ServerAddr>> {
    let mut servers = Vec::new();

    for entry in entries {
        let entry = entry.as_ref().trim();
        if let Some(rest) = entry.strip_prefix("memcached://") {
            servers.extend(parse_uri(rest)?);
            continue;
        }
        for part in entry.split(',').filter(|p| !p.trim().is_empty()) {
            servers.push(ServerAddr::parse(part)?);
        }
    }

    Ok(servers)
}

/// Parses the part of a `memcached://` URI after the scheme.
fn parse_uri(rest: &str) -> Result<Vec<ServerAddr>> {
    // options after '?' are accepted and ignored
    let rest = rest.split('?').next().unwrap_or_default().trim_end_matches('/');

    let (credentials, hosts) = match rest.rsplit_once('@') {
        Some((userinfo, hosts)) => {
            let (username, password) = userinfo.split_once(':').unwrap_or((userinfo, ""));
            let credentials = Credentials {
                username: username.to_string(),
                password: password.to_string(),
            };
            (Some(credentials), hosts)
        }
        None => (None, rest),
    };

    let mut servers = Vec::new();
    for host in hosts.split(',').filter(|h| !h.is_empty()) {
        let mut server = ServerAddr::parse(host)?;
        server.credentials = credentials.clone();
        servers.push(server);
    }

    if servers.is_empty() {
        return Err(Error::InvalidServer("memcached:// URI without hosts".to_string()));
    }
    Ok(servers)
}

fn parse_unix(input: &str) -> Result<ServerAddr> {
    // a trailing ":<digits>" is a weight, anything else belongs to the path
    if let Some((path, weight)) = input.rsplit_once(':') {
        if !weight.is_empty() && weight.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(ServerAddr::unix(path).with_weight(parse_weight(weight, input)?));
        }
    }
    Ok(ServerAddr::unix(input))
}

/// Splits off the host, handling bracketed IPv6 literals.
fn split_host(input: &str) -> Result<(&str, Option<&str>)> {
    if let Some(rest) = input.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| Error::InvalidServer(format!("unterminated '[' in '{}'", input)))?;
        return match after {
            "" => Ok((host, None)),
            _ => match after.strip_prefix(':') {
                Some(tail) => Ok((host, Some(tail))),
                None => Err(Error::InvalidServer(format!("unexpected '{}' in '{}'", after, input))),
            },
        };
    }

    match input.split_once(':') {
        Some((host, tail)) if !host.is_empty() => Ok((host, Some(tail))),
        Some(_) => Err(Error::InvalidServer(format!("missing host in '{}'", input))),
        None => Ok((input, None)),
    }
}

fn parse_weight(weight: &str, input: &str) -> Result<u32> {
    match weight.parse::<u32>() {
        Ok(w) if w > 0 => Ok(w),
        _ => Err(Error::InvalidServer(format!(
            "weight must be a positive integer in '{}'",
            input
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_only() {
        let server = ServerAddr::parse("cache1").unwrap();
        assert_eq!(server, ServerAddr::tcp("cache1", DEFAULT_PORT));
        assert_eq!(server.name(), "cache1:11211");
    }

    #[test]
    fn test_parse_port_and_weight() {
        let server = ServerAddr::parse("cache1:11212:3").unwrap();
        assert_eq!(server.endpoint, Endpoint::Tcp { host: "cache1".to_string(), port: 11212 });
        assert_eq!(server.weight, 3);
    }

    #[test]
    fn test_parse_ipv6() {
        let server = ServerAddr::parse("[::1]:11213:2").unwrap();
        assert_eq!(server.endpoint, Endpoint::Tcp { host: "::1".to_string(), port: 11213 });
        assert_eq!(server.weight, 2);
        assert_eq!(server.name(), "[::1]:11213");

        let bare = ServerAddr::parse("[::1]").unwrap();
        assert_eq!(bare.name(), "[::1]:11211");
    }

    #[test]
    fn test_parse_unix_socket() {
        let server = ServerAddr::parse("/tmp/mc.sock").unwrap();
        assert_eq!(server.endpoint, Endpoint::Unix { path: PathBuf::from("/tmp/mc.sock") });
        assert_eq!(server.weight, 1);

        let weighted = ServerAddr::parse("/tmp/mc.sock:4").unwrap();
        assert_eq!(weighted.weight, 4);
        assert_eq!(weighted.name(), "/tmp/mc.sock");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(ServerAddr::parse("").is_err());
        assert!(ServerAddr::parse("host:notaport").is_err());
        assert!(ServerAddr::parse("host:11211:0").is_err());
        assert!(ServerAddr::parse("host:1:2:3").is_err());
        assert!(ServerAddr::parse(":11211").is_err());
        assert!(ServerAddr::parse("[::1").is_err());
    }

    #[test]
    fn test_parse_servers_comma_list() {
        let servers = parse_servers(&["a:1,b:2", "c"]).unwrap();
        let names: Vec<_> = servers.iter().map(ServerAddr::name).collect();
        assert_eq!(names, vec!["a:1", "b:2", "c:11211"]);
    }

    #[test]
    fn test_parse_uri_with_credentials() {
        let servers = parse_servers(&["memcached://user:secret@a:11211,b:11212?timeout=1"]).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].name(), "b:11212");

        let credentials = servers[0].credentials.as_ref().unwrap();
        assert_eq!(credentials.username, "user");
        assert_eq!(credentials.password, "secret");
        assert!(!format!("{:?}", credentials).contains("secret"));
    }

    #[test]
    fn test_parse_uri_without_hosts() {
        assert!(parse_servers(&["memcached://"]).is_err());
    }
}
