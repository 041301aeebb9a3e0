//! SOCKS5 client handshake (RFC 1928, RFC 1929).
//!
//! # Handshake
//!
//! ```text
//! client                                   upstream hop
//!   | -- VER=5 NMETHODS METHODS ------------> |
//!   | <------------------ VER=5 METHOD ------ |
//!   | -- (RFC 1929) VER=1 ULEN U PLEN P ----> |   only if METHOD = 0x02
//!   | <------------------ VER=1 STATUS ------ |
//!   | -- VER=5 CMD=CONNECT RSV ATYP ADDR PORT>|
//!   | <-- VER=5 REP RSV ATYP BND.ADDR BND.PORT|
//!   |                                         |
//!   | ===== tunnelled bytes to target ======= |
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub const VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply codes.
pub mod reply {
    pub const SUCCEEDED: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const CONNECTION_NOT_ALLOWED: u8 = 0x02;
    pub const NETWORK_UNREACHABLE: u8 = 0x03;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const TTL_EXPIRED: u8 = 0x06;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

    /// Human-readable reply text.
    pub fn message(code: u8) -> &'static str {
        match code {
            SUCCEEDED => "succeeded",
            GENERAL_FAILURE => "general SOCKS server failure",
            CONNECTION_NOT_ALLOWED => "connection not allowed by ruleset",
            NETWORK_UNREACHABLE => "network unreachable",
            HOST_UNREACHABLE => "host unreachable",
            CONNECTION_REFUSED => "connection refused",
            TTL_EXPIRED => "TTL expired",
            COMMAND_NOT_SUPPORTED => "command not supported",
            ADDRESS_TYPE_NOT_SUPPORTED => "address type not supported",
            _ => "unknown error",
        }
    }
}

/// Errors from a SOCKS5 exchange.
#[derive(Debug, thiserror::Error)]
pub enum Socks5Error {
    /// Transport failure during the handshake.
    #[error("SOCKS5 I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer answered with a different protocol version.
    #[error("Invalid SOCKS version: expected {expected:#04x}, got {actual:#04x}")]
    InvalidVersion { expected: u8, actual: u8 },

    /// Server accepted none of the offered methods.
    #[error("No acceptable SOCKS5 authentication method")]
    NoAcceptableMethod,

    /// Server picked a method that was not offered.
    #[error("Unsupported SOCKS5 authentication method: {0:#04x}")]
    UnsupportedMethod(u8),

    /// Username/password rejected.
    #[error("SOCKS5 authentication failed")]
    AuthFailed,

    /// Username, password or domain longer than 255 bytes.
    #[error("SOCKS5 field too long: {0}")]
    FieldTooLong(&'static str),

    /// CONNECT refused by the server.
    #[error("SOCKS5 server replied {code:#04x}: {message}")]
    ServerReply { code: u8, message: &'static str },

    /// Unknown address type in a reply.
    #[error("Unsupported SOCKS5 address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Target is not a valid `host:port`.
    #[error("Invalid target address: {0}")]
    InvalidTarget(String),
}

/// Username/password pair for RFC 1929 authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A `host:port` dial target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Literal IP address.
    Ip(SocketAddr),
    /// Hostname still to be resolved.
    Domain(String, u16),
}

impl TargetAddr {
    /// Parse `host:port`, `ip:port` or `[ipv6]:port`.
    pub fn parse(address: &str) -> Result<Self, Socks5Error> {
        let invalid = || Socks5Error::InvalidTarget(address.to_string());

        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            return Err(invalid());
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self::Ip(SocketAddr::new(ip, port)));
        }
        if host.contains(':') || host.len() > 255 {
            return Err(invalid());
        }
        Ok(Self::Domain(host.to_string(), port))
    }

    /// Port component.
    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Negotiate a method and authenticate if the server asks for it.
///
/// # Errors
/// Returns [`Socks5Error`] on any protocol violation or rejection.
pub async fn handshake<S>(
    stream: &mut S,
    credentials: Option<&Credentials>,
) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if credentials.is_some() {
        &[VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
    } else {
        &[VERSION, 1, AUTH_NONE]
    };
    stream.write_all(greeting).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    trace!(?response, "SOCKS5 method response");

    if response[0] != VERSION {
        return Err(Socks5Error::InvalidVersion {
            expected: VERSION,
            actual: response[0],
        });
    }

    match (response[1], credentials) {
        (AUTH_NONE, _) => Ok(()),
        (AUTH_PASSWORD, Some(credentials)) => authenticate(stream, credentials).await,
        (AUTH_NO_ACCEPTABLE, _) => Err(Socks5Error::NoAcceptableMethod),
        (other, _) => Err(Socks5Error::UnsupportedMethod(other)),
    }
}

async fn authenticate<S>(stream: &mut S, credentials: &Credentials) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = credentials.username.as_bytes();
    let pass = credentials.password.as_bytes();
    let ulen = u8::try_from(user.len()).map_err(|_| Socks5Error::FieldTooLong("username"))?;
    let plen = u8::try_from(pass.len()).map_err(|_| Socks5Error::FieldTooLong("password"))?;

    // VER | ULEN | UNAME | PLEN | PASSWD
    let mut request = Vec::with_capacity(3 + user.len() + pass.len());
    request.push(AUTH_PASSWORD_VERSION);
    request.push(ulen);
    request.extend_from_slice(user);
    request.push(plen);
    request.extend_from_slice(pass);
    stream.write_all(&request).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != AUTH_PASSWORD_VERSION {
        return Err(Socks5Error::InvalidVersion {
            expected: AUTH_PASSWORD_VERSION,
            actual: response[0],
        });
    }
    if response[1] != 0x00 {
        return Err(Socks5Error::AuthFailed);
    }
    Ok(())
}

/// Build a CONNECT request for `target`.
pub fn build_connect_request(target: &TargetAddr) -> Result<Vec<u8>, Socks5Error> {
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    let mut request = Vec::with_capacity(22);
    request.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00]);

    match target {
        TargetAddr::Ip(SocketAddr::V4(addr)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&addr.ip().octets());
        }
        TargetAddr::Ip(SocketAddr::V6(addr)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&addr.ip().octets());
        }
        TargetAddr::Domain(host, _) => {
            let len = u8::try_from(host.len()).map_err(|_| Socks5Error::FieldTooLong("domain"))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }

    request.extend_from_slice(&target.port().to_be_bytes());
    Ok(request)
}

/// Issue CONNECT for `target` and return the server's bound address.
///
/// Domain-typed bound addresses are reported as `0.0.0.0:port`.
///
/// # Errors
/// Returns [`Socks5Error::ServerReply`] when the server refuses the CONNECT.
pub async fn connect<S>(stream: &mut S, target: &TargetAddr) -> Result<SocketAddr, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&build_connect_request(target)?).await?;

    // VER | REP | RSV | ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(Socks5Error::InvalidVersion {
            expected: VERSION,
            actual: header[0],
        });
    }
    if header[1] != reply::SUCCEEDED {
        return Err(Socks5Error::ServerReply {
            code: header[1],
            message: reply::message(header[1]),
        });
    }

    let ip = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; usize::from(len[0])];
            stream.read_exact(&mut name).await?;
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
        other => return Err(Socks5Error::UnsupportedAddressType(other)),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(SocketAddr::new(ip, u16::from_be_bytes(port)))
}
