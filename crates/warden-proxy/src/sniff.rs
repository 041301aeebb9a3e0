//! Client handshake recognition.
//!
//! A [`Sniffer`] reads the opening bytes of a client connection and either
//! recognises a handshake or rejects the connection. The proxy runs it on a
//! [`crate::RewindConn`] so rejected bytes can still be replayed to a
//! fronting server.
//!
//! # Preamble Layout
//!
//! ```text
//! +--------+-----------+-----+------------------+---------+
//! | nonce  | timestamp | len | target host:port |   tag   |
//! |  32 B  | 8 B (BE)  | 1 B |      len B       |  32 B   |
//! +--------+-----------+-----+------------------+---------+
//!  tag = HMAC-SHA256(secret, nonce || timestamp || len || target)
//! ```
//!
//! The tag doubles as the anti-replay fingerprint: the random nonce makes it
//! unique per legitimate connection.

use crate::socks5::TargetAddr;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt};

type HmacSha256 = Hmac<Sha256>;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 32;

/// Authentication tag length in bytes.
pub const TAG_LEN: usize = 32;

/// Minimum shared secret length in bytes.
pub const MIN_SECRET_LEN: usize = 16;

/// Default tolerated clock difference between client and proxy.
pub const DEFAULT_TIME_SKEW: Duration = Duration::from_secs(5);

const FIXED_LEN: usize = NONCE_LEN + 8 + 1;

/// Per-connection unique handshake identifier.
pub type Fingerprint = [u8; TAG_LEN];

/// A recognised client handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Replay fingerprint.
    pub fingerprint: Fingerprint,
    /// Requested upstream `host:port`.
    pub target: String,
    /// Bytes of the connection consumed by the handshake.
    pub header_len: usize,
}

/// Handshake not recognised.
#[derive(Debug, thiserror::Error)]
pub enum SniffError {
    /// Short read, reset, or timeout while reading.
    #[error("Failed to read handshake: {0}")]
    Io(#[from] io::Error),

    /// Tag does not verify under the shared secret.
    #[error("Handshake authentication failed")]
    BadTag,

    /// Timestamp outside the tolerated window.
    #[error("Handshake timestamp is {skew_secs}s away from local clock")]
    ClockSkew { skew_secs: u64 },

    /// Target is not valid UTF-8 `host:port`.
    #[error("Invalid handshake target: {0}")]
    InvalidTarget(String),

    /// Shared secret shorter than [`MIN_SECRET_LEN`].
    #[error("Secret must be at least {MIN_SECRET_LEN} bytes")]
    WeakSecret,
}

/// Recognises client handshakes.
#[async_trait]
pub trait Sniffer: Send + Sync {
    /// Read and validate a handshake from the start of `conn`.
    ///
    /// # Errors
    /// [`SniffError`] if the bytes are not a valid handshake.
    async fn sniff(
        &self,
        conn: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Handshake, SniffError>;
}

/// HMAC-authenticated preamble sniffer.
#[derive(Clone)]
pub struct PreambleSniffer {
    secret: Vec<u8>,
    tolerate_skew: Duration,
}

impl PreambleSniffer {
    /// # Errors
    /// [`SniffError::WeakSecret`] if `secret` is shorter than [`MIN_SECRET_LEN`].
    pub fn new(secret: Vec<u8>, tolerate_skew: Duration) -> Result<Self, SniffError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(SniffError::WeakSecret);
        }
        Ok(Self {
            secret,
            tolerate_skew,
        })
    }

    pub fn tolerate_skew(&self) -> Duration {
        self.tolerate_skew
    }
}

impl std::fmt::Debug for PreambleSniffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreambleSniffer")
            .field("secret", &"<redacted>")
            .field("tolerate_skew", &self.tolerate_skew)
            .finish()
    }
}

#[async_trait]
impl Sniffer for PreambleSniffer {
    async fn sniff(
        &self,
        conn: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Handshake, SniffError> {
        let mut header = vec![0u8; FIXED_LEN];
        conn.read_exact(&mut header).await?;

        let target_len = header[FIXED_LEN - 1] as usize;
        header.resize(FIXED_LEN + target_len, 0);
        conn.read_exact(&mut header[FIXED_LEN..]).await?;

        let mut tag = [0u8; TAG_LEN];
        conn.read_exact(&mut tag).await?;

        let mut mac = keyed(&self.secret)?;
        mac.update(&header);
        mac.verify_slice(&tag).map_err(|_| SniffError::BadTag)?;

        let mut stamp = [0u8; 8];
        stamp.copy_from_slice(&header[NONCE_LEN..NONCE_LEN + 8]);
        let sent = u64::from_be_bytes(stamp);
        let skew_secs = unix_now().abs_diff(sent);
        if skew_secs > self.tolerate_skew.as_secs() {
            return Err(SniffError::ClockSkew { skew_secs });
        }

        let raw_target = &header[FIXED_LEN..];
        let target = std::str::from_utf8(raw_target).map_err(|_| {
            SniffError::InvalidTarget(String::from_utf8_lossy(raw_target).into_owned())
        })?;
        TargetAddr::parse(target).map_err(|_| SniffError::InvalidTarget(target.to_string()))?;

        Ok(Handshake {
            fingerprint: tag,
            target: target.to_string(),
            header_len: header.len() + TAG_LEN,
        })
    }
}

/// Client side of the preamble.
#[derive(Debug, Clone, Copy)]
pub struct Preamble;

impl Preamble {
    /// Build a preamble for `target` stamped with `at`.
    ///
    /// # Errors
    /// [`SniffError::InvalidTarget`] if `target` exceeds 255 bytes,
    /// [`SniffError::WeakSecret`] for a short secret.
    pub fn seal(secret: &[u8], target: &str, at: SystemTime) -> Result<Vec<u8>, SniffError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(SniffError::WeakSecret);
        }
        let len = u8::try_from(target.len())
            .map_err(|_| SniffError::InvalidTarget(target.to_string()))?;
        let stamp = at.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);

        let mut out = vec![0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut out);
        out.extend_from_slice(&stamp.to_be_bytes());
        out.push(len);
        out.extend_from_slice(target.as_bytes());

        let mut mac = keyed(secret)?;
        mac.update(&out);
        out.extend_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    }
}

fn keyed(secret: &[u8]) -> Result<HmacSha256, SniffError> {
    HmacSha256::new_from_slice(secret).map_err(|_| SniffError::WeakSecret)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
