//! PSK-authenticated TLS channel.
//!
//! # Responsibilities
//! - Build TLS 1.2 PSK contexts for the accepting and the connecting side
//! - Run the handshake over any byte stream
//! - Read and write application bytes; `close` resolves pending reads
//!   and releases a pending write
//!
//! # Design Decisions
//! - The caller's key is handed to OpenSSL unchanged, with an empty
//!   identity and no identity hint
//! - Protocol version is pinned to TLS 1.2 on both sides so no version
//!   negotiation can take place
//! - The stream is split so that a reader parked on a silent peer never
//!   blocks a writer, and the reverse

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use openssl::error::ErrorStack;
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslVersion};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;

use crate::transport::{Inbound, TransportError};

/// RFC 4279 / RFC 5487 suites, strongest first.
const PSK_CIPHERS: &str = "ECDHE-PSK-CHACHA20-POLY1305:ECDHE-PSK-AES256-CBC-SHA384:\
    ECDHE-PSK-AES128-CBC-SHA256:PSK-AES256-GCM-SHA384:PSK-AES128-GCM-SHA256:\
    PSK-AES256-CBC-SHA384:PSK-AES128-CBC-SHA256";

/// Largest key OpenSSL accepts in a PSK callback.
pub const MAX_KEY_LEN: usize = 256;

/// One TLS record's worth of plaintext.
const READ_CHUNK_LEN: usize = 16 * 1024;

/// Upper bound on delivering `close_notify` to a peer that stopped reading.
const CLOSE_NOTIFY_GRACE: Duration = Duration::from_millis(250);

/// The caller's opaque key, validated for use as a TLS pre-shared key.
#[derive(Clone)]
pub struct PskKey(Arc<[u8]>);

impl PskKey {
    pub fn new(key: &[u8]) -> Result<Self, TransportError> {
        if key.is_empty() {
            return Err(TransportError::InvalidKey("key material is empty"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(TransportError::InvalidKey("key material exceeds 256 bytes"));
        }
        Ok(Self(Arc::from(key)))
    }

    fn write_to(&self, out: &mut [u8]) -> Result<usize, ErrorStack> {
        let len = self.0.len();
        if len > out.len() {
            return Err(ErrorStack::get());
        }
        out[..len].copy_from_slice(&self.0);
        Ok(len)
    }
}

impl std::fmt::Debug for PskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PskKey(<redacted>)")
    }
}

fn builder() -> Result<SslContextBuilder, ErrorStack> {
    let mut builder = SslContext::builder(SslMethod::tls())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_cipher_list(PSK_CIPHERS)?;
    Ok(builder)
}

/// Context for the accepting side. Any identity is accepted; the key decides.
pub fn acceptor(key: &PskKey) -> Result<SslContext, TransportError> {
    let mut builder = builder()?;
    let key = key.clone();
    builder.set_psk_server_callback(move |_ssl, _identity, psk| key.write_to(psk));
    Ok(builder.build())
}

/// Context for the connecting side, presenting an empty identity.
pub fn connector(key: &PskKey) -> Result<SslContext, TransportError> {
    let mut builder = builder()?;
    let key = key.clone();
    builder.set_psk_client_callback(move |_ssl, _hint, identity, psk| {
        // NUL-terminated empty identity.
        if let Some(first) = identity.first_mut() {
            *first = 0;
        }
        key.write_to(psk)
    });
    Ok(builder.build())
}

/// Run the handshake as the connecting side.
pub async fn connect<S>(context: &SslContext, stream: S) -> Result<SecureChannel<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = SslStream::new(Ssl::new(context)?, stream)?;
    Pin::new(&mut stream)
        .connect()
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    Ok(SecureChannel::new(stream))
}

/// Run the handshake as the accepting side.
pub async fn accept<S>(context: &SslContext, stream: S) -> Result<SecureChannel<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = SslStream::new(Ssl::new(context)?, stream)?;
    Pin::new(&mut stream)
        .accept()
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    Ok(SecureChannel::new(stream))
}

fn peer_gone(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(e.kind(), BrokenPipe | ConnectionReset | NotConnected | UnexpectedEof)
}

fn broken_pipe() -> TransportError {
    std::io::Error::from(std::io::ErrorKind::BrokenPipe).into()
}

/// An established channel after a successful handshake.
pub struct SecureChannel<S> {
    reader: Mutex<ReadHalf<SslStream<S>>>,
    writer: Mutex<WriteHalf<SslStream<S>>>,
    closed: CancellationToken,
    protocol: &'static str,
    cipher: &'static str,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite,
{
    fn new(stream: SslStream<S>) -> Self {
        let protocol = stream.ssl().version_str();
        let cipher = stream.ssl().current_cipher().map_or("none", |c| c.name());
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
            protocol,
            cipher,
        }
    }

    /// Negotiated protocol version, e.g. `TLSv1.2`.
    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    /// Negotiated cipher suite (OpenSSL name).
    pub fn cipher(&self) -> &'static str {
        self.cipher
    }

    /// Next chunk of plaintext, or `Closed` on EOF or after `close`.
    ///
    /// Chunk boundaries follow TLS records, not the peer's writes.
    pub async fn recv(&self) -> Result<Inbound, TransportError> {
        let read = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Ok(Inbound::Closed),
            read = async {
                let mut reader = self.reader.lock().await;
                let mut buf = BytesMut::with_capacity(READ_CHUNK_LEN);
                reader.read_buf(&mut buf).await.map(|_| buf)
            } => read,
        };

        match read {
            Ok(buf) if buf.is_empty() => Ok(Inbound::Closed),
            Ok(buf) => Ok(Inbound::Data(Bytes::from(buf))),
            // Peer dropped the socket without close_notify.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(Inbound::Closed),
            Err(e) => Err(e.into()),
        }
    }

    /// Encrypt and send `data`. Gives up with `BrokenPipe` once closed,
    /// even while waiting on a peer that stopped reading.
    pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(broken_pipe());
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(broken_pipe()),
            written = async {
                let mut writer = self.writer.lock().await;
                writer.write_all(data).await?;
                writer.flush().await
            } => written.map_err(TransportError::from),
        }
    }

    /// Stop pending reads and writes, then send `close_notify` and close
    /// the write direction within a short grace period.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        };
        match tokio::time::timeout(CLOSE_NOTIFY_GRACE, shutdown).await {
            Ok(Ok(())) => Ok(()),
            // The peer is already gone.
            Ok(Err(e)) if peer_gone(&e) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Timeout(CLOSE_NOTIFY_GRACE)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
