//! # Wire Protocol
//!
//! Binary codec for the relay control channel and for signed data objects.
//!
//! All multi-byte integers are big-endian. Variable-length fields carry a
//! one-byte length prefix. Data objects (certificates) start with a 4-byte
//! type tag so a decoder can reject foreign payloads before parsing the body.
//!
//! ## Control messages
//!
//! | Message | Layout |
//! |---------|--------|
//! | [`QueryParams`] | target(32) \| query(len-prefixed) \| nonce(8) \| cert(len-prefixed, may be empty) |
//! | [`QueryResponse`] | error_code(1) \| proxy_service(len-prefixed) \| cert(len-prefixed, may be empty) |
//!
//! On a stream, each control message is framed behind a u16 length prefix
//! ([`read_frame`]/[`write_frame`]). Frames are capped at [`MAX_FRAME_SIZE`]
//! to bound memory held per connection.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::identity::{Identity, IDENTITY_LEN};
use crate::router::Nonce;

/// Maximum size of a single control frame.
pub const MAX_FRAME_SIZE: usize = 4096;

/// Length of a data object type tag.
pub const TAG_LEN: usize = 4;

/// A 4-byte data object type tag.
pub type ObjectTag = [u8; TAG_LEN];

/// Type tag for relay certificate blobs.
pub const RELAY_CERT_TAG: ObjectTag = *b"RLC1";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unexpected end of input")]
    Truncated,
    #[error("field of {0} bytes exceeds one-byte length prefix")]
    FieldTooLong(usize),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("invalid utf-8 in string field")]
    InvalidString,
    #[error("invalid length for {0}")]
    InvalidLength(&'static str),
    #[error("unknown direction {0:?}")]
    UnknownDirection(String),
    #[error("unknown error code {0}")]
    UnknownErrorCode(u8),
    #[error("wrong object type {0:?}")]
    WrongType(ObjectTag),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Encoder / Decoder
// ============================================================================

/// Append-only big-endian encoder.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append raw bytes without a length prefix.
    pub fn put_fixed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append bytes behind a one-byte length prefix.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        if bytes.len() > u8::MAX as usize {
            return Err(WireError::FieldTooLong(bytes.len()));
        }
        self.buf.push(bytes.len() as u8);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn put_string(&mut self, s: &str) -> Result<(), WireError> {
        self.put_bytes(s.as_bytes())
    }
}

/// Cursor-based decoder over a byte slice.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    pub fn get_fixed<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let bytes = self.take(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(bytes);
        Ok(arr)
    }

    /// Read bytes behind a one-byte length prefix.
    pub fn get_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.get_u8()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_string(&mut self) -> Result<String, WireError> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes).map_err(|_| WireError::InvalidString)
    }

    pub fn get_identity(&mut self) -> Result<Identity, WireError> {
        Ok(Identity::from_bytes(self.get_fixed::<IDENTITY_LEN>()?))
    }
}

// ============================================================================
// Control messages
// ============================================================================

/// Protocol-level result code carried in a [`QueryResponse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0,
    CertificateRejected = 1,
    RouteNotFound = 2,
    InternalError = 3,
}

impl ErrorCode {
    pub fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(ErrorCode::Success),
            1 => Ok(ErrorCode::CertificateRejected),
            2 => Ok(ErrorCode::RouteNotFound),
            3 => Ok(ErrorCode::InternalError),
            other => Err(WireError::UnknownErrorCode(other)),
        }
    }
}

/// Parameters sent by the caller when opening a relay query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryParams {
    pub target: Identity,
    pub query: String,
    pub nonce: Nonce,
    /// Optional relay certificate blob proving the caller acts for a deeper
    /// identity. Empty means the caller relays on its own behalf.
    pub cert: Vec<u8>,
}

impl QueryParams {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut enc = Encoder::new();
        enc.put_fixed(self.target.as_bytes());
        enc.put_string(&self.query)?;
        enc.put_u64(self.nonce.as_u64());
        enc.put_bytes(&self.cert)?;
        Ok(enc.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut dec = Decoder::new(bytes);
        Ok(Self {
            target: dec.get_identity()?,
            query: dec.get_string()?,
            nonce: Nonce::from(dec.get_u64()?),
            cert: dec.get_bytes()?,
        })
    }
}

/// Response sent by the relay service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryResponse {
    pub error: ErrorCode,
    /// Ephemeral proxy service name, set on success.
    pub proxy_service: String,
    /// The target's inbound certificate, attached when the requested target
    /// is not the relay itself. Allows the caller to chain further hops.
    pub cert: Vec<u8>,
}

impl QueryResponse {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut enc = Encoder::new();
        enc.put_u8(self.error as u8);
        enc.put_string(&self.proxy_service)?;
        enc.put_bytes(&self.cert)?;
        Ok(enc.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut dec = Decoder::new(bytes);
        Ok(Self {
            error: ErrorCode::from_u8(dec.get_u8()?)?,
            proxy_service: dec.get_string()?,
            cert: dec.get_bytes()?,
        })
    }
}

// ============================================================================
// Stream framing
// ============================================================================

/// Write one length-prefixed frame to a stream.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u16).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame from a stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 2];
    reader.read_exact(&mut len).await?;
    let len = u16::from_be_bytes(len) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_identity(seed: u8) -> Identity {
        Identity::from_bytes([seed; 32])
    }

    #[test]
    fn query_params_round_trip() {
        let params = QueryParams {
            target: make_identity(2),
            query: "data.read".to_string(),
            nonce: Nonce::from(0xDEADBEEF),
            cert: vec![1, 2, 3],
        };
        let bytes = params.encode().unwrap();
        assert_eq!(QueryParams::decode(&bytes).unwrap(), params);
    }

    #[test]
    fn query_params_empty_cert() {
        let params = QueryParams {
            target: make_identity(9),
            query: "ping".to_string(),
            nonce: Nonce::from(1),
            cert: vec![],
        };
        let decoded = QueryParams::decode(&params.encode().unwrap()).unwrap();
        assert!(decoded.cert.is_empty());
    }

    #[test]
    fn query_response_round_trip() {
        let response = QueryResponse {
            error: ErrorCode::Success,
            proxy_service: ".redirect.00000001.cafe".to_string(),
            cert: vec![0xAB; 64],
        };
        let bytes = response.encode().unwrap();
        assert_eq!(QueryResponse::decode(&bytes).unwrap(), response);
    }

    #[test]
    fn truncated_input_rejected() {
        let params = QueryParams {
            target: make_identity(1),
            query: "svc".to_string(),
            nonce: Nonce::from(7),
            cert: vec![4, 5, 6],
        };
        let bytes = params.encode().unwrap();
        for cut in [0, 10, 31, bytes.len() - 1] {
            assert!(matches!(
                QueryParams::decode(&bytes[..cut]),
                Err(WireError::Truncated)
            ));
        }
    }

    #[test]
    fn unknown_error_code_rejected() {
        let mut enc = Encoder::new();
        enc.put_u8(9);
        enc.put_string("x").unwrap();
        enc.put_bytes(&[]).unwrap();
        assert!(matches!(
            QueryResponse::decode(&enc.into_bytes()),
            Err(WireError::UnknownErrorCode(9))
        ));
    }

    #[test]
    fn oversized_field_rejected() {
        let mut enc = Encoder::new();
        assert!(matches!(
            enc.put_bytes(&[0u8; 300]),
            Err(WireError::FieldTooLong(300))
        ));
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello frame").await.unwrap();
        let frame = read_frame(&mut b).await.unwrap();
        assert_eq!(frame, b"hello frame");
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            write_frame(&mut a, &payload).await,
            Err(WireError::FrameTooLarge(_))
        ));
    }
}
