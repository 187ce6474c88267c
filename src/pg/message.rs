//! Message framing.
//!
//! Every backend and frontend message except the startup packet is framed as
//! `tag: u8 | length: i32 (includes itself, not the tag) | payload`.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::codec;
use super::error::{PgError, PgResult};

/// Frames larger than this are treated as a corrupted stream.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Up-front buffer capacity for a frame body; larger bodies grow as bytes
/// arrive, so a bogus length cannot force a large allocation.
const INITIAL_BODY_CAPACITY: usize = 8 * 1024;

// ============================================================================
// Writer
// ============================================================================

/// Accumulates an outbound message body, then frames it.
#[derive(Debug, Default)]
pub struct MessageWriter {
    tag: Option<u8>,
    body: BytesMut,
}

impl MessageWriter {
    /// A tagged message.
    pub fn new(tag: u8) -> Self {
        Self {
            tag: Some(tag),
            body: BytesMut::new(),
        }
    }

    /// The startup packet, which carries no type tag.
    pub fn untagged() -> Self {
        Self::default()
    }

    pub fn set_type(&mut self, tag: u8) -> &mut Self {
        self.tag = Some(tag);
        self
    }

    pub fn add_byte(&mut self, v: u8) -> &mut Self {
        self.body.put_u8(v);
        self
    }

    pub fn add_int16(&mut self, v: i16) -> &mut Self {
        self.body.put_i16(v);
        self
    }

    pub fn add_int32(&mut self, v: i32) -> &mut Self {
        self.body.put_i32(v);
        self
    }

    /// NUL-terminated string.
    pub fn add_cstring(&mut self, s: &str) -> &mut Self {
        codec::put_cstring(&mut self.body, s);
        self
    }

    /// String bytes with no terminator.
    pub fn add_string(&mut self, s: &str) -> &mut Self {
        self.body.put_slice(s.as_bytes());
        self
    }

    pub fn add_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.body.put_slice(data);
        self
    }

    /// Bytes preceded by their int32 length.
    pub fn add_length_prefixed(&mut self, data: &[u8]) -> &mut Self {
        codec::put_length_prefixed(&mut self.body, data);
        self
    }

    /// The framed message.
    pub fn message(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.body.len() + 5);
        if let Some(tag) = self.tag {
            buf.put_u8(tag);
        }
        buf.put_i32(self.body.len() as i32 + 4);
        buf.put_slice(&self.body);
        buf
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Reads one framed message at a time and exposes typed reads over it.
pub struct MessageReader<R> {
    inner: R,
    tag: u8,
    payload: Bytes,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            tag: 0,
            payload: Bytes::new(),
        }
    }

    /// Read exactly one frame and return its tag.
    ///
    /// Partial reads are retried until the frame is complete. A channel
    /// closing before that yields `TransportClosed`.
    pub async fn next_message(&mut self) -> PgResult<u8> {
        let mut header = [0u8; 5];
        self.fill(&mut header).await?;

        let tag = header[0];
        let length = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        if length < 4 || length as usize > MAX_FRAME_LEN {
            return Err(PgError::violation(format!(
                "invalid length {} for message '{}'",
                length,
                tag as char
            )));
        }

        let body_len = length as usize - 4;
        let mut body = Vec::with_capacity(body_len.min(INITIAL_BODY_CAPACITY));
        (&mut self.inner)
            .take(body_len as u64)
            .read_to_end(&mut body)
            .await?;
        if body.len() < body_len {
            return Err(PgError::TransportClosed);
        }

        self.tag = tag;
        self.payload = Bytes::from(body);
        Ok(tag)
    }

    async fn fill(&mut self, buf: &mut [u8]) -> PgResult<()> {
        match self.inner.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(PgError::TransportClosed)
            }
            Err(e) => Err(PgError::Io(e)),
        }
    }

    /// Tag of the current frame.
    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// Unread bytes left in the current frame.
    pub fn remaining(&self) -> usize {
        self.payload.len()
    }

    pub fn read_byte(&mut self) -> PgResult<u8> {
        codec::get_u8(&mut self.payload)
    }

    pub fn read_int16(&mut self) -> PgResult<i16> {
        codec::get_i16(&mut self.payload)
    }

    pub fn read_int32(&mut self) -> PgResult<i32> {
        codec::get_i32(&mut self.payload)
    }

    pub fn read_cstring(&mut self) -> PgResult<String> {
        codec::get_cstring(&mut self.payload)
    }

    pub fn read_bytes(&mut self, n: usize) -> PgResult<Bytes> {
        codec::get_bytes(&mut self.payload, n)
    }

    pub fn read_string(&mut self, n: usize) -> PgResult<String> {
        codec::get_string(&mut self.payload, n)
    }

    pub fn read_all_bytes(&mut self) -> Bytes {
        codec::get_remaining(&mut self.payload)
    }

    /// Give back the underlying channel.
    pub fn into_inner(self) -> R {
        self.inner
    }
}
