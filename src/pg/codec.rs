//! Protocol primitives over byte buffers.
//!
//! Writers append to a `BytesMut`; readers consume from the front of a
//! `Bytes` cursor and fail with a protocol violation instead of panicking
//! when the payload is shorter than the field being read.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{PgError, PgResult};

/// Append a NUL-terminated string.
#[inline]
pub fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Append an int32 length prefix followed by the raw bytes.
#[inline]
pub fn put_length_prefixed(buf: &mut BytesMut, data: &[u8]) {
    buf.put_i32(data.len() as i32);
    buf.put_slice(data);
}

fn ensure(buf: &Bytes, n: usize, what: &str) -> PgResult<()> {
    if buf.remaining() < n {
        return Err(PgError::violation(format!(
            "message too short reading {}: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

#[inline]
pub fn get_u8(buf: &mut Bytes) -> PgResult<u8> {
    ensure(buf, 1, "byte")?;
    Ok(buf.get_u8())
}

#[inline]
pub fn get_i16(buf: &mut Bytes) -> PgResult<i16> {
    ensure(buf, 2, "int16")?;
    Ok(buf.get_i16())
}

#[inline]
pub fn get_i32(buf: &mut Bytes) -> PgResult<i32> {
    ensure(buf, 4, "int32")?;
    Ok(buf.get_i32())
}

/// Split off the next `n` bytes without copying.
pub fn get_bytes(buf: &mut Bytes, n: usize) -> PgResult<Bytes> {
    ensure(buf, n, "bytes")?;
    Ok(buf.split_to(n))
}

/// Read `n` bytes as a string, replacing invalid UTF-8.
pub fn get_string(buf: &mut Bytes, n: usize) -> PgResult<String> {
    let bytes = get_bytes(buf, n)?;
    Ok(to_string(&bytes))
}

/// Read a NUL-terminated string, consuming the terminator.
pub fn get_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::violation("missing null terminator in string"))?;

    let s = to_string(&buf[..end]);
    buf.advance(end + 1);
    Ok(s)
}

/// Take everything left in the buffer.
pub fn get_remaining(buf: &mut Bytes) -> Bytes {
    buf.split_to(buf.remaining())
}

// Try direct UTF-8 conversion first, fall back to lossy only if invalid.
fn to_string(bytes: &[u8]) -> String {
    std::str::from_utf8(bytes)
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cstring_roundtrip() {
        let mut buf = BytesMut::new();
        put_cstring(&mut buf, "user");
        put_cstring(&mut buf, "");
        put_cstring(&mut buf, "postgres");

        let mut bytes = buf.freeze();
        assert_eq!(get_cstring(&mut bytes).unwrap(), "user");
        assert_eq!(get_cstring(&mut bytes).unwrap(), "");
        assert_eq!(get_cstring(&mut bytes).unwrap(), "postgres");
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_missing_terminator_is_violation() {
        let mut bytes = Bytes::from_static(b"abc");
        let err = get_cstring(&mut bytes).unwrap_err();
        assert!(matches!(err, PgError::ProtocolViolation(_)));
    }

    #[test]
    fn test_short_reads_fail() {
        let mut bytes = Bytes::from_static(&[0, 1]);
        assert!(get_i32(&mut bytes).is_err());
        // Failed reads do not consume input.
        assert_eq!(get_i16(&mut bytes).unwrap(), 1);
        assert!(get_u8(&mut bytes).is_err());
    }

    #[test]
    fn test_length_prefixed() {
        let mut buf = BytesMut::new();
        put_length_prefixed(&mut buf, b"n,,n=user");

        let mut bytes = buf.freeze();
        let len = get_i32(&mut bytes).unwrap();
        assert_eq!(get_string(&mut bytes, len as usize).unwrap(), "n,,n=user");
    }
}
