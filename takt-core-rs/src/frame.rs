//! Record framing for standalone payloads (sockets, datagrams)
//!
//! ```text
//! +---------------+------------------+-----------+--------------+
//! | 0xAACF (2B BE)| length (4B BE)   | payload   | ',' sentinel |
//! +---------------+------------------+-----------+--------------+
//! ```
//!
//! A bad magic or sentinel means the record is corrupt or truncated and is
//! rejected. Resynchronising a stream is left to the caller.

use crate::error::{CodecError, ConnectionError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame magic constant
pub const MAGIC: u16 = 0xAACF;

/// Trailing sentinel byte
pub const SENTINEL: u8 = b',';

/// Magic + length
pub const FRAME_HEADER_SIZE: usize = 6;

/// Default maximum payload size (16 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Wrap a payload into a frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + 1);
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.push(SENTINEL);
    out
}

/// Parse one frame from the start of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame, and
/// `Ok(Some((payload, consumed)))` otherwise.
pub fn decode_frame(buf: &[u8], max_size: usize) -> Result<Option<(&[u8], usize)>, CodecError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let magic = u16::from_be_bytes([buf[0], buf[1]]);
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
    if len > max_size {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let end = FRAME_HEADER_SIZE + len;
    if buf.len() <= end {
        return Ok(None);
    }
    if buf[end] != SENTINEL {
        return Err(CodecError::BadSentinel(buf[end]));
    }

    Ok(Some((&buf[FRAME_HEADER_SIZE..end], end + 1)))
}

/// Parse a datagram that must hold exactly one complete frame.
pub fn decode_datagram(buf: &[u8], max_size: usize) -> Result<&[u8], CodecError> {
    match decode_frame(buf, max_size)? {
        Some((payload, _)) => Ok(payload),
        None => Err(CodecError::Truncated(buf.len())),
    }
}

/// Read one frame from a stream.
///
/// Returns `Ok(None)` if the peer closed the stream cleanly before a new
/// frame started.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let magic = match reader.read_u16().await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic).into());
    }

    let len = reader.read_u32().await? as usize;
    if len > max_size {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: max_size,
        }
        .into());
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let sentinel = reader.read_u8().await?;
    if sentinel != SENTINEL {
        return Err(CodecError::BadSentinel(sentinel).into());
    }

    Ok(Some(payload))
}

/// Write one frame to a stream and flush it.
///
/// A payload over `max_size` is refused before anything is written, so the
/// stream stays usable.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_size: usize) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_size {
        return Err(CodecError::FrameTooLarge {
            size: payload.len(),
            max: max_size,
        }
        .into());
    }
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(b"abc");
        assert_eq!(frame, vec![0xAA, 0xCF, 0, 0, 0, 3, b'a', b'b', b'c', b',']);

        let (payload, used) = decode_frame(&frame, DEFAULT_MAX_FRAME_SIZE).unwrap().unwrap();
        assert_eq!(payload, b"abc");
        assert_eq!(used, frame.len());
    }

    #[test]
    fn test_corrupt_magic_rejected() {
        let mut frame = encode_frame(b"payload");
        frame[1] = 0x00;
        assert!(matches!(
            decode_frame(&frame, DEFAULT_MAX_FRAME_SIZE),
            Err(CodecError::BadMagic(0xAA00))
        ));
    }

    #[test]
    fn test_corrupt_sentinel_rejected() {
        let mut frame = encode_frame(b"payload");
        let last = frame.len() - 1;
        frame[last] = b';';
        assert!(matches!(
            decode_frame(&frame, DEFAULT_MAX_FRAME_SIZE),
            Err(CodecError::BadSentinel(b';'))
        ));
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let frame = encode_frame(b"payload");
        for cut in 0..frame.len() {
            assert!(decode_frame(&frame[..cut], DEFAULT_MAX_FRAME_SIZE).unwrap().is_none());
        }
        assert!(decode_datagram(&frame[..4], DEFAULT_MAX_FRAME_SIZE).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let frame = encode_frame(&[0u8; 64]);
        assert!(matches!(
            decode_frame(&frame, 16),
            Err(CodecError::FrameTooLarge { size: 64, max: 16 })
        ));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut stream = encode_frame(b"one");
        stream.extend(encode_frame(b"two"));

        let (first, used) = decode_frame(&stream, 1024).unwrap().unwrap();
        assert_eq!(first, b"one");
        let (second, _) = decode_frame(&stream[used..], 1024).unwrap().unwrap();
        assert_eq!(second, b"two");
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, b"hello", DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        write_frame(&mut a, b"", DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b, 1024).await.unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut b, 1024).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut b, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_write_refused() {
        let (mut a, mut b) = tokio::io::duplex(256);
        assert!(matches!(
            write_frame(&mut a, &[7u8; 64], 16).await,
            Err(ConnectionError::Codec(CodecError::FrameTooLarge { size: 64, max: 16 }))
        ));

        // nothing reached the peer; the next frame is intact
        write_frame(&mut a, b"ok", 16).await.unwrap();
        assert_eq!(read_frame(&mut b, 16).await.unwrap().unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_stream_bad_sentinel() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let mut frame = encode_frame(b"x");
        let last = frame.len() - 1;
        frame[last] = 0;
        a.write_all(&frame).await.unwrap();

        assert!(matches!(
            read_frame(&mut b, 1024).await,
            Err(ConnectionError::Codec(CodecError::BadSentinel(0)))
        ));
    }
}
