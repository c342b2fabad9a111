//! Frame Protocol
//!
//! Length-prefixed JSON with a CRC32 of the payload.
//!
//! ```text
//! +----------------+----------------+------------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (Length bytes)  |
//! | big-endian u32 | big-endian u32 | Request or Response          |
//! +----------------+----------------+------------------------------+
//! ```
//!
//! Descriptors attached by the connection wrapper travel with individual
//! bytes of a frame; the frame layer never sees them.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;

/// Largest accepted payload (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

const HEADER_SIZE: usize = 8;

const READ_CHUNK: usize = 8192;

/// Serialize `msg` into one frame
///
/// # Errors
///
/// Returns [`TransportError::SerializationError`] if serialization fails or
/// the payload exceeds [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let payload =
        serde_json::to_vec(msg).map_err(|e| TransportError::SerializationError(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::SerializationError(format!(
            "frame of {} bytes exceeds maximum {MAX_FRAME_SIZE}",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reassembles frames from arbitrary read chunks
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the connection
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete frame, if one is buffered
    ///
    /// # Errors
    ///
    /// Returns an error for oversized frames, checksum mismatches, and
    /// payloads that do not deserialize as `T`. The offending frame is
    /// consumed so a caller may keep reading.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        let Some(header) = self.buffer.get(..HEADER_SIZE) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        if len > MAX_FRAME_SIZE {
            self.buffer.clear();
            return Err(TransportError::SerializationError(format!(
                "frame of {len} bytes exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }
        if self.buffer.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buffer.drain(..HEADER_SIZE + len).collect();
        let payload = &frame[HEADER_SIZE..];

        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }

        serde_json::from_slice(payload)
            .map(Some)
            .map_err(|e| TransportError::SerializationError(e.to_string()))
    }
}

/// Encode `msg` and write it in full
pub(crate) async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let frame = encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read until one frame decodes
///
/// Returns `Ok(None)` on a clean end of stream between frames.
pub(crate) async fn read_frame<R, T>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(msg) = decoder.decode()? {
            return Ok(Some(msg));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if decoder.buffered() == 0 {
                return Ok(None);
            }
            return Err(TransportError::ConnectionClosed);
        }
        decoder.push(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Request, Response};
    use pretty_assertions::assert_eq;

    fn request(id: u64) -> Request {
        Request {
            id,
            method: "open".into(),
            metadata: Default::default(),
            body: serde_json::json!({"path": "/tmp/x"}),
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let frame = encode(&request(1)).unwrap();
        let mut decoder = FrameDecoder::new();
        for (i, byte) in frame.iter().enumerate() {
            let out: Option<Request> = decoder.decode().unwrap();
            assert!(out.is_none(), "decoded early at byte {i}");
            decoder.push(std::slice::from_ref(byte));
        }
        assert_eq!(decoder.decode::<Request>().unwrap(), Some(request(1)));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut bytes = encode(&request(1)).unwrap();
        bytes.extend(encode(&request(2)).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let ids: Vec<u64> = std::iter::from_fn(|| decoder.decode::<Request>().unwrap())
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_corrupted_payload_detected_and_skipped() {
        let mut bad = encode(&request(1)).unwrap();
        let last = bad.len() - 2;
        bad[last] ^= 0xff;
        bad.extend(encode(&request(2)).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&bad);
        assert!(matches!(
            decoder.decode::<Request>(),
            Err(TransportError::ChecksumMismatch { .. })
        ));
        assert_eq!(decoder.decode::<Request>().unwrap().unwrap().id, 2);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        decoder.push(&[0; 4]);
        assert!(matches!(
            decoder.decode::<Request>(),
            Err(TransportError::SerializationError(_))
        ));
    }

    #[test]
    fn test_wrong_message_type() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&encode(&request(1)).unwrap());
        assert!(matches!(
            decoder.decode::<Response>(),
            Err(TransportError::SerializationError(_))
        ));
    }

    #[tokio::test]
    async fn test_read_write_over_stream() {
        let (mut a, mut b) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            write_frame(&mut a, &request(7)).await.unwrap();
            write_frame(&mut a, &request(8)).await.unwrap();
        });

        let mut decoder = FrameDecoder::new();
        let first: Request = read_frame(&mut b, &mut decoder).await.unwrap().unwrap();
        let second: Request = read_frame(&mut b, &mut decoder).await.unwrap().unwrap();
        writer.await.unwrap();

        assert_eq!((first.id, second.id), (7, 8));
        let end: Option<Request> = read_frame(&mut b, &mut decoder).await.unwrap();
        assert!(end.is_none());
    }
}
