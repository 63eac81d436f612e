//! Envelope framing shared by every transport.
//!
//! An envelope travels as a single length-prefixed frame, so a payload can
//! never be confused with the length of another sender's payload:
//!
//! ```text
//! [u32 BE: len][u8 kind][u32 BE source][u32 BE tag][payload of len - 9]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{Rank, Tag};
use crate::error::{ProcessError, Result};

const HEADER_LEN: usize = 1 + 4 + 4;

/// What an envelope asks of its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Point-to-point message matched by `(source, tag)`.
    Message,
    /// Remote call dispatched to the handler registered for `tag`.
    RemoteCall,
}

impl EnvelopeKind {
    fn to_byte(self) -> u8 {
        match self {
            EnvelopeKind::Message => 0,
            EnvelopeKind::RemoteCall => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(EnvelopeKind::Message),
            1 => Ok(EnvelopeKind::RemoteCall),
            other => Err(ProcessError::Decode {
                message: format!("unknown envelope kind {}", other),
            }),
        }
    }
}

/// The unit every transport moves between ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub source: Rank,
    pub tag: Tag,
    pub payload: Bytes,
}

impl Envelope {
    pub fn message(source: Rank, tag: Tag, payload: Bytes) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            source,
            tag,
            payload,
        }
    }

    pub fn remote_call(source: Rank, tag: Tag, payload: Bytes) -> Self {
        Self {
            kind: EnvelopeKind::RemoteCall,
            source,
            tag,
            payload,
        }
    }

    /// Encode header and payload, without the outer length prefix.
    pub fn encode(&self) -> Result<Bytes> {
        let source = u32::try_from(self.source).map_err(|_| ProcessError::InvalidRank {
            rank: self.source,
            size: u32::MAX as usize,
        })?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind.to_byte());
        buf.put_u32(source);
        buf.put_u32(self.tag.0);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(ProcessError::Decode {
                message: format!("envelope of {} bytes is shorter than its header", data.len()),
            });
        }

        let kind = EnvelopeKind::from_byte(data.get_u8())?;
        let source = data.get_u32() as Rank;
        let tag = Tag(data.get_u32());
        Ok(Self {
            kind,
            source,
            tag,
            payload: data,
        })
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(ProcessError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| ProcessError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_layout() {
        let envelope = Envelope::remote_call(2, Tag::STREAM_EXECUTION, Bytes::from_static(b"abc"));
        let encoded = envelope.encode().unwrap();

        assert_eq!(encoded.len(), HEADER_LEN + 3);
        assert_eq!(encoded[0], 1);
        assert_eq!(&encoded[1..5], &2u32.to_be_bytes());
        assert_eq!(&encoded[5..9], &397529u32.to_be_bytes());
        assert_eq!(&encoded[9..], b"abc");

        assert_eq!(Envelope::decode(encoded).unwrap(), envelope);
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let envelope = Envelope::message(0, Tag::INFORMATION, Bytes::new());
        let decoded = Envelope::decode(envelope.encode().unwrap()).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.kind, EnvelopeKind::Message);
    }

    #[test]
    fn test_decode_rejects_short_or_unknown() {
        assert!(Envelope::decode(Bytes::from_static(&[0, 0, 0])).is_err());
        assert!(Envelope::decode(Bytes::from_static(&[7, 0, 0, 0, 0, 0, 0, 0, 1])).is_err());
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor, 1024).await.unwrap();

        assert_eq!(read_back, Some(payload.to_vec()));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor, 1024).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1025u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor, 1024).await;
        assert!(matches!(
            result,
            Err(ProcessError::FrameTooLarge {
                size: 1025,
                max: 1024
            })
        ));
    }
}
