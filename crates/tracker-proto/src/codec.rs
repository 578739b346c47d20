//! Packet framing
//!
//! Frame format (big-endian):
//! ```text
//! +--------+------------+-------------+------+
//! | Type   | Request ID | Body Length | Body |
//! | i32    | u64        | i32         | var  |
//! +--------+------------+-------------+------+
//! ```

use crate::packet::{Packet, PacketType};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracker_common::{Error, Result};

/// Frame header size (type + request id + body length)
pub const HEADER_LEN: usize = 16;

/// Encoder/decoder for [`Packet`] frames
#[derive(Clone, Copy, Debug)]
pub struct PacketCodec {
    max_frame_bytes: usize,
}

impl PacketCodec {
    #[must_use]
    pub const fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    #[must_use]
    pub const fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Append one frame to `dst`
    pub fn encode(&self, packet: &Packet, dst: &mut BytesMut) -> Result<()> {
        let len = packet.body.len();
        if len > self.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                size: len,
                max: self.max_frame_bytes,
            });
        }
        let len = i32::try_from(len).map_err(|_| Error::FrameTooLarge {
            size: len,
            max: self.max_frame_bytes,
        })?;

        dst.reserve(HEADER_LEN + packet.body.len());
        dst.put_i32(packet.packet_type.0);
        dst.put_u64(packet.request_id);
        dst.put_i32(len);
        dst.put_slice(&packet.body);
        Ok(())
    }

    /// Take one complete frame off the front of `src`
    ///
    /// Returns `Ok(None)` while the frame is incomplete. A negative or
    /// oversized body length is a protocol error; the connection cannot be
    /// resynchronised after it.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let packet_type = header.get_i32();
        let request_id = header.get_u64();
        let body_len = header.get_i32();

        let body_len = usize::try_from(body_len)
            .map_err(|_| Error::malformed(format!("negative body length {body_len}")))?;
        if body_len > self.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                size: body_len,
                max: self.max_frame_bytes,
            });
        }

        if src.len() < HEADER_LEN + body_len {
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(body_len).freeze();
        Ok(Some(Packet {
            packet_type: PacketType(packet_type),
            request_id,
            body,
        }))
    }

    /// Write one frame to an async sink
    pub async fn write_packet<W>(&self, writer: &mut W, packet: &Packet) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + packet.body.len());
        self.encode(packet, &mut buf)?;
        writer.write_all(&buf).await?;
        Ok(())
    }
}

/// Reads frames from an async byte stream
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    codec: PacketCodec,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, codec: PacketCodec) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            codec,
        }
    }

    /// Next packet, or `None` on a clean end of stream
    pub async fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            if let Some(packet) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(packet));
            }

            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::malformed(format!(
                    "stream ended inside a frame ({} bytes pending)",
                    self.buf.len()
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn codec() -> PacketCodec {
        PacketCodec::new(1024)
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let packet = Packet::new(PacketType::MKDIR, 42, Bytes::from_static(b"payload"));
        let mut encoded = BytesMut::new();
        codec().encode(&packet, &mut encoded).unwrap();

        let mut partial = BytesMut::from(&encoded[..HEADER_LEN + 3]);
        assert!(codec().decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&encoded[HEADER_LEN + 3..]);
        let decoded = codec().decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_rejects_negative_length() {
        let mut buf = BytesMut::new();
        buf.put_i32(PacketType::MKDIR.0);
        buf.put_u64(1);
        buf.put_i32(-5);
        assert!(matches!(
            codec().decode(&mut buf),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_oversized_frames_rejected_both_ways() {
        let big = Packet::new(PacketType::MKDIR, 1, vec![0u8; 2048]);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec().encode(&big, &mut buf),
            Err(Error::FrameTooLarge { size: 2048, max: 1024 })
        ));

        let mut buf = BytesMut::new();
        buf.put_i32(PacketType::MKDIR.0);
        buf.put_u64(1);
        buf.put_i32(4096);
        assert!(matches!(
            codec().decode(&mut buf),
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_frame_reader_back_to_back_packets() {
        let codec = codec();
        let mut wire = Vec::new();
        for id in 0..3u64 {
            let packet = Packet::new(PacketType::STAT, id, vec![id as u8; id as usize]);
            codec.write_packet(&mut wire, &packet).await.unwrap();
        }

        let mut reader = FrameReader::new(wire.as_slice(), codec);
        for id in 0..3u64 {
            let packet = reader.next_packet().await.unwrap().unwrap();
            assert_eq!(packet.request_id, id);
            assert_eq!(packet.body.len(), id as usize);
        }
        assert!(reader.next_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_reader_truncated_stream() {
        let codec = codec();
        let mut wire = Vec::new();
        let packet = Packet::new(PacketType::STAT, 1, Bytes::from_static(b"abcdef"));
        codec.write_packet(&mut wire, &packet).await.unwrap();
        wire.truncate(wire.len() - 2);

        let mut reader = FrameReader::new(wire.as_slice(), codec);
        assert!(matches!(
            reader.next_packet().await,
            Err(Error::MalformedFrame(_))
        ));
    }
}
