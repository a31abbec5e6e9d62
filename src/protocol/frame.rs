//! Length-prefixed framing for the stream transport.
//!
//! # Wire Format
//!
//! ```text
//! ┌──────────────────────┬─────────────────────────┐
//! │ length (2 or 4 bytes)│ payload (length bytes)  │
//! │ big or little endian │                         │
//! └──────────────────────┴─────────────────────────┘
//! ```
//!
//! No magic number, version byte or checksum. The largest payload is
//! `min(max_msg_len, 2^(8 * width) - 1)`.

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::config::ConnectorParams;
use crate::error::{Error, Result};

// ============================================================================
// ByteOrder
// ============================================================================

/// Byte order of the length prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Most significant byte first (network order).
    #[default]
    Big,
    /// Least significant byte first.
    Little,
}

// ============================================================================
// HeaderWidth
// ============================================================================

/// Width of the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderWidth {
    /// 2-byte prefix, payloads up to 65535 bytes.
    Two,
    /// 4-byte prefix, payloads up to 4 GiB - 1.
    Four,
}

impl HeaderWidth {
    /// Parses a width given in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] unless `bytes` is 2 or 4.
    pub fn from_bytes(bytes: u8) -> Result<Self> {
        match bytes {
            2 => Ok(Self::Two),
            4 => Ok(Self::Four),
            other => Err(Error::config(format!(
                "message header width must be 2 or 4, got {other}"
            ))),
        }
    }

    /// Returns the prefix length in bytes.
    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        match self {
            Self::Two => 2,
            Self::Four => 4,
        }
    }

    /// Returns the largest length the prefix can encode.
    #[inline]
    #[must_use]
    pub const fn max_payload(self) -> u32 {
        match self {
            Self::Two => u16::MAX as u32,
            Self::Four => u32::MAX,
        }
    }
}

// ============================================================================
// FrameCodec
// ============================================================================

/// Encoder/decoder for length-prefixed frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    width: HeaderWidth,
    order: ByteOrder,
    max_len: u32,
}

impl FrameCodec {
    /// Creates a codec. `max_len` is clamped to what `width` can encode.
    #[must_use]
    pub fn new(width: HeaderWidth, order: ByteOrder, max_len: u32) -> Self {
        Self {
            width,
            order,
            max_len: max_len.min(width.max_payload()),
        }
    }

    /// Creates a codec from connector parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the header width is not 2 or 4.
    pub fn from_params(params: &ConnectorParams) -> Result<Self> {
        let width = HeaderWidth::from_bytes(params.header_width)?;
        Ok(Self::new(width, params.byte_order, params.max_msg_len))
    }

    /// Returns the header width.
    #[inline]
    #[must_use]
    pub const fn width(&self) -> HeaderWidth {
        self.width
    }

    /// Returns the byte order.
    #[inline]
    #[must_use]
    pub const fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Returns the effective maximum payload length.
    #[inline]
    #[must_use]
    pub const fn max_len(&self) -> u32 {
        self.max_len
    }

    /// Returns the length-prefix size in bytes.
    #[inline]
    #[must_use]
    pub const fn header_len(&self) -> usize {
        self.width.len()
    }

    /// Writes `len` into the first `header_len()` bytes of `dst`.
    pub fn encode_len(&self, len: u32, dst: &mut [u8]) {
        match (self.width, self.order) {
            (HeaderWidth::Two, ByteOrder::Big) => dst[..2].copy_from_slice(&(len as u16).to_be_bytes()),
            (HeaderWidth::Two, ByteOrder::Little) => {
                dst[..2].copy_from_slice(&(len as u16).to_le_bytes());
            }
            (HeaderWidth::Four, ByteOrder::Big) => dst[..4].copy_from_slice(&len.to_be_bytes()),
            (HeaderWidth::Four, ByteOrder::Little) => dst[..4].copy_from_slice(&len.to_le_bytes()),
        }
    }

    /// Reads a length from the first `header_len()` bytes of `src`.
    #[must_use]
    pub fn decode_len(&self, src: &[u8]) -> u32 {
        match (self.width, self.order) {
            (HeaderWidth::Two, ByteOrder::Big) => u32::from(u16::from_be_bytes([src[0], src[1]])),
            (HeaderWidth::Two, ByteOrder::Little) => u32::from(u16::from_le_bytes([src[0], src[1]])),
            (HeaderWidth::Four, ByteOrder::Big) => {
                u32::from_be_bytes([src[0], src[1], src[2], src[3]])
            }
            (HeaderWidth::Four, ByteOrder::Little) => {
                u32::from_le_bytes([src[0], src[1], src[2], src[3]])
            }
        }
    }

    /// Encodes `parts` as one frame.
    ///
    /// The parts are copied back to back after a single length prefix, so a
    /// message assembled from disjoint buffers needs no extra concatenation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLong`] if the parts add up to more than
    /// [`max_len`](Self::max_len).
    pub fn encode(&self, parts: &[&[u8]]) -> Result<Vec<u8>> {
        let total: usize = parts.iter().map(|part| part.len()).sum();
        let max = self.max_len as usize;
        if total > max {
            return Err(Error::message_too_long(total, max));
        }

        let header_len = self.header_len();
        let mut frame = vec![0u8; header_len + total];
        self.encode_len(total as u32, &mut frame);

        let mut offset = header_len;
        for part in parts {
            frame[offset..offset + part.len()].copy_from_slice(part);
            offset += part.len();
        }

        Ok(frame)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns the payload and the number of bytes consumed, or `None` if
    /// `buf` does not hold a complete frame yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLong`] if the prefix announces a payload
    /// above the maximum.
    pub fn decode<'a>(&self, buf: &'a [u8]) -> Result<Option<(&'a [u8], usize)>> {
        let header_len = self.header_len();
        if buf.len() < header_len {
            return Ok(None);
        }

        let len = self.decode_len(buf) as usize;
        if len > self.max_len as usize {
            return Err(Error::message_too_long(len, self.max_len as usize));
        }

        let end = header_len + len;
        if buf.len() < end {
            return Ok(None);
        }

        Ok(Some((&buf[header_len..end], end)))
    }

    /// Reads exactly one frame from `reader`.
    ///
    /// # Errors
    ///
    /// - [`Error::MessageTooLong`] if the prefix announces an oversized payload
    /// - [`Error::Io`] on any short read; no partial frame is returned
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let header_len = self.header_len();
        let mut header = [0u8; 4];
        reader.read_exact(&mut header[..header_len]).await?;

        let len = self.decode_len(&header) as usize;
        if len > self.max_len as usize {
            return Err(Error::message_too_long(len, self.max_len as usize));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        trace!(len, "Frame read");
        Ok(payload)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn codec(width: HeaderWidth, order: ByteOrder, max: u32) -> FrameCodec {
        FrameCodec::new(width, order, max)
    }

    #[test]
    fn test_header_width_from_bytes() {
        assert_eq!(HeaderWidth::from_bytes(2).unwrap(), HeaderWidth::Two);
        assert_eq!(HeaderWidth::from_bytes(4).unwrap(), HeaderWidth::Four);
        assert!(HeaderWidth::from_bytes(3).unwrap_err().is_config_error());
        assert!(HeaderWidth::from_bytes(0).is_err());
    }

    #[test]
    fn test_max_len_clamped_to_width() {
        let c = codec(HeaderWidth::Two, ByteOrder::Big, u32::MAX);
        assert_eq!(c.max_len(), 65535);

        let c = codec(HeaderWidth::Four, ByteOrder::Big, u32::MAX);
        assert_eq!(c.max_len(), u32::MAX);

        let c = codec(HeaderWidth::Four, ByteOrder::Big, 100);
        assert_eq!(c.max_len(), 100);
    }

    #[test]
    fn test_encode_hi_big_endian() {
        let c = codec(HeaderWidth::Two, ByteOrder::Big, 100);
        let frame = c.encode(&[b"hi"]).unwrap();
        assert_eq!(frame, vec![0x00, 0x02, 0x68, 0x69]);
    }

    #[test]
    fn test_encode_little_endian_four_bytes() {
        let c = codec(HeaderWidth::Four, ByteOrder::Little, 1024);
        let frame = c.encode(&[b"abc"]).unwrap();
        assert_eq!(frame, vec![0x03, 0x00, 0x00, 0x00, b'a', b'b', b'c']);
    }

    #[test]
    fn test_encode_multiple_parts() {
        let c = codec(HeaderWidth::Two, ByteOrder::Big, 100);
        let frame = c.encode(&[b"he", b"", b"llo"]).unwrap();
        assert_eq!(frame, b"\x00\x05hello".to_vec());
    }

    #[test]
    fn test_encode_too_long() {
        let c = codec(HeaderWidth::Two, ByteOrder::Big, 10);
        let err = c.encode(&[b"0123456789A"]).unwrap_err();
        assert!(matches!(err, Error::MessageTooLong { length: 11, max: 10 }));
    }

    #[test]
    fn test_encode_too_long_across_parts() {
        let c = codec(HeaderWidth::Two, ByteOrder::Big, 4);
        assert!(c.encode(&[b"abc", b"de"]).is_err());
        assert!(c.encode(&[b"ab", b"cd"]).is_ok());
    }

    #[test]
    fn test_encode_empty_payload() {
        let c = codec(HeaderWidth::Two, ByteOrder::Big, 10);
        assert_eq!(c.encode(&[]).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_decode_incomplete() {
        let c = codec(HeaderWidth::Two, ByteOrder::Big, 100);
        assert!(c.decode(&[0x00]).unwrap().is_none());
        assert!(c.decode(&[0x00, 0x02, 0x68]).unwrap().is_none());
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let c = codec(HeaderWidth::Two, ByteOrder::Big, 100);
        let (payload, used) = c.decode(&[0x00, 0x02, 0x68, 0x69, 0xff]).unwrap().unwrap();
        assert_eq!(payload, b"hi");
        assert_eq!(used, 4);
    }

    #[test]
    fn test_decode_too_long() {
        let c = codec(HeaderWidth::Two, ByteOrder::Big, 10);
        let err = c.decode(&[0x00, 0x0b]).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[tokio::test]
    async fn test_read_frame_sequence() {
        let c = codec(HeaderWidth::Two, ByteOrder::Little, 100);
        let mut wire: &[u8] = &[0x02, 0x00, b'h', b'i', 0x01, 0x00, b'!'];

        assert_eq!(c.read_frame(&mut wire).await.unwrap(), b"hi");
        assert_eq!(c.read_frame(&mut wire).await.unwrap(), b"!");
        assert!(matches!(c.read_frame(&mut wire).await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_read_frame_short_payload() {
        let c = codec(HeaderWidth::Two, ByteOrder::Big, 100);
        let mut wire: &[u8] = &[0x00, 0x05, b'a', b'b'];

        let err = c.read_frame(&mut wire).await.unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_read_frame_too_long() {
        let c = codec(HeaderWidth::Four, ByteOrder::Big, 8);
        let mut wire: &[u8] = &[0x00, 0x00, 0x00, 0x09];

        let err = c.read_frame(&mut wire).await.unwrap_err();
        assert!(matches!(err, Error::MessageTooLong { length: 9, max: 8 }));
    }

    fn width_strategy() -> impl Strategy<Value = HeaderWidth> {
        prop_oneof![Just(HeaderWidth::Two), Just(HeaderWidth::Four)]
    }

    fn order_strategy() -> impl Strategy<Value = ByteOrder> {
        prop_oneof![Just(ByteOrder::Big), Just(ByteOrder::Little)]
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            width in width_strategy(),
            order in order_strategy(),
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let c = FrameCodec::new(width, order, 4096);
            let frame = c.encode(&[&payload]).unwrap();
            prop_assert_eq!(frame.len(), c.header_len() + payload.len());

            let (decoded, used) = c.decode(&frame).unwrap().unwrap();
            prop_assert_eq!(decoded, payload.as_slice());
            prop_assert_eq!(used, frame.len());
        }

        #[test]
        fn prop_oversized_rejected(
            width in width_strategy(),
            order in order_strategy(),
            max in 0u32..256,
            extra in 1usize..64,
        ) {
            let c = FrameCodec::new(width, order, max);
            let payload = vec![0u8; max as usize + extra];
            let rejected = matches!(c.encode(&[&payload]), Err(Error::MessageTooLong { .. }));
            prop_assert!(rejected);
        }
    }
}
