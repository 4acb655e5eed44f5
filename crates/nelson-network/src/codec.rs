//! Peer-link codec for message framing.
//!
//! Frame format:
//!
//! ```text
//! +----------+----------+----------+----------+
//! |  Magic   |   Type   |  Length  | Checksum |
//! | 4 bytes  | 1 byte   | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+
//! |                 Payload                   |
//! |              (Length bytes)               |
//! +-------------------------------------------+
//! ```
//!
//! - Magic: network identifier
//! - Type: message type id
//! - Length: payload length in bytes (big-endian)
//! - Checksum: first 4 bytes of Blake2b256(payload)
//! - Payload: JSON message body

use crate::{Message, MessageType, NetworkError, MAGIC, MAX_MESSAGE_SIZE};
use blake2::{Blake2b, Digest};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Header size: magic (4) + type (1) + length (4) + checksum (4) = 13 bytes
const HEADER_SIZE: usize = 13;

/// Framing codec for peer-link messages.
pub struct LinkCodec {
    magic: [u8; 4],
    max_size: usize,
}

impl LinkCodec {
    /// Create a new codec with the default magic.
    pub fn new() -> Self {
        Self {
            magic: MAGIC,
            max_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Create a codec with custom magic bytes.
    pub fn with_magic(magic: [u8; 4]) -> Self {
        Self {
            magic,
            max_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Checksum for a payload (first 4 bytes of Blake2b256).
    fn checksum(payload: &[u8]) -> [u8; 4] {
        let hash = Blake2b::<typenum::U32>::digest(payload);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&hash[0..4]);
        checksum
    }

    fn verify_checksum(payload: &[u8], expected: &[u8; 4]) -> bool {
        Self::checksum(payload) == *expected
    }
}

impl Default for LinkCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LinkCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = &src[0..4];
        if magic != self.magic {
            return Err(NetworkError::MagicMismatch);
        }

        let type_byte = src[4];
        let length = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
        let checksum: [u8; 4] = [src[9], src[10], src[11], src[12]];

        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let total_size = HEADER_SIZE + length;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        if !Self::verify_checksum(&payload, &checksum) {
            return Err(NetworkError::InvalidMessage(
                "Checksum mismatch".to_string(),
            ));
        }

        let kind = MessageType::from_byte(type_byte).ok_or_else(|| {
            NetworkError::InvalidMessage(format!("Unknown message type: {}", type_byte))
        })?;

        Ok(Some(Message::decode_payload(kind, &payload)?))
    }
}

impl Encoder<Message> for LinkCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.encode_payload()?;
        let length = payload.len();

        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let checksum = Self::checksum(&payload);

        dst.reserve(HEADER_SIZE + length);
        dst.put_slice(&self.magic);
        dst.put_u8(item.message_type() as u8);
        dst.put_u32(length as u32);
        dst.put_slice(&checksum);
        dst.put_slice(&payload);

        Ok(())
    }
}
