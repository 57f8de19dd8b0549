//! Frame codecs.
//!
//! Text frames (WebSocket): one JSON object per frame.
//! Byte streams: 4-byte big-endian length prefix + JSON payload.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::ProtocolMessage;
use crate::{ProtocolError, MAX_MESSAGE_BYTES};

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Serialize one message as a text frame payload.
pub fn encode_text(message: &ProtocolMessage) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(message)?;
    if text.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::MessageTooLarge {
            size: text.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(text)
}

/// Parse one text frame payload.
pub fn decode_text(text: &str) -> Result<ProtocolMessage, ProtocolError> {
    if text.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::MessageTooLarge {
            size: text.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(serde_json::from_str(text)?)
}

/// Codec for framing `ProtocolMessage` values over a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = ProtocolMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_MESSAGE_BYTES {
            return Err(ProtocolError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_BYTES,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let payload = src.split_to(length);

        let message: ProtocolMessage = serde_json::from_slice(&payload)?;
        Ok(Some(message))
    }
}

impl Encoder<ProtocolMessage> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: ProtocolMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;

        if payload.len() > MAX_MESSAGE_BYTES {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_BYTES,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
