//! Command encoding and frame codecs.
//!
//! Commands serialize to compact JSON. Every frame on the wire is length
//! delimited (4-byte big-endian prefix) via LengthDelimitedCodec; command
//! channel frames additionally carry a request id header.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{CommandMessage, RequestId};
use crate::error::ChannelError;

/// Upper bound for a single frame. Anything larger is treated as corruption.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LENGTH_FIELD_LEN: usize = 4;
const REQUEST_ID_LEN: usize = 4;

/// Serialize a command for the wire.
pub fn encode(message: &CommandMessage) -> Result<Bytes, ChannelError> {
    if message.name().is_empty() {
        return Err(ChannelError::encode("command name is empty"));
    }
    let json = serde_json::to_vec(message).map_err(|e| ChannelError::encode(e.to_string()))?;
    tracing::trace!(command = message.name(), json_size_bytes = json.len(), "Encoded command");
    Ok(Bytes::from(json))
}

/// Parse a command from its wire form.
pub fn decode(bytes: &[u8]) -> Result<CommandMessage, ChannelError> {
    let message: CommandMessage =
        serde_json::from_slice(bytes).map_err(|e| ChannelError::decode(e.to_string()))?;
    if message.name().is_empty() {
        return Err(ChannelError::decode("command name is empty"));
    }
    Ok(message)
}

/// Length-delimited framing shared by every endpoint.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_FIELD_LEN)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Frames `(RequestId, payload)` pairs for the command channel.
///
/// Used on both ends: the controller writes requests and reads replies, the
/// agent does the opposite.
pub struct EnvelopeCodec {
    inner: LengthDelimitedCodec,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            inner: frame_codec(),
        }
    }

    /// Bytes an encoded frame occupies on the wire for a payload of `payload_len`.
    pub const fn frame_len(payload_len: usize) -> usize {
        LENGTH_FIELD_LEN + REQUEST_ID_LEN + payload_len
    }
}

impl Decoder for EnvelopeCodec {
    type Item = (RequestId, Bytes);
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(mut frame) => {
                if frame.len() < REQUEST_ID_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "frame of {} bytes is shorter than the request id header",
                            frame.len()
                        ),
                    ));
                }
                let id = RequestId::new(frame.get_u32());
                Ok(Some((id, frame.freeze())))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<(RequestId, Bytes)> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: (RequestId, Bytes), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (id, payload) = item;
        let mut frame = BytesMut::with_capacity(REQUEST_ID_LEN + payload.len());
        frame.put_u32(id.get());
        frame.put_slice(&payload);
        self.inner.encode(frame.freeze(), dst)
    }
}
