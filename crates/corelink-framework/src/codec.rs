//! Wire formats and stream decoding.
//!
//! Sessions carry a plain concatenation of encoded messages. Both formats
//! are self-delimiting, so the receive side decodes as many complete
//! messages as the pending buffer holds and keeps the remainder.
use crate::{FrameworkError, Message};

/// Encoding used on sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON objects, one after another.
    #[default]
    Json,
    /// MessagePack maps with named fields.
    MessagePack,
}

/// Result of decoding a pending buffer.
#[derive(Debug, Default)]
pub struct Decoded {
    /// Complete messages, in stream order.
    pub messages: Vec<Message>,
    /// Bytes consumed by `messages`; the rest is an incomplete tail.
    pub consumed: usize,
    /// The tail can never become a valid message and should be dropped.
    pub corrupt: bool,
}

impl WireFormat {
    /// Encode one message. Fails on non-finite float parameters in
    /// either format.
    pub fn encode(self, message: &Message) -> Result<Vec<u8>, FrameworkError> {
        match self {
            WireFormat::Json => message.serialize(),
            WireFormat::MessagePack => {
                message.ensure_encodable()?;
                Ok(rmp_serde::to_vec_named(message)?)
            }
        }
    }

    /// Decode exactly one message occupying the whole of `data`.
    pub fn decode(self, data: &[u8]) -> Result<Message, FrameworkError> {
        match self {
            WireFormat::Json => Message::parse(data),
            WireFormat::MessagePack => Ok(rmp_serde::from_slice(data)?),
        }
    }

    /// Decode every complete message at the front of `buf`.
    pub fn decode_stream(self, buf: &[u8]) -> Decoded {
        match self {
            WireFormat::Json => decode_json_stream(buf),
            WireFormat::MessagePack => decode_msgpack_stream(buf),
        }
    }
}

fn decode_json_stream(buf: &[u8]) -> Decoded {
    let mut decoded = Decoded::default();
    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Message>();
    loop {
        match stream.next() {
            Some(Ok(message)) => {
                decoded.messages.push(message);
                decoded.consumed = stream.byte_offset();
            }
            Some(Err(e)) if e.is_eof() => break,
            Some(Err(e)) => {
                tracing::debug!("codec: corrupt json after {} bytes: {e}", decoded.consumed);
                decoded.corrupt = true;
                break;
            }
            None => {
                // Only whitespace left.
                decoded.consumed = buf.len();
                break;
            }
        }
    }
    decoded
}

fn decode_msgpack_stream(buf: &[u8]) -> Decoded {
    use rmp_serde::decode::Error;
    use serde::Deserialize;

    let mut decoded = Decoded::default();
    while decoded.consumed < buf.len() {
        let mut rest = &buf[decoded.consumed..];
        let before = rest.len();
        let result = {
            let mut de = rmp_serde::Deserializer::new(&mut rest);
            Message::deserialize(&mut de)
        };
        match result {
            Ok(message) => {
                decoded.messages.push(message);
                decoded.consumed += before - rest.len();
            }
            Err(Error::InvalidMarkerRead(ref e) | Error::InvalidDataRead(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => {
                tracing::debug!("codec: corrupt msgpack after {} bytes: {e}", decoded.consumed);
                decoded.corrupt = true;
                break;
            }
        }
    }
    decoded
}
