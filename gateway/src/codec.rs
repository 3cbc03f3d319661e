//! Framing for the device wire protocol.
//!
//! Devices stream bare JSON objects with no length prefix. The decoder yields
//! exactly one object per call and leaves any following bytes buffered; the
//! encoder writes one object followed by a newline.

use crate::errors::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct JsonCodec {
    max_frame_len: usize,
}

impl JsonCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for JsonCodec {
    type Item = Value;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>> {
        match src.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => src.advance(start),
            None => {
                src.clear();
                return Ok(None);
            }
        }

        let (next, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&src[..]).into_iter::<Value>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            Some(Ok(value)) => {
                src.advance(consumed);
                if !value.is_object() {
                    return Err(Error::Protocol(format!(
                        "expected a JSON object, got {}",
                        value
                    )));
                }
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > self.max_frame_len {
                    return Err(Error::Protocol(format!(
                        "frame exceeds {} bytes",
                        self.max_frame_len
                    )));
                }
                Ok(None)
            }
            Some(Err(e)) => Err(Error::Json(e)),
            None => Ok(None),
        }
    }
}

impl<T> Encoder<T> for JsonCodec
where
    T: Serialize,
{
    type Error = Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        let bytes = serde_json::to_vec(&item)?;
        dst.reserve(bytes.len() + 1);
        dst.extend_from_slice(&bytes);
        dst.put_u8(b'\n');
        Ok(())
    }
}
