//! # Message Frames
//!
//! Encodes a [`Message`] as a tetherpack `Msg` variant wrapping a map:
//!
//! ```text
//! Msg { kind: u8, id: s64, service: str, method: str,
//!       args: text(str) | bytes(bytes), headers: [[name, value], ...] }
//! ```
//!
//! ## Invariants
//! - **Panic Safety**: decoding returns `Result` on any malformed input.
//! - **Forward Compatibility**: unknown map keys are skipped.
//! - Header order survives the round trip.

use tetherpack::Decoder;
use tetherpack::Encoder;

use crate::error::Error;
use crate::error::Result;
use crate::message::ArgumentData;
use crate::message::Header;
use crate::message::Message;
use crate::message::MethodRef;

/// Encodes a message into a standalone frame.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    enc.variant_begin("Msg")?;
    enc.map_begin()?;

    enc.variant_begin("kind")?;
    enc.u8(msg.call_kind)?;
    enc.variant_end()?;

    enc.variant_begin("id")?;
    enc.s64(msg.related_id)?;
    enc.variant_end()?;

    write_map_str(&mut enc, "service", &msg.method.service)?;
    write_map_str(&mut enc, "method", &msg.method.method)?;

    enc.variant_begin("args")?;
    match &msg.argument_data {
        ArgumentData::Text(text) => write_map_str(&mut enc, "text", text)?,
        ArgumentData::Bytes(bytes) => {
            enc.variant_begin("bytes")?;
            enc.bytes(bytes)?;
            enc.variant_end()?;
        }
    }
    enc.variant_end()?;

    if !msg.headers.is_empty() {
        enc.variant_begin("headers")?;
        enc.list_begin()?;
        for header in &msg.headers {
            enc.list_begin()?;
            enc.str(&header.name)?;
            enc.str(&header.value)?;
            enc.list_end()?;
        }
        enc.list_end()?;
        enc.variant_end()?;
    }

    enc.map_end()?;
    enc.variant_end()?;
    Ok(enc.into_bytes()?)
}

/// Decodes a frame produced by [`encode_message`].
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    let mut dec = Decoder::new(bytes);
    let (frame_type, mut body) = dec.variant()?;
    if frame_type != "Msg" {
        return Err(Error::ProtocolViolation(format!("Unknown frame type: {}", frame_type)));
    }

    let mut map = body.map()?;
    let mut kind = None;
    let mut id = None;
    let mut service = None;
    let mut method = None;
    let mut args = None;
    let mut headers = Vec::new();

    while let Some((key, mut val)) = map.next()? {
        match key {
            "kind" => kind = Some(val.u8()?),
            "id" => id = Some(val.s64()?),
            "service" => service = Some(val.str()?.to_string()),
            "method" => method = Some(val.str()?.to_string()),
            "args" => {
                let (payload_kind, mut payload) = val.variant()?;
                args = Some(match payload_kind {
                    "text" => ArgumentData::Text(payload.str()?.to_string()),
                    "bytes" => ArgumentData::Bytes(payload.bytes()?.to_vec()),
                    other => return Err(Error::ProtocolViolation(format!("Unknown argument payload: {}", other))),
                });
            }
            "headers" => {
                let mut list = val.list()?;
                while let Some(mut pair) = list.next()? {
                    let mut fields = pair.list()?;
                    let name = next_str(&mut fields, "header name")?;
                    let value = next_str(&mut fields, "header value")?;
                    headers.push(Header::new(name, value));
                }
            }
            _ => val.skip()?,
        }
    }

    let missing = |field: &str| Error::ProtocolViolation(format!("Missing {}", field));
    Ok(Message::new(
        kind.ok_or_else(|| missing("kind"))?,
        id.ok_or_else(|| missing("id"))?,
        MethodRef::new(service.ok_or_else(|| missing("service"))?, method.ok_or_else(|| missing("method"))?),
        args.ok_or_else(|| missing("args"))?,
        headers,
    ))
}

fn next_str(fields: &mut tetherpack::ListIter<'_>, what: &str) -> Result<String> {
    let mut item = fields
        .next()?
        .ok_or_else(|| Error::ProtocolViolation(format!("Missing {}", what)))?;
    Ok(item.str()?.to_string())
}

fn write_map_str(enc: &mut Encoder, key: &str, val: &str) -> Result<()> {
    enc.variant_begin(key)?;
    enc.str(val)?;
    enc.variant_end()?;
    Ok(())
}
