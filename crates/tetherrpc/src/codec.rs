//! # Codec
//!
//! Translation between [`Value`] and the tetherpack wire format, plus the
//! pluggable [`ArgumentCodec`] used for call argument lists.
//!
//! ## Invariants
//! - **Recursion Safety**: nested values are bounded by `MAX_DEPTH`.
//! - **Type Strictness**: decoding against a concrete `ValueType` verifies wire
//!   tags; only `ValueType::Any` falls back to self-describing decoding.

use tetherpack::Decoder;
use tetherpack::Encoder;
use tetherpack::Tag;

use crate::error::Error;
use crate::error::Result;
use crate::message::ArgumentData;
use crate::value::Value;
use crate::value::ValueType;

/// The maximum nesting depth for values.
const MAX_DEPTH: usize = 64;

/// Encodes a value into the encoder stream.
pub fn encode_value(enc: &mut Encoder, value: &Value) -> Result<()> {
    encode_value_impl(enc, value, 0)
}

fn encode_value_impl(enc: &mut Encoder, value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(Error::ProtocolViolation("value nesting too deep".into()));
    }

    match value {
        Value::Unit => enc.unit()?,
        Value::Bool(v) => enc.bool(*v)?,
        Value::U64(v) => enc.u64(*v)?,
        Value::I64(v) => enc.s64(*v)?,
        Value::F64(v) => enc.f64(*v)?,
        Value::Str(v) => enc.str(v)?,
        Value::Bytes(v) => enc.bytes(v)?,
        Value::List(items) => {
            enc.list_begin()?;
            for item in items {
                encode_value_impl(enc, item, depth + 1)?;
            }
            enc.list_end()?;
        }
        Value::Option(None) => enc.option_none()?,
        Value::Option(Some(v)) => {
            enc.option_some_begin()?;
            encode_value_impl(enc, v, depth + 1)?;
            enc.option_some_end()?;
        }
    }
    Ok(())
}

/// Decodes one value, checking it against `ty`.
pub fn decode_value(dec: &mut Decoder, ty: &ValueType) -> Result<Value> {
    decode_value_impl(dec, ty, 0)
}

fn decode_value_impl(dec: &mut Decoder, ty: &ValueType, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(Error::ProtocolViolation("value nesting too deep".into()));
    }

    let tag = dec.peek_tag()?;
    let mismatch = || Error::TypeMismatch { expected: ty.to_string(), found: format!("{:?}", tag) };

    let value = match (ty, tag) {
        (ValueType::Any | ValueType::Unit, Tag::Unit) => { dec.unit()?; Value::Unit }
        (ValueType::Any | ValueType::Bool, Tag::BoolTrue | Tag::BoolFalse) => Value::Bool(dec.bool()?),
        (ValueType::Any | ValueType::U64, Tag::U64) => Value::U64(dec.u64()?),
        (ValueType::Any | ValueType::I64, Tag::S64) => Value::I64(dec.s64()?),
        (ValueType::Any | ValueType::F64, Tag::F64) => Value::F64(dec.f64()?),
        (ValueType::Any | ValueType::Str, Tag::String) => Value::Str(dec.str()?.to_string()),
        (ValueType::Any | ValueType::Bytes, Tag::Bytes) => Value::Bytes(dec.bytes()?.to_vec()),
        (ValueType::Any | ValueType::List(_), Tag::List) => {
            let inner = match ty {
                ValueType::List(inner) => inner.as_ref(),
                _ => &ValueType::Any,
            };
            let mut iter = dec.list()?;
            let mut items = Vec::new();
            while let Some(mut item) = iter.next()? {
                items.push(decode_value_impl(&mut item, inner, depth + 1)?);
            }
            Value::List(items)
        }
        (ValueType::Any | ValueType::Option(_), Tag::OptionNone | Tag::OptionSome) => {
            let inner = match ty {
                ValueType::Option(inner) => inner.as_ref(),
                _ => &ValueType::Any,
            };
            match dec.option()? {
                Some(mut payload) => Value::Option(Some(Box::new(decode_value_impl(&mut payload, inner, depth + 1)?))),
                None => Value::Option(None),
            }
        }
        _ => return Err(mismatch()),
    };
    Ok(value)
}

/// Encodes a list of values as a single tetherpack List.
pub fn encode_values(values: &[Value]) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    enc.list_begin()?;
    for value in values {
        encode_value(&mut enc, value)?;
    }
    enc.list_end()?;
    Ok(enc.into_bytes()?)
}

/// Decodes a List of values, one per expected type.
pub fn decode_values(bytes: &[u8], types: &[ValueType]) -> Result<Vec<Value>> {
    let mut dec = Decoder::new(bytes);
    let mut iter = dec.list()?;
    let mut values = Vec::with_capacity(types.len());

    for ty in types {
        let Some(mut item) = iter.next()? else {
            return Err(Error::ArgumentCount { expected: types.len(), found: values.len() });
        };
        values.push(decode_value(&mut item, ty)?);
    }

    if iter.next()?.is_some() {
        let mut found = types.len() + 1;
        while iter.next()?.is_some() {
            found += 1;
        }
        return Err(Error::ArgumentCount { expected: types.len(), found });
    }

    Ok(values)
}

/// Serializes and deserializes call argument lists.
///
/// Implementations are shared by every peer of a hub, so they must be stateless
/// or internally synchronized.
pub trait ArgumentCodec: Send + Sync + 'static {
    /// Serializes the arguments of an outbound call.
    fn serialize(&self, args: &[Value]) -> Result<ArgumentData>;

    /// Deserializes the arguments of an inbound call against the effective
    /// parameter types (declared types with header overrides applied).
    fn deserialize(&self, data: &ArgumentData, types: &[ValueType]) -> Result<Vec<Value>>;
}

/// The default binary codec: arguments are a tetherpack List.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackCodec;

impl ArgumentCodec for PackCodec {
    fn serialize(&self, args: &[Value]) -> Result<ArgumentData> {
        Ok(ArgumentData::Bytes(encode_values(args)?))
    }

    fn deserialize(&self, data: &ArgumentData, types: &[ValueType]) -> Result<Vec<Value>> {
        match data {
            ArgumentData::Bytes(bytes) => decode_values(bytes, types),
            ArgumentData::Text(_) => Err(Error::UnsupportedPayload("text")),
        }
    }
}
