//! Modbus wire encoding of the telemetry values.
//!
//! All values handled by the collector occupy two consecutive holding
//! registers. The first register carries the most significant word and each
//! register is transmitted most significant byte first (big-endian byte and
//! word order).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The default Modbus/TCP port.
pub const DEFAULT_PORT: u16 = 502;

/// The number of 16-bit registers occupied by every supported wire type.
pub const WORDS_PER_VALUE: u16 = 2;

/// The binary encoding of a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireType {
    /// IEEE-754 single precision float.
    Float32,
    /// Unsigned 32-bit integer.
    Uint32,
    /// Two's-complement signed 32-bit integer.
    Int32,
}

impl WireType {
    /// Number of holding registers a value of this type occupies.
    pub fn word_count(&self) -> u16 {
        match self {
            WireType::Float32 | WireType::Uint32 | WireType::Int32 => WORDS_PER_VALUE,
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WireType::Float32 => "float32",
            WireType::Uint32 => "uint32",
            WireType::Int32 => "int32",
        };
        f.write_str(name)
    }
}

/// A decoded register value before any unit conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue {
    Float32(f32),
    Uint32(u32),
    Int32(i32),
}

impl RawValue {
    /// Widens the value to `f64` without loss.
    pub fn as_f64(&self) -> f64 {
        match *self {
            RawValue::Float32(v) => v as f64,
            RawValue::Uint32(v) => v as f64,
            RawValue::Int32(v) => v as f64,
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Float32(v) => write!(f, "{v}"),
            RawValue::Uint32(v) => write!(f, "{v}"),
            RawValue::Int32(v) => write!(f, "{v}"),
        }
    }
}

fn join_words(words: &[u16]) -> u32 {
    ((words[0] as u32) << 16) | words[1] as u32
}

/// Decodes raw holding register words into a typed value.
///
/// The words are reinterpreted bit for bit. Fails with
/// [`Error::MalformedPayload`] if `words` does not hold exactly the number of
/// registers the wire type occupies.
pub fn decode(words: &[u16], wire_type: WireType) -> Result<RawValue> {
    let expected = wire_type.word_count() as usize;
    if words.len() != expected {
        return Err(Error::MalformedPayload {
            expected,
            actual: words.len(),
        });
    }
    let bits = join_words(words);
    Ok(match wire_type {
        WireType::Float32 => RawValue::Float32(f32::from_bits(bits)),
        WireType::Uint32 => RawValue::Uint32(bits),
        WireType::Int32 => RawValue::Int32(bits as i32),
    })
}

/// Encodes a value into holding register words, the inverse of [`decode`].
///
/// Used to build register images for simulated servers.
pub fn encode(value: RawValue) -> [u16; 2] {
    let bits = match value {
        RawValue::Float32(v) => v.to_bits(),
        RawValue::Uint32(v) => v,
        RawValue::Int32(v) => v as u32,
    };
    [(bits >> 16) as u16, bits as u16]
}
