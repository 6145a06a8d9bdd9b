//! Typed argument and reply values

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use strum::{Display as StrumDisplay, FromRepr};

use crate::error::ProtocolError;

/// An RGB color as used by the drawing blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const WHITE: Rgb = Rgb(0xff, 0xff, 0xff);
}

impl FromStr for Rgb {
    type Err = String;

    /// Parse `#rrggbb`; an empty string selects white
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Rgb::WHITE);
        }

        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(format!("expected a color like #ff0000, got '{s}'"));
        }

        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16).map_err(|_| format!("invalid color '{s}'"))
        };

        Ok(Rgb(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }
}

impl Display for Rgb {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

/// Wire tags of [Value] variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
enum Tag {
    Int = 0x01,
    Byte = 0x02,
    Text = 0x03,
    Color = 0x04,
    Bytes = 0x05,
    Float = 0x06,
}

/// A typed value carried in a command or reply
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Byte(u8),
    Text(String),
    Color(Rgb),
    Bytes(Vec<u8>),
    Float(f32),
}

impl Value {
    /// Append the tagged encoding of this value to `out`
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            Value::Int(value) => {
                out.push(Tag::Int as u8);
                out.extend_from_slice(&value.to_le_bytes());
            }
            Value::Byte(value) => {
                out.extend_from_slice(&[Tag::Byte as u8, *value]);
            }
            Value::Text(text) => {
                let len = u16::try_from(text.len()).map_err(|_| {
                    ProtocolError::MalformedPayload(format!(
                        "text of {} bytes does not fit a frame",
                        text.len()
                    ))
                })?;
                out.push(Tag::Text as u8);
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(text.as_bytes());
            }
            Value::Color(Rgb(r, g, b)) => {
                out.extend_from_slice(&[Tag::Color as u8, *r, *g, *b]);
            }
            Value::Bytes(bytes) => {
                let len = u32::try_from(bytes.len()).map_err(|_| {
                    ProtocolError::MalformedPayload("binary value too large".into())
                })?;
                out.push(Tag::Bytes as u8);
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(bytes);
            }
            Value::Float(value) => {
                out.push(Tag::Float as u8);
                out.extend_from_slice(&value.to_le_bytes());
            }
        }

        Ok(())
    }

    /// Decode one tagged value from the front of `input`, advancing it
    pub fn decode(input: &mut &[u8]) -> Result<Value, ProtocolError> {
        let tag = take(input, 1)?[0];
        let tag = Tag::from_repr(tag).ok_or_else(|| {
            ProtocolError::MalformedPayload(format!("unknown value tag {tag:#04x}"))
        })?;

        let value = match tag {
            Tag::Int => Value::Int(i32::from_le_bytes(take_array(input)?)),
            Tag::Byte => Value::Byte(take(input, 1)?[0]),
            Tag::Text => {
                let len = u16::from_le_bytes(take_array(input)?) as usize;
                let bytes = take(input, len)?;
                let text = std::str::from_utf8(bytes).map_err(|_| {
                    ProtocolError::MalformedPayload("text value is not valid UTF-8".into())
                })?;
                Value::Text(text.to_owned())
            }
            Tag::Color => {
                let [r, g, b] = take_array(input)?;
                Value::Color(Rgb(r, g, b))
            }
            Tag::Bytes => {
                let len = u32::from_le_bytes(take_array(input)?) as usize;
                Value::Bytes(take(input, len)?.to_vec())
            }
            Tag::Float => Value::Float(f32::from_le_bytes(take_array(input)?)),
        };

        Ok(value)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{value}"),
            Value::Byte(value) => write!(f, "{value}"),
            Value::Text(text) => write!(f, "{text:?}"),
            Value::Color(color) => write!(f, "{color}"),
            Value::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Value::Float(value) => write!(f, "{value}"),
        }
    }
}

fn take<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8], ProtocolError> {
    if input.len() < len {
        return Err(ProtocolError::MalformedPayload(format!(
            "expected {len} more bytes, {} left",
            input.len()
        )));
    }

    let (head, tail) = input.split_at(len);
    *input = tail;

    Ok(head)
}

fn take_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N], ProtocolError> {
    let mut array = [0u8; N];
    array.copy_from_slice(take(input, N)?);

    Ok(array)
}

/// Positional argument types accepted by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[strum(serialize_all = "lowercase")]
pub enum ArgType {
    /// Rotation in degrees
    Angle,
    /// Signed integer
    Number,
    /// Integer in `0..=255`
    Uint8,
    /// Free text
    Text,
    /// `#rrggbb` color
    Color,
}

impl ArgType {
    /// Whether `value` is acceptable for this argument type
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ArgType::Angle | ArgType::Number, Value::Int(_))
                | (ArgType::Uint8, Value::Byte(_))
                | (ArgType::Text, Value::Text(_))
                | (ArgType::Color, Value::Color(_))
        )
    }

    /// Parse a textual argument, as typed by a user or passed from a block
    pub fn parse(&self, input: &str) -> Result<Value, String> {
        let trimmed = input.trim();

        match self {
            ArgType::Angle | ArgType::Number => parse_int(trimmed).map(Value::Int),
            ArgType::Uint8 => {
                let value = parse_int(trimmed)?;
                u8::try_from(value)
                    .map(Value::Byte)
                    .map_err(|_| format!("{value} is outside 0..=255"))
            }
            ArgType::Text => Ok(Value::Text(input.to_owned())),
            ArgType::Color => trimmed.parse().map(Value::Color),
        }
    }
}

fn parse_int(input: &str) -> Result<i32, String> {
    // Block runtimes hand numbers over as decimal strings, possibly with a fraction
    if let Ok(value) = input.parse::<i32>() {
        return Ok(value);
    }

    match input.parse::<f64>() {
        Ok(value) if value.is_finite() && value.abs() <= i32::MAX as f64 => {
            Ok(value.round() as i32)
        }
        _ => Err(format!("'{input}' is not a number")),
    }
}
