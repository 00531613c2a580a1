//! Typed patch options and the values they carry.

use std::collections::HashMap;
use std::str::FromStr;

use serde_json::{Map, Value};
use strum::{Display, EnumString, IntoStaticStr};
use tracing::warn;

use crate::error::{Error, Result};
use crate::memory::ReadMemory;

/// A typed value embedded into patched memory
#[derive(Debug, Clone, PartialEq)]
pub enum PatchValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    /// Raw bytes, terminator included
    String(Vec<u8>),
}

impl PatchValue {
    pub fn size(&self) -> usize {
        match self {
            Self::I8(_) | Self::U8(_) => 1,
            Self::I16(_) | Self::U16(_) => 2,
            Self::I32(_) | Self::U32(_) | Self::F32(_) => 4,
            Self::I64(_) | Self::U64(_) | Self::F64(_) => 8,
            Self::String(bytes) => bytes.len(),
        }
    }

    /// Little-endian memory representation
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::I8(v) => v.to_le_bytes().to_vec(),
            Self::U8(v) => v.to_le_bytes().to_vec(),
            Self::I16(v) => v.to_le_bytes().to_vec(),
            Self::U16(v) => v.to_le_bytes().to_vec(),
            Self::I32(v) => v.to_le_bytes().to_vec(),
            Self::U32(v) => v.to_le_bytes().to_vec(),
            Self::I64(v) => v.to_le_bytes().to_vec(),
            Self::U64(v) => v.to_le_bytes().to_vec(),
            Self::F32(v) => v.to_le_bytes().to_vec(),
            Self::F64(v) => v.to_le_bytes().to_vec(),
            Self::String(bytes) => bytes.clone(),
        }
    }

    /// Value as seen by expressions: integers are truncated or sign-extended to
    /// 32 bits, floats are truncated toward zero, strings have no value.
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::I8(v) => *v as i32 as u32,
            Self::U8(v) => *v as u32,
            Self::I16(v) => *v as i32 as u32,
            Self::U16(v) => *v as u32,
            Self::I32(v) => *v as u32,
            Self::U32(v) => *v,
            Self::I64(v) => *v as u32,
            Self::U64(v) => *v as u32,
            Self::F32(v) => *v as i64 as u32,
            Self::F64(v) => *v as i64 as u32,
            Self::String(_) => 0,
        }
    }
}

/// Width of a value read from or written to memory
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum ValueWidth {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl ValueWidth {
    pub fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32)
    }

    /// Convert an expression result into a value of this width.
    /// Float widths convert the integer numerically.
    pub fn from_u32(self, value: u32) -> PatchValue {
        match self {
            Self::I8 => PatchValue::I8(value as i8),
            Self::U8 => PatchValue::U8(value as u8),
            Self::I16 => PatchValue::I16(value as i16),
            Self::U16 => PatchValue::U16(value as u16),
            Self::I32 => PatchValue::I32(value as i32),
            Self::U32 => PatchValue::U32(value),
            Self::F32 => PatchValue::F32(value as i32 as f32),
            Self::F64 => PatchValue::F64(value as i32 as f64),
        }
    }

    /// Read a value of this width from memory
    pub fn read(self, memory: &dyn ReadMemory, address: u32) -> Result<PatchValue> {
        let bytes = memory.read_bytes(address, self.size())?;
        Ok(self.decode(&bytes))
    }

    /// Decode little-endian bytes; missing high bytes read as zero
    pub fn decode(self, bytes: &[u8]) -> PatchValue {
        let mut buf = [0u8; 8];
        let len = bytes.len().min(8);
        buf[..len].copy_from_slice(&bytes[..len]);
        match self {
            Self::I8 => PatchValue::I8(buf[0] as i8),
            Self::U8 => PatchValue::U8(buf[0]),
            Self::I16 => PatchValue::I16(i16::from_le_bytes([buf[0], buf[1]])),
            Self::U16 => PatchValue::U16(u16::from_le_bytes([buf[0], buf[1]])),
            Self::I32 => PatchValue::I32(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            Self::U32 => PatchValue::U32(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            Self::F32 => PatchValue::F32(f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            Self::F64 => PatchValue::F64(f64::from_le_bytes(buf)),
        }
    }
}

/// Option type names accepted in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
enum OptionType {
    #[strum(serialize = "i8")]
    I8,
    #[strum(serialize = "u8", serialize = "b")]
    U8,
    #[strum(serialize = "i16")]
    I16,
    #[strum(serialize = "u16", serialize = "w")]
    U16,
    #[strum(serialize = "i32", serialize = "i")]
    I32,
    #[strum(serialize = "u32", serialize = "d")]
    U32,
    #[strum(serialize = "i64")]
    I64,
    #[strum(serialize = "u64", serialize = "q")]
    U64,
    #[strum(serialize = "f32", serialize = "f")]
    F32,
    #[strum(serialize = "f64", serialize = "double")]
    F64,
    #[strum(serialize = "s", serialize = "string")]
    String,
    #[strum(serialize = "ws", serialize = "wstring")]
    WideString,
}

fn parse_integer(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
            .or_else(|| n.as_f64().map(|f| f as i128)),
        Value::String(s) => {
            let s = s.trim();
            let (negative, digits) = match s.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, s),
            };
            let parsed = match digits
                .strip_prefix("0x")
                .or_else(|| digits.strip_prefix("0X"))
            {
                Some(hex) => i128::from_str_radix(hex, 16).ok()?,
                None => digits.parse::<i128>().ok()?,
            };
            Some(if negative { -parsed } else { parsed })
        }
        Value::Bool(b) => Some(i128::from(*b)),
        _ => None,
    }
}

fn parse_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Build a [`PatchValue`] from an option's `{type, val}` description
pub fn parse_option(name: &str, description: &Value) -> Result<PatchValue> {
    let invalid = |message: &str| Error::InvalidConfig(format!("option '{name}': {message}"));

    let type_name = description
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing 'type'"))?;
    let ty = OptionType::from_str(type_name)
        .map_err(|_| invalid(&format!("unknown type '{type_name}'")))?;
    let val = description.get("val").ok_or_else(|| invalid("missing 'val'"))?;

    let int = || parse_integer(val).ok_or_else(|| invalid("'val' is not an integer"));
    let float = || parse_float(val).ok_or_else(|| invalid("'val' is not a number"));
    let text = || val.as_str().ok_or_else(|| invalid("'val' is not a string"));

    Ok(match ty {
        OptionType::I8 => PatchValue::I8(int()? as i8),
        OptionType::U8 => PatchValue::U8(int()? as u8),
        OptionType::I16 => PatchValue::I16(int()? as i16),
        OptionType::U16 => PatchValue::U16(int()? as u16),
        OptionType::I32 => PatchValue::I32(int()? as i32),
        OptionType::U32 => PatchValue::U32(int()? as u32),
        OptionType::I64 => PatchValue::I64(int()? as i64),
        OptionType::U64 => PatchValue::U64(int()? as u64),
        OptionType::F32 => PatchValue::F32(float()? as f32),
        OptionType::F64 => PatchValue::F64(float()?),
        OptionType::String => {
            let mut bytes = text()?.as_bytes().to_vec();
            bytes.push(0);
            PatchValue::String(bytes)
        }
        OptionType::WideString => {
            let bytes = text()?
                .encode_utf16()
                .chain(std::iter::once(0))
                .flat_map(u16::to_le_bytes)
                .collect();
            PatchValue::String(bytes)
        }
    })
}

/// Named patch options, set once before any other entry is applied
#[derive(Debug, Clone, Default)]
pub struct OptionStore {
    values: HashMap<String, PatchValue>,
}

impl OptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an `options` block. Invalid entries are logged and skipped.
    pub fn from_json(options: &Map<String, Value>) -> Self {
        let mut store = Self::new();
        store.extend_from_json(options);
        store
    }

    /// Add every valid entry of an `options` block; later blocks override earlier ones.
    pub fn extend_from_json(&mut self, options: &Map<String, Value>) -> usize {
        let mut added = 0;
        for (name, description) in options {
            match parse_option(name, description) {
                Ok(value) => {
                    self.set(name.clone(), value);
                    added += 1;
                }
                Err(e) => warn!("Skipping {}", e),
            }
        }
        added
    }

    pub fn set(&mut self, name: impl Into<String>, value: PatchValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&PatchValue> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
