//! Code caves: named buffers in freshly allocated memory, grouped by access class.

mod apply;
mod layout;

use serde_json::Value;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::config::string_or_concat;
use crate::error::{Error, Result};
use crate::memory::Protection;

pub use apply::{CaveRegion, PlacedCave, apply_codecaves};
pub use layout::{
    CAVE_ALIGNMENT, CAVE_PADDING_BYTE, CaveLayout, CavePlacement, CaveSlot, MAX_REGION_SIZE,
    align_up, layout, padded_size, slot_size,
};

/// Access granted to a cave once its contents are written
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AccessClass {
    R,
    Rw,
    X,
    Rx,
    #[default]
    Rwx,
}

impl AccessClass {
    pub fn protection(self) -> Protection {
        match self {
            Self::R => Protection::Read,
            Self::Rw => Protection::ReadWrite,
            Self::X => Protection::Execute,
            Self::Rx => Protection::ExecuteRead,
            Self::Rwx => Protection::ExecuteReadWrite,
        }
    }
}

/// A `codecaves` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeCave {
    pub name: String,
    pub access: AccessClass,
    /// Requested size of one element
    pub size: usize,
    pub count: usize,
    pub fill: u8,
    pub code: Option<String>,
}

impl CodeCave {
    /// Parse an entry; a bare string is shorthand for `{ "code": ... }`
    pub fn from_json(name: &str, value: &Value, default_access: AccessClass) -> Result<Self> {
        let invalid = |message: &str| Error::InvalidConfig(format!("codecave '{name}': {message}"));
        if name.contains('+') {
            return Err(invalid("name contains illegal character '+'"));
        }

        let mut cave = Self {
            name: name.to_string(),
            access: default_access,
            size: 0,
            count: 1,
            fill: 0,
            code: None,
        };

        match value {
            Value::String(_) | Value::Array(_) => {
                cave.code = Some(string_or_concat(value).ok_or_else(|| invalid("bad code"))?);
            }
            Value::Object(object) => {
                cave.code = object.get("code").and_then(string_or_concat);
                if let Some(access) = object.get("access") {
                    let access = access.as_str().ok_or_else(|| invalid("'access' is not a string"))?;
                    cave.access = access
                        .parse()
                        .map_err(|_| invalid(&format!("unknown access '{access}'")))?;
                }
                let number = |key: &str, default: u64| -> Result<u64> {
                    match object.get(key) {
                        None => Ok(default),
                        Some(v) => v
                            .as_u64()
                            .ok_or_else(|| invalid(&format!("'{key}' is not a positive integer"))),
                    }
                };
                // Sizes are bounded by the 32-bit address space, whatever the host
                let size = |key: &str, default: u64| -> Result<usize> {
                    u32::try_from(number(key, default)?)
                        .map(|n| n as usize)
                        .map_err(|_| invalid(&format!("'{key}' is too large")))
                };
                cave.size = size("size", 0)?;
                cave.count = size("count", 1)?;
                cave.fill = u8::try_from(number("fill", 0)?)
                    .map_err(|_| invalid("'fill' does not fit in a byte"))?;
            }
            _ => return Err(invalid("not a string or object")),
        }
        Ok(cave)
    }
}
