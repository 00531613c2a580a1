//! Loading of hackpoint configuration files.
//!
//! ```json
//! {
//!   "options":     { "lives": { "type": "u8", "val": 8 } },
//!   "codecaves":   { "protection": "rx", "helper": "55 8B EC" },
//!   "binhacks":    { "skip_intro": { "addr": "Rx1234", "code": "EB" } },
//!   "breakpoints": { "file_size": { "addr": "0x401000", "cavesize": 5 } }
//! }
//! ```

use std::path::Path;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::binhack::BinHack;
use crate::breakpoint::Breakpoint;
use crate::codecave::{AccessClass, CodeCave};
use crate::error::{Error, Result};
use crate::expr::{Scope, evaluate};
use crate::options::OptionStore;

/// Key of the `codecaves` block naming the default access class
const DEFAULT_PROTECTION_KEY: &str = "protection";

/// Target address of a hackpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HackAddress {
    Absolute(u32),
    /// Evaluated at apply time (`"Rx1234"`, `"<th_func> + 4"`)
    Expression(String),
}

impl HackAddress {
    pub fn resolve(&self, scope: &Scope<'_>) -> Result<u32> {
        match self {
            Self::Absolute(address) => Ok(*address),
            Self::Expression(text) => Ok(evaluate(text, None, scope)?.value),
        }
    }
}

impl std::fmt::Display for HackAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absolute(address) => write!(f, "{address:#010x}"),
            Self::Expression(text) => f.write_str(text),
        }
    }
}

fn parse_address(value: &Value) -> Result<HackAddress> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(HackAddress::Absolute)
            .ok_or_else(|| Error::InvalidConfig(format!("address {n} out of range"))),
        Value::String(s) => Ok(HackAddress::Expression(s.trim().to_string())),
        other => Err(Error::InvalidConfig(format!("bad address: {other}"))),
    }
}

/// Parse `addr`, which may be a single address or an array of them
pub fn parse_addresses(value: &Value) -> Result<Vec<HackAddress>> {
    match value {
        Value::Array(items) => items.iter().map(parse_address).collect(),
        single => Ok(vec![parse_address(single)?]),
    }
}

/// A string, or an array of strings joined together
pub fn string_or_concat(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str())
            .collect::<Option<Vec<_>>>()
            .map(|parts| parts.concat()),
        _ => None,
    }
}

/// Every hackpoint of one configuration, in file order
#[derive(Debug, Clone, Default)]
pub struct HackConfig {
    pub options: OptionStore,
    pub codecaves: Vec<CodeCave>,
    pub binhacks: Vec<BinHack>,
    pub breakpoints: Vec<Breakpoint>,
}

impl HackConfig {
    /// Load from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading hackpoints from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        Self::from_value(&value)
    }

    /// Build from an already parsed document. Only a non-object root is an
    /// error; bad entries are logged and skipped.
    pub fn from_value(value: &Value) -> Result<Self> {
        let root = value
            .as_object()
            .ok_or_else(|| Error::InvalidConfig("root is not an object".to_string()))?;

        let mut config = Self::default();
        if let Some(options) = block(root, "options") {
            config.options.extend_from_json(options);
        }
        if let Some(caves) = block(root, "codecaves") {
            config.codecaves = parse_codecaves(caves);
        }
        if let Some(binhacks) = block(root, "binhacks") {
            config.binhacks = parse_entries(binhacks, BinHack::from_json);
        }
        if let Some(breakpoints) = block(root, "breakpoints") {
            config.breakpoints = parse_entries(breakpoints, Breakpoint::from_json);
        }
        debug!(
            "Loaded {} options, {} code caves, {} binhacks, {} breakpoints",
            config.options.len(),
            config.codecaves.len(),
            config.binhacks.len(),
            config.breakpoints.len()
        );
        Ok(config)
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
            && self.codecaves.is_empty()
            && self.binhacks.is_empty()
            && self.breakpoints.is_empty()
    }
}

fn block<'a>(root: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    let value = root.get(key)?;
    let object = value.as_object();
    if object.is_none() {
        warn!("Ignoring '{}': not an object", key);
    }
    object
}

fn parse_entries<T>(
    entries: &Map<String, Value>,
    parse: impl Fn(&str, &Value) -> Result<T>,
) -> Vec<T> {
    entries
        .iter()
        .filter_map(|(name, value)| match parse(name, value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping {}", e);
                None
            }
        })
        .collect()
}

fn parse_codecaves(caves: &Map<String, Value>) -> Vec<CodeCave> {
    let default_access = match caves.get(DEFAULT_PROTECTION_KEY) {
        Some(Value::String(access)) => access.parse().unwrap_or_else(|_| {
            warn!("Unknown default cave protection '{}', using rwx", access);
            AccessClass::default()
        }),
        Some(_) => {
            warn!("Default cave protection is not a string, using rwx");
            AccessClass::default()
        }
        None => AccessClass::default(),
    };

    caves
        .iter()
        .filter(|(name, _)| name.as_str() != DEFAULT_PROTECTION_KEY)
        .filter_map(
            |(name, value)| match CodeCave::from_json(name, value, default_access) {
                Ok(cave) => Some(cave),
                Err(e) => {
                    warn!("Skipping {}", e);
                    None
                }
            },
        )
        .collect()
}
