//! Breakpoints: control-flow redirects that call a Rust handler with the
//! register state of the interrupted code.
//!
//! The first `cavesize` bytes at each address are copied into a 32-byte slot
//! and replaced with `call stub`. The shared stub saves the registers and
//! calls the dispatcher, which looks the breakpoint up by return address and
//! runs its handler. Execution then continues in the slot (running the
//! stolen instructions) or wherever the handler pointed `retaddr`.

mod asm;
mod cave;
mod dispatch;
mod hit;
mod install;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::{HackAddress, parse_addresses, string_or_concat};
use crate::error::{Error, Result};
use crate::expr::parse_literal;

pub use asm::{STUB_SIZE, entry_stub, redirect, relocated_slot};
pub use cave::CaveHandler;
pub use dispatch::BreakpointTable;
#[cfg(all(windows, target_arch = "x86"))]
pub use dispatch::native_dispatcher;
pub use hit::{BreakpointHit, ValueLocation};
pub use install::{BreakpointSite, BreakpointState, InstalledBreakpoints, install_breakpoints};

/// Length of the `call rel32` written at a breakpoint
pub const CALL_LEN: usize = 5;
/// Size of one relocated slot
pub const SLOT_SIZE: usize = 32;
pub const MIN_CAVESIZE: usize = CALL_LEN;
/// The slot must still hold the jump back
pub const MAX_CAVESIZE: usize = SLOT_SIZE - CALL_LEN;

/// Handler functions are looked up as `BP_<name>`
pub const HANDLER_PREFIX: &str = "BP_";
/// Breakpoints named `codecave:<name>` call into that code cave instead
pub const CAVE_HANDLER_PREFIX: &str = "codecave:";

/// Where execution continues after a handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Run the relocated original instructions, then return to the code
    /// after the breakpoint
    Cave,
    /// Skip the original instructions and return to `retaddr` as left by the handler
    Override,
}

pub trait BreakpointHandler: Send + Sync {
    fn call(&self, hit: &mut BreakpointHit<'_>) -> Resume;
}

impl<F> BreakpointHandler for F
where
    F: Fn(&mut BreakpointHit<'_>) -> Resume + Send + Sync,
{
    fn call(&self, hit: &mut BreakpointHit<'_>) -> Resume {
        self(hit)
    }
}

/// Handlers available to breakpoints, by full function name (`BP_file_size`)
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn BreakpointHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns `true` if it replaced an existing one.
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> bool
    where
        H: BreakpointHandler + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler)).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BreakpointHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

/// A `breakpoints` entry
#[derive(Debug, Clone, PartialEq)]
pub struct Breakpoint {
    pub name: String,
    pub addresses: Vec<HackAddress>,
    /// Number of original bytes moved into the slot
    pub cavesize: usize,
    /// Bytes of arguments popped when returning from the entry stub (`ret N`)
    pub stack_clear: u16,
    pub expected: Option<String>,
    pub ignore: bool,
    /// The whole entry, handed to the handler on every hit
    pub config: Value,
}

impl Breakpoint {
    pub fn from_json(name: &str, value: &Value) -> Result<Self> {
        let invalid =
            |message: &str| Error::InvalidConfig(format!("breakpoint '{name}': {message}"));
        let object = value.as_object().ok_or_else(|| invalid("not an object"))?;

        let cavesize = match object.get("cavesize") {
            Some(value) => integer(value)
                .ok_or_else(|| invalid("'cavesize' is not a number"))
                .and_then(|n| {
                    u32::try_from(n)
                        .map(|n| n as usize)
                        .map_err(|_| invalid("'cavesize' is too large"))
                })?,
            None => return Err(invalid("missing 'cavesize'")),
        };
        let stack_clear = match object.get("stack_clear_size") {
            None | Some(Value::Null) => 0,
            Some(value) => integer(value)
                .and_then(|n| u16::try_from(n).ok())
                .ok_or_else(|| invalid("'stack_clear_size' is not a 16-bit number"))?,
        };

        let addresses = object
            .get("addr")
            .map(parse_addresses)
            .transpose()?
            .ok_or_else(|| invalid("missing 'addr'"))?;

        Ok(Self {
            name: name.to_string(),
            addresses,
            cavesize,
            stack_clear,
            expected: object.get("expected").and_then(string_or_concat),
            ignore: object.get("ignore").and_then(Value::as_bool).unwrap_or(false),
            config: value.clone(),
        })
    }

    /// Name without its `#slot` suffix; the suffix lets several breakpoints
    /// share one handler
    fn base_name(&self) -> &str {
        self.name.split('#').next().unwrap_or_default()
    }

    /// Name of the handler function, or of the code cave for `codecave:` breakpoints
    pub fn handler_name(&self) -> String {
        let base = self.base_name();
        if base.starts_with(CAVE_HANDLER_PREFIX) {
            base.to_string()
        } else {
            format!("{HANDLER_PREFIX}{base}")
        }
    }

    /// Code cave this breakpoint calls into, if it is named `codecave:<cave>`
    pub fn cave_name(&self) -> Option<&str> {
        self.base_name().strip_prefix(CAVE_HANDLER_PREFIX)
    }
}

/// A JSON number, or a string holding one literal
fn integer(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let text = s.trim();
            parse_literal(text.as_bytes(), 0)
                .filter(|&(_, len)| len == text.len())
                .map(|(n, _)| u64::from(n))
        }
        _ => None,
    }
}

pub(crate) fn check_cavesize(cavesize: usize) -> Result<()> {
    if (MIN_CAVESIZE..=MAX_CAVESIZE).contains(&cavesize) {
        Ok(())
    } else {
        Err(Error::CaveSizeOutOfRange {
            size: cavesize,
            min: MIN_CAVESIZE,
            max: MAX_CAVESIZE,
        })
    }
}

/// Number of (entry, address) instances that will be processed
pub fn count_breakpoint_sites(breakpoints: &[Breakpoint]) -> usize {
    breakpoints
        .iter()
        .filter(|bp| !bp.ignore)
        .map(|bp| bp.addresses.len())
        .sum()
}
