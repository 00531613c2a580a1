use serde_json::Value;
use tracing::{error, warn};

use crate::cpu::{CpuState, Register};
use crate::expr::{Scope, evaluate, evaluate_or_zero};
use crate::memory::ReadMemory;
use crate::options::{PatchValue, ValueWidth};

use super::Resume;
use super::dispatch::HitContext;

/// Something a handler can read from or write to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLocation {
    Register(Register),
    Memory(u32),
}

/// One breakpoint hit, as seen by its handler
pub struct BreakpointHit<'a> {
    pub name: &'a str,
    /// Address of the breakpoint
    pub address: u32,
    /// Registers of the interrupted code. Changes are written back on return;
    /// a changed `esp` moves the stack pointer too.
    pub regs: &'a mut CpuState,
    config: &'a Value,
    context: &'a HitContext,
}

impl<'a> BreakpointHit<'a> {
    pub(crate) fn new(
        name: &'a str,
        address: u32,
        regs: &'a mut CpuState,
        config: &'a Value,
        context: &'a HitContext,
    ) -> Self {
        Self {
            name,
            address,
            regs,
            config,
            context,
        }
    }

    /// The breakpoint's configuration entry
    pub fn config(&self) -> &Value {
        self.config
    }

    pub fn memory(&self) -> &dyn ReadMemory {
        self.context.memory.as_ref()
    }

    fn scope(&self) -> Scope<'_> {
        Scope::new(&self.context.registry, &self.context.options)
            .with_memory(self.memory())
            .with_regs(&*self.regs)
    }

    /// Value of `key` as a number. Strings are evaluated as expressions with
    /// the current registers; `None` if the key is missing.
    pub fn immediate(&self, key: &str) -> Option<u32> {
        match self.config.get(key)? {
            Value::Number(n) => Some(
                n.as_i64()
                    .map(|n| n as u32)
                    .or_else(|| n.as_f64().map(|f| f as u32))
                    .unwrap_or_default(),
            ),
            Value::String(text) => Some(evaluate_or_zero(text, &self.scope())),
            Value::Bool(b) => Some(u32::from(*b)),
            Value::Null => Some(0),
            Value::Array(_) | Value::Object(_) => {
                warn!("{}: '{}' must not be an array or object", self.name, key);
                None
            }
        }
    }

    /// The register named by `key`
    pub fn register(&mut self, key: &str) -> Option<&mut u32> {
        let register: Register = self.config.get(key)?.as_str()?.trim().parse().ok()?;
        Some(self.regs.get_mut(register))
    }

    /// Location named by `key`: a bare register name, or a dereference such
    /// as `"[ebp-8]"`, which yields the address `ebp-8` points to
    pub fn pointer(&self, key: &str) -> Option<ValueLocation> {
        let text = self.config.get(key)?.as_str()?.trim();
        if let Ok(register) = text.parse::<Register>() {
            return Some(ValueLocation::Register(register));
        }
        let Some(inner) = text.strip_prefix('[') else {
            error!("{}: '{}' is neither a register nor a dereference", self.name, key);
            return None;
        };
        match evaluate(inner, Some(b']'), &self.scope()) {
            Ok(evaluation) => {
                let rest = inner.get(evaluation.cursor + 1..).unwrap_or_default();
                if !rest.trim().is_empty() {
                    warn!("{}: leftover bytes after dereference: '{}'", self.name, rest);
                }
                Some(ValueLocation::Memory(evaluation.value))
            }
            Err(e) => {
                error!("{}: '{}': {}", self.name, key, e);
                None
            }
        }
    }

    /// Value of the given width stored at the location named by `key`
    pub fn typed(&self, key: &str, width: ValueWidth) -> Option<PatchValue> {
        match self.pointer(key)? {
            ValueLocation::Register(register) => {
                Some(width.decode(&self.regs.get(register).to_le_bytes()))
            }
            ValueLocation::Memory(address) => match width.read(self.memory(), address) {
                Ok(value) => Some(value),
                Err(e) => {
                    error!("{}: '{}': {}", self.name, key, e);
                    None
                }
            },
        }
    }

    /// `false` only if `cave_exec` is present and evaluates to zero.
    ///
    /// Handlers that change registers the original instructions would
    /// overwrite check this to decide whether those instructions still run.
    pub fn cave_exec_flag(&self) -> bool {
        self.immediate("cave_exec").is_none_or(|value| value != 0)
    }

    /// [`Resume::Cave`] unless `cave_exec` disables it
    pub fn default_resume(&self) -> Resume {
        if self.cave_exec_flag() {
            Resume::Cave
        } else {
            Resume::Override
        }
    }
}

impl std::fmt::Debug for BreakpointHit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakpointHit")
            .field("name", &self.name)
            .field("address", &format_args!("{:#010x}", self.address))
            .field("regs", &self.regs)
            .finish()
    }
}
