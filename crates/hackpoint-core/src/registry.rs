//! Named address registry.
//!
//! Names are bound once and never rebound. Exported functions are stored as
//! `module:function`, code caves as `cave:<name>`.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::memory::ReadMemory;

/// Prefix under which code caves are published
pub const CAVE_PREFIX: &str = "cave:";
/// Accepted alias for [`CAVE_PREFIX`]
pub const CODECAVE_ALIAS: &str = "codecave:";

#[derive(Debug, Clone, Default)]
pub struct AddressRegistry {
    names: HashMap<String, u32>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `address`. Returns `false` and keeps the old binding
    /// when the name is already registered.
    pub fn register(&mut self, name: impl Into<String>, address: u32) -> bool {
        let name = name.into();
        if let Some(existing) = self.names.get(&name) {
            warn!(
                "Address name '{}' already bound to {:#010x}, ignoring {:#010x}",
                name, existing, address
            );
            return false;
        }
        debug!("Registered {} = {:#010x}", name, address);
        self.names.insert(name, address);
        true
    }

    /// Register every `(function, address)` pair as `module:function`.
    /// Returns the number of new bindings.
    pub fn register_exports<I, S>(&mut self, module: &str, exports: I) -> usize
    where
        I: IntoIterator<Item = (S, u32)>,
        S: AsRef<str>,
    {
        exports
            .into_iter()
            .filter(|(function, address)| {
                self.register(format!("{}:{}", module, function.as_ref()), *address)
            })
            .count()
    }

    pub fn register_cave(&mut self, cave: &str, address: u32) -> bool {
        self.register(format!("{CAVE_PREFIX}{cave}"), address)
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        match name.strip_prefix(CODECAVE_ALIAS) {
            Some(cave) => self.names.get(&format!("{CAVE_PREFIX}{cave}")).copied(),
            None => self.names.get(name).copied(),
        }
    }

    /// Look up `name`, falling back to the export table of `module` for
    /// `module:function` names that were never registered explicitly.
    pub fn resolve(&self, name: &str, memory: Option<&dyn ReadMemory>) -> Option<u32> {
        if let Some(address) = self.get(name) {
            return Some(address);
        }
        let memory = memory?;
        let (module, function) = name.split_once(':')?;
        if module == "cave" || module == "codecave" || module == "option" {
            return None;
        }
        memory.resolve_export(module, function)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.names.iter().map(|(name, &address)| (name.as_str(), address))
    }
}
