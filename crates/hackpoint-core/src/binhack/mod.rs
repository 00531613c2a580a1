//! Binary hacks: named byte patches written at one or more addresses.

mod dsl;
mod render;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::{HackAddress, parse_addresses, string_or_concat};
use crate::engine::StageReport;
use crate::error::{Error, Result};
use crate::expr::Scope;
use crate::memory::{ProcessMemory, patch_region};

pub use dsl::{Chunk, Code, DslError, MISSING_OPTION_SIZE, POINTER_SIZE, compile};

/// A `binhacks` entry
#[derive(Debug, Clone, PartialEq)]
pub struct BinHack {
    pub name: String,
    pub title: Option<String>,
    pub addresses: Vec<HackAddress>,
    pub code: String,
    pub expected: Option<String>,
    pub ignore: bool,
}

impl BinHack {
    pub fn from_json(name: &str, value: &Value) -> Result<Self> {
        let invalid = |message: &str| Error::InvalidConfig(format!("binhack '{name}': {message}"));
        let object = value.as_object().ok_or_else(|| invalid("not an object"))?;

        let code = object
            .get("code")
            .and_then(string_or_concat)
            .ok_or_else(|| invalid("missing 'code'"))?;
        let addresses = object
            .get("addr")
            .map(parse_addresses)
            .transpose()?
            .ok_or_else(|| invalid("missing 'addr'"))?;

        Ok(Self {
            name: name.to_string(),
            title: object.get("title").and_then(Value::as_str).map(str::to_string),
            addresses,
            code,
            expected: object.get("expected").and_then(string_or_concat),
            ignore: object.get("ignore").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    fn label(&self) -> String {
        match &self.title {
            Some(title) => format!("{} ({})", title, self.name),
            None => self.name.clone(),
        }
    }
}

/// Number of (entry, address) instances that will be processed
pub fn count_hackpoints(hacks: &[BinHack]) -> usize {
    hacks
        .iter()
        .filter(|hack| !hack.ignore)
        .map(|hack| hack.addresses.len())
        .sum()
}

/// Render and write every binhack. Failures are logged and counted; they
/// never stop the batch. Entries with no code count as ignored.
pub fn apply_binhacks(
    memory: &dyn ProcessMemory,
    hacks: &[BinHack],
    scope: &Scope<'_>,
) -> StageReport {
    let total = count_hackpoints(hacks);
    let mut report = StageReport {
        total,
        ..Default::default()
    };
    if total == 0 {
        info!("No binary hacks to apply.");
        return report;
    }

    info!("Applying binary hacks...");
    let mut index = 0;
    for hack in hacks {
        if hack.ignore {
            report.ignored += 1;
            continue;
        }
        let label = hack.label();

        let code = match compile(&hack.code) {
            Ok(code) => code,
            Err(e) => {
                error!("Binhack {}: {}", label, e);
                index += hack.addresses.len();
                report.failed += hack.addresses.len();
                continue;
            }
        };
        if code.is_empty() {
            warn!("Binhack {}: no code, skipping", label);
            index += hack.addresses.len();
            report.total -= hack.addresses.len();
            report.ignored += 1;
            continue;
        }
        let expected = match hack.expected.as_deref().map(compile).transpose() {
            Ok(expected) => expected,
            Err(e) => {
                warn!("Binhack {}: bad expected code, skipping verification: {}", label, e);
                None
            }
        };

        for address in &hack.addresses {
            index += 1;
            let addr = match address.resolve(scope) {
                Ok(0) => {
                    warn!("({}/{}) {}: address resolved to zero, skipping", index, total, label);
                    report.failed += 1;
                    continue;
                }
                Ok(addr) => addr,
                Err(e) => {
                    error!("({}/{}) {}: {}", index, total, label, e);
                    report.failed += 1;
                    continue;
                }
            };

            match apply_one(memory, addr, &code, expected.as_ref(), scope) {
                Ok(()) => {
                    info!("({}/{}) {:#010x} {}... OK", index, total, addr, label);
                    report.applied += 1;
                }
                Err(Error::ExpectedBytesMismatch { .. }) => {
                    warn!(
                        "({}/{}) {:#010x} {}... expected bytes not matched, skipping",
                        index, total, addr, label
                    );
                    report.failed += 1;
                }
                Err(e) => {
                    error!("({}/{}) {:#010x} {}... {}", index, total, addr, label, e);
                    report.failed += 1;
                }
            }
        }
    }
    report
}

fn apply_one(
    memory: &dyn ProcessMemory,
    addr: u32,
    code: &Code,
    expected: Option<&Code>,
    scope: &Scope<'_>,
) -> Result<()> {
    let new = code.render(addr, scope)?;
    let expected = match expected {
        Some(expected) if expected.size(scope.options) != new.len() => {
            warn!("Different sizes for expected and new code at {:#010x}, skipping verification", addr);
            None
        }
        Some(expected) => Some(expected.render(addr, scope)?),
        None => None,
    };
    patch_region(memory, addr, expected.as_deref(), &new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Protection, ReadMemory, SimulatedMemory};
    use crate::options::OptionStore;
    use crate::registry::AddressRegistry;
    use serde_json::json;

    fn memory() -> SimulatedMemory {
        SimulatedMemory::builder()
            .map(0x0040_1000, vec![0x90; 0x40], Protection::ExecuteRead)
            .build()
    }

    fn hack(value: Value) -> BinHack {
        BinHack::from_json("test", &value).unwrap()
    }

    #[test]
    fn test_from_json_concatenates_code() {
        let hack = hack(json!({
            "title": "Skip intro",
            "addr": ["0x401000", 4198420],
            "code": ["B8", "01000000"],
            "expected": "90 90 90 90 90"
        }));
        assert_eq!(hack.code, "B801000000");
        assert_eq!(hack.addresses.len(), 2);
        assert_eq!(hack.label(), "Skip intro (test)");
        assert!(!hack.ignore);
    }

    #[test]
    fn test_from_json_requires_code_and_addr() {
        assert!(BinHack::from_json("x", &json!({ "addr": 1 })).is_err());
        assert!(BinHack::from_json("x", &json!({ "code": "90" })).is_err());
        assert!(BinHack::from_json("x", &json!("90")).is_err());
    }

    #[test]
    fn test_apply_writes_all_addresses() {
        let mem = memory();
        let registry = AddressRegistry::new();
        let options = OptionStore::new();
        let scope = Scope::new(&registry, &options).with_memory(&mem);
        let hacks = vec![hack(json!({
            "addr": ["Rx1000", "0x401010"],
            "code": "C3"
        }))];

        let report = apply_binhacks(&mem, &hacks, &scope);
        assert_eq!(report.applied, 2);
        assert_eq!(mem.read_u8(0x0040_1000).unwrap(), 0xC3);
        assert_eq!(mem.read_u8(0x0040_1010).unwrap(), 0xC3);
    }

    #[test]
    fn test_expected_mismatch_skips_entry() {
        let mem = memory();
        let registry = AddressRegistry::new();
        let options = OptionStore::new();
        let scope = Scope::new(&registry, &options).with_memory(&mem);
        let hacks = vec![
            hack(json!({ "addr": "0x401000", "code": "C3", "expected": "CC" })),
            hack(json!({ "addr": "0x401001", "code": "C3", "expected": "90" })),
        ];

        let report = apply_binhacks(&mem, &hacks, &scope);
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(mem.read_bytes(0x0040_1000, 2).unwrap(), vec![0x90, 0xC3]);
    }

    #[test]
    fn test_malformed_code_does_not_stop_batch() {
        let mem = memory();
        let registry = AddressRegistry::new();
        let options = OptionStore::new();
        let scope = Scope::new(&registry, &options).with_memory(&mem);
        let hacks = vec![
            hack(json!({ "addr": "0x401000", "code": "C3 [oops" })),
            hack(json!({ "addr": "0x401002", "code": "CC", "ignore": true })),
            hack(json!({ "addr": "0x401004", "code": "C3" })),
        ];

        let report = apply_binhacks(&mem, &hacks, &scope);
        assert_eq!(report.total, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.ignored, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(mem.read_u8(0x0040_1000).unwrap(), 0x90);
        assert_eq!(mem.read_u8(0x0040_1002).unwrap(), 0x90);
        assert_eq!(mem.read_u8(0x0040_1004).unwrap(), 0xC3);
    }

    #[test]
    fn test_expected_size_difference_skips_verification() {
        let mem = memory();
        let registry = AddressRegistry::new();
        let options = OptionStore::new();
        let scope = Scope::new(&registry, &options).with_memory(&mem);
        let hacks = vec![hack(json!({
            "addr": "0x401000",
            "code": "C3 C3",
            "expected": "CC"
        }))];

        let report = apply_binhacks(&mem, &hacks, &scope);
        assert_eq!(report.applied, 1);
        assert_eq!(mem.read_bytes(0x0040_1000, 2).unwrap(), vec![0xC3, 0xC3]);
    }

    #[test]
    fn test_empty_code_counts_as_ignored() {
        let mem = memory();
        let registry = AddressRegistry::new();
        let options = OptionStore::new();
        let scope = Scope::new(&registry, &options).with_memory(&mem);
        let hacks = vec![
            hack(json!({ "addr": ["0x401000", "0x401001"], "code": "" })),
            hack(json!({ "addr": "0x401002", "code": "C3" })),
            hack(json!({ "addr": "0x401003", "code": "[oops" })),
        ];

        let report = apply_binhacks(&mem, &hacks, &scope);
        assert_eq!(report.total, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.ignored, 1);
        assert_eq!(report.total, report.applied + report.failed);
        assert_eq!(mem.read_bytes(0x0040_1000, 2).unwrap(), vec![0x90, 0x90]);
    }
}
