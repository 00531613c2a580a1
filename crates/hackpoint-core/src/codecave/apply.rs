use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::binhack::{Code, compile};
use crate::engine::StageReport;
use crate::error::{Error, Result};
use crate::expr::Scope;
use crate::memory::{ProcessMemory, Protection, patch_region};
use crate::options::OptionStore;
use crate::registry::{AddressRegistry, CAVE_PREFIX};

use super::layout::{CAVE_PADDING_BYTE, CavePlacement, layout, slot_size};
use super::{AccessClass, CodeCave};

/// Memory allocated for one access class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaveRegion {
    pub class: AccessClass,
    pub base: u32,
    pub size: usize,
}

/// A cave that received an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacedCave {
    pub name: String,
    pub address: u32,
    pub size: usize,
    pub padded: usize,
}

/// Allocate, publish and fill every cave.
///
/// All cave names are registered before any content is rendered, so caves
/// may refer to each other in any order. A name that is already registered
/// fails that cave; the registry never moves a published cave.
pub fn apply_codecaves(
    memory: &dyn ProcessMemory,
    caves: &[CodeCave],
    registry: &mut AddressRegistry,
    options: &OptionStore,
) -> (StageReport, Vec<CaveRegion>, Vec<PlacedCave>) {
    let mut report = StageReport {
        total: caves.len(),
        ..Default::default()
    };
    if caves.is_empty() {
        return (report, Vec::new(), Vec::new());
    }
    info!("Applying code caves...");

    // Pass A: sizes
    let mut seen = HashSet::new();
    let mut compiled = Vec::with_capacity(caves.len());
    let mut rejected = Vec::with_capacity(caves.len());
    let mut requests = Vec::with_capacity(caves.len());
    for cave in caves {
        let prepared = if seen.insert(cave.name.as_str()) {
            prepare(cave, registry, options)
        } else {
            Err(Error::InvalidConfig(format!("code cave '{}' defined twice", cave.name)))
        };
        match prepared {
            Ok((code, size)) => {
                compiled.push(code);
                rejected.push(false);
                requests.push((cave.access, size));
            }
            Err(e) => {
                error!("Code cave {}: {}", cave.name, e);
                compiled.push(None);
                rejected.push(true);
                requests.push((cave.access, None));
            }
        }
    }

    let plan = layout(requests);
    for (i, cave) in caves.iter().enumerate() {
        if plan.slots[i] == CavePlacement::TooLarge {
            error!("Code cave {}: does not fit in {} cave memory", cave.name, cave.access);
            rejected[i] = true;
        }
    }

    let mut regions = BTreeMap::new();
    for (&class, &size) in &plan.class_sizes {
        match memory.allocate(size, Protection::ReadWrite) {
            Ok(base) => {
                debug!("Allocated {} bytes of {} cave memory at {:#010x}", size, class, base);
                regions.insert(class, CaveRegion { class, base, size });
            }
            Err(e) => error!("Could not allocate {} cave memory: {}", class, e),
        }
    }

    // Pass B: publish every address before anything is rendered
    let mut placed = Vec::new();
    let mut targets = Vec::with_capacity(caves.len());
    for (i, cave) in caves.iter().enumerate() {
        let mut target = plan.slots[i].slot().and_then(|slot| {
            let region = regions.get(&slot.class)?;
            let address = region.base.checked_add(u32::try_from(slot.offset).ok()?)?;
            Some((address, slot))
        });
        if let Some((address, _)) = target
            && !registry.register_cave(&cave.name, address)
        {
            warn!("Code cave {}: name already taken, skipping", cave.name);
            rejected[i] = true;
            target = None;
        }
        if let Some((address, slot)) = target {
            placed.push(PlacedCave {
                name: cave.name.clone(),
                address,
                size: slot.size,
                padded: slot.padded,
            });
        }
        targets.push(target);
    }

    // Pass C: contents
    let scope = Scope::new(registry, options).with_memory(memory);
    for (i, cave) in caves.iter().enumerate() {
        if rejected[i] {
            report.failed += 1;
            continue;
        }
        let Some((address, slot)) = targets[i] else {
            if plan.slots[i] == CavePlacement::Empty {
                debug!("Code cave {} is empty, skipping", cave.name);
                report.ignored += 1;
            } else {
                report.failed += 1;
            }
            continue;
        };

        let mut bytes = vec![cave.fill; slot.size];
        bytes.resize(slot.padded, CAVE_PADDING_BYTE);
        if let Some(code) = &compiled[i] {
            match code.render(address, &scope) {
                Ok(rendered) => bytes[..rendered.len()].copy_from_slice(&rendered),
                Err(e) => {
                    error!("Code cave {}: {}", cave.name, e);
                    report.failed += 1;
                    continue;
                }
            }
        }
        match patch_region(memory, address, None, &bytes) {
            Ok(()) => {
                info!("Code cave {} at {:#010x} ({} bytes)", cave.name, address, slot.size);
                report.applied += 1;
            }
            Err(e) => {
                error!("Code cave {}: {}", cave.name, e);
                report.failed += 1;
            }
        }
    }
    report.total -= report.ignored;

    for region in regions.values() {
        let protection = region.class.protection();
        if let Err(e) = memory.protect(region.base, region.size, protection) {
            warn!("Could not protect {} cave memory: {}", region.class, e);
        }
        if protection.is_executable()
            && let Err(e) = memory.flush_instructions(region.base, region.size)
        {
            warn!("Could not flush {} cave memory: {}", region.class, e);
        }
    }

    (report, regions.into_values().collect(), placed)
}

/// Compile the initializer and compute the usable size of one cave
fn prepare(
    cave: &CodeCave,
    registry: &AddressRegistry,
    options: &OptionStore,
) -> Result<(Option<Code>, Option<usize>)> {
    if registry.get(&format!("{CAVE_PREFIX}{}", cave.name)).is_some() {
        return Err(Error::InvalidConfig(format!(
            "code cave '{}' already exists",
            cave.name
        )));
    }
    let code = cave.code.as_deref().map(compile).transpose()?;
    let code_size = code.as_ref().map_or(0, |code| code.size(options));
    let size = slot_size(cave.size, cave.count, code_size)?;
    Ok((code, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ReadMemory, SimulatedMemory};
    use crate::options::PatchValue;

    fn cave(name: &str, access: AccessClass, size: usize, code: Option<&str>) -> CodeCave {
        CodeCave {
            name: name.to_string(),
            access,
            size,
            count: 1,
            fill: 0,
            code: code.map(str::to_string),
        }
    }

    #[test]
    fn test_caves_are_published_and_filled() {
        let mem = SimulatedMemory::builder().build();
        let mut registry = AddressRegistry::new();
        let options = OptionStore::new();
        let caves = vec![
            cave("entry", AccessClass::Rx, 0, Some("E9 [cave:data]")),
            CodeCave {
                fill: 0xAA,
                count: 2,
                ..cave("data", AccessClass::Rw, 4, Some("01 02"))
            },
            cave("empty", AccessClass::Rw, 0, None),
        ];

        let (report, regions, placed) = apply_codecaves(&mem, &caves, &mut registry, &options);
        assert_eq!(report.total, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(report.ignored, 1);
        assert_eq!(regions.len(), 2);
        assert_eq!(placed.len(), 2);

        let entry = registry.get("cave:entry").unwrap();
        let data = registry.get("cave:data").unwrap();
        assert!(registry.get("cave:empty").is_none());

        let bytes = mem.read_bytes(entry, 16).unwrap();
        assert_eq!(bytes[0], 0xE9);
        let rel = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
        assert_eq!(rel.wrapping_add(entry + 5), data);
        assert!(bytes[5..].iter().all(|&b| b == CAVE_PADDING_BYTE));

        let bytes = mem.read_bytes(data, 16).unwrap();
        assert_eq!(&bytes[..8], &[0x01, 0x02, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA]);
        assert!(bytes[8..].iter().all(|&b| b == CAVE_PADDING_BYTE));
    }

    #[test]
    fn test_final_protection_per_class() {
        let mem = SimulatedMemory::builder().build();
        let mut registry = AddressRegistry::new();
        let options = OptionStore::new();
        let caves = vec![
            cave("code", AccessClass::Rx, 8, None),
            cave("table", AccessClass::R, 8, None),
        ];

        let (_, regions, _) = apply_codecaves(&mem, &caves, &mut registry, &options);
        for region in regions {
            assert_eq!(
                mem.query(region.base).unwrap().protection,
                region.class.protection()
            );
        }
    }

    #[test]
    fn test_cave_size_grows_to_fit_code() {
        let mem = SimulatedMemory::builder().build();
        let mut registry = AddressRegistry::new();
        let mut options = OptionStore::new();
        options.set("name", PatchValue::String(vec![b'x'; 20]));
        let caves = vec![
            cave("text", AccessClass::Rw, 4, Some("<option:name>")),
            cave("after", AccessClass::Rw, 4, None),
        ];

        let (_, _, placed) = apply_codecaves(&mem, &caves, &mut registry, &options);
        assert_eq!(placed[0].size, 20);
        assert_eq!(placed[0].padded, 32);
        assert_eq!(placed[1].address, placed[0].address + 32);
        assert_eq!(mem.read_bytes(placed[0].address, 20).unwrap(), vec![b'x'; 20]);
    }

    #[test]
    fn test_malformed_cave_code_is_skipped() {
        let mem = SimulatedMemory::builder().build();
        let mut registry = AddressRegistry::new();
        let options = OptionStore::new();
        let caves = vec![
            cave("bad", AccessClass::Rx, 0, Some("[unterminated")),
            cave("good", AccessClass::Rx, 0, Some("C3")),
        ];

        let (report, _, _) = apply_codecaves(&mem, &caves, &mut registry, &options);
        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 1);
        assert!(registry.get("cave:bad").is_none());
        assert_eq!(mem.read_u8(registry.get("cave:good").unwrap()).unwrap(), 0xC3);
    }

    #[test]
    fn test_second_run_does_not_replace_published_cave() {
        let mem = SimulatedMemory::builder().build();
        let mut registry = AddressRegistry::new();
        let options = OptionStore::new();

        let first = vec![cave("x", AccessClass::Rx, 0, Some("B8 01 00 00 00 C3"))];
        let (report, _, placed) = apply_codecaves(&mem, &first, &mut registry, &options);
        assert_eq!(report.applied, 1);
        let address = placed[0].address;

        let second = vec![
            cave("x", AccessClass::Rx, 0, Some("B8 02 00 00 00 C3")),
            cave("y", AccessClass::Rx, 0, Some("C3")),
        ];
        let (report, _, placed) = apply_codecaves(&mem, &second, &mut registry, &options);
        assert_eq!(report.total, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].name, "y");
        assert_eq!(registry.get("cave:x"), Some(address));
        assert_eq!(mem.read_bytes(address, 2).unwrap(), vec![0xB8, 0x01]);
    }

    #[test]
    fn test_duplicate_names_in_one_batch() {
        let mem = SimulatedMemory::builder().build();
        let mut registry = AddressRegistry::new();
        let options = OptionStore::new();
        let caves = vec![
            cave("x", AccessClass::Rx, 0, Some("C3")),
            cave("x", AccessClass::Rx, 0, Some("90 C3")),
        ];

        let (report, _, placed) = apply_codecaves(&mem, &caves, &mut registry, &options);
        assert_eq!((report.applied, report.failed), (1, 1));
        assert_eq!(placed.len(), 1);
        assert_eq!(mem.read_u8(registry.get("cave:x").unwrap()).unwrap(), 0xC3);
    }

    #[test]
    fn test_oversized_cave_fails_alone() {
        let mem = SimulatedMemory::builder().build();
        let mut registry = AddressRegistry::new();
        let options = OptionStore::new();
        let caves = vec![
            CodeCave {
                count: 2,
                ..cave("huge", AccessClass::Rw, usize::MAX, None)
            },
            cave("near_limit", AccessClass::Rw, u32::MAX as usize, None),
            cave("small", AccessClass::Rw, 8, None),
        ];

        let (report, _, placed) = apply_codecaves(&mem, &caves, &mut registry, &options);
        assert_eq!(report.failed, 2);
        assert_eq!(report.applied, 1);
        assert!(registry.get("cave:huge").is_none());
        assert!(registry.get("cave:near_limit").is_none());
        assert_eq!(placed[0].name, "small");
    }
}
