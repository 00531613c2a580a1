//! Placement of caves inside their class regions.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

use super::AccessClass;

/// Alignment of every cave inside its region
pub const CAVE_ALIGNMENT: usize = 16;
/// Written between the end of a cave and the next aligned boundary
pub const CAVE_PADDING_BYTE: u8 = 0xCC;

/// Largest region a class may need; cave addresses are 32-bit
pub const MAX_REGION_SIZE: usize = u32::MAX as usize;

pub fn align_up(value: usize, alignment: usize) -> Option<usize> {
    value.checked_next_multiple_of(alignment)
}

/// Usable size of a cave, or `Ok(None)` if it needs no memory at all
pub fn slot_size(requested: usize, count: usize, code_size: usize) -> Result<Option<usize>> {
    let data = requested
        .checked_mul(count)
        .filter(|&data| data <= MAX_REGION_SIZE)
        .ok_or_else(|| {
            Error::InvalidConfig(format!("cave of {count} x {requested} bytes is too large"))
        })?;
    if data == 0 && code_size == 0 {
        Ok(None)
    } else {
        Ok(Some(data.max(code_size)))
    }
}

/// Size including at least one padding byte, rounded up to [`CAVE_ALIGNMENT`]
pub fn padded_size(size: usize) -> Option<usize> {
    align_up(size.checked_add(1)?, CAVE_ALIGNMENT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaveSlot {
    pub class: AccessClass,
    /// Offset inside the class region
    pub offset: usize,
    pub size: usize,
    pub padded: usize,
}

/// Where one request ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CavePlacement {
    /// Nothing to allocate
    Empty,
    Placed(CaveSlot),
    /// Would push its class region past [`MAX_REGION_SIZE`]
    TooLarge,
}

impl CavePlacement {
    pub fn slot(self) -> Option<CaveSlot> {
        match self {
            Self::Placed(slot) => Some(slot),
            Self::Empty | Self::TooLarge => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaveLayout {
    /// One entry per request, in request order
    pub slots: Vec<CavePlacement>,
    /// Total bytes needed by each non-empty class
    pub class_sizes: BTreeMap<AccessClass, usize>,
}

/// Lay out caves given as `(class, size)` requests, in order
pub fn layout<I>(requests: I) -> CaveLayout
where
    I: IntoIterator<Item = (AccessClass, Option<usize>)>,
{
    let mut result = CaveLayout::default();
    for (class, size) in requests {
        let placement = match size {
            None => CavePlacement::Empty,
            Some(size) => {
                let offset = result.class_sizes.get(&class).copied().unwrap_or(0);
                let fits = padded_size(size).and_then(|padded| {
                    let end = offset.checked_add(padded).filter(|&end| end <= MAX_REGION_SIZE)?;
                    Some((padded, end))
                });
                match fits {
                    Some((padded, end)) => {
                        result.class_sizes.insert(class, end);
                        CavePlacement::Placed(CaveSlot {
                            class,
                            offset,
                            size,
                            padded,
                        })
                    }
                    None => CavePlacement::TooLarge,
                }
            }
        };
        result.slots.push(placement);
    }
    result
}
