//! # hackpoint-core
//!
//! Runtime binary patching for 32-bit x86 processes.
//!
//! This crate provides:
//! - An expression evaluator over registers, memory and named addresses
//! - The code-string DSL used by binary hacks and code caves
//! - Code caves: named, access-controlled buffers in allocated memory
//! - Breakpoints: redirects that call Rust handlers with the captured registers
//! - Memory backends for the current process (Windows, x86) and a simulated
//!   address space for tests and dry runs
//!
//! An [`Engine`] applies a [`HackConfig`] in order: options, code caves,
//! binary hacks, breakpoints. Failures are logged and counted per entry.

pub mod binhack;
pub mod breakpoint;
pub mod codecave;
pub mod config;
pub mod cpu;
pub mod engine;
pub mod error;
pub mod expr;
pub mod memory;
pub mod options;
pub mod prompt;
pub mod registry;

pub use binhack::{BinHack, Code, DslError, apply_binhacks, compile};
pub use breakpoint::{
    Breakpoint, BreakpointHandler, BreakpointHit, BreakpointSite, BreakpointState, BreakpointTable,
    HandlerRegistry, Resume, ValueLocation,
};
pub use codecave::{AccessClass, CodeCave, PlacedCave};
pub use config::{HackAddress, HackConfig};
pub use cpu::{CpuState, Register};
pub use engine::{ApplyReport, CodeLocation, Engine, LocationKind, StageReport};
pub use error::{Error, Result};
pub use expr::{Evaluation, ExpressionError, Scope, evaluate, evaluate_or_zero};
#[cfg(all(windows, target_arch = "x86"))]
pub use memory::LocalProcess;
pub use memory::{
    MemoryRegion, ProcessMemory, Protection, ReadMemory, SimulatedMemory, patch_region,
};
pub use options::{OptionStore, PatchValue, ValueWidth};
#[cfg(windows)]
pub use prompt::MessageBoxPrompter;
pub use prompt::{Prompter, SymbolPolicy};
pub use registry::AddressRegistry;
