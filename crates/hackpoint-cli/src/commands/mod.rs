//! CLI command implementations.
//!
//! Every command works on a simulated process built by [`target`].

pub mod apply;
pub mod eval;
pub mod hex_utils;
pub mod hexdump;
pub mod offset;
pub mod render;
pub mod target;
