//! Unit tests for the operator table, lazy flags and runtime helpers.

mod flags;
mod helpers;
mod strings;

use drc_core::CpuState;

/// State block with no RAM behind it, for pure register operations.
pub(crate) fn bare_env() -> Box<CpuState> {
    Box::new(CpuState::new(std::ptr::null_mut(), 0))
}

/// State block backed by a RAM buffer. The buffer must stay alive for
/// as long as the state is used.
pub(crate) fn ram_env(ram: &mut Vec<u8>) -> Box<CpuState> {
    Box::new(CpuState::new(ram.as_mut_ptr(), ram.len() as u32))
}
