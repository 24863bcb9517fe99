//! Process exit codes, one per failure class.
//!
//! A server that exits on its own passes its code through unchanged
//! (`128 + signal` when it was killed by a signal).

pub const SUCCESS: u8 = 0;
pub const FAILURE: u8 = 1;
pub const RESOLUTION: u8 = 10;
pub const DEPENDENCY_INSTALL: u8 = 11;
pub const COPY: u8 = 12;
pub const ENTRY_POINT_RESOLUTION: u8 = 20;
pub const BIND: u8 = 21;
pub const SPAWN: u8 = 22;
