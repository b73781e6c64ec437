//! Process exit codes shared by the binary and its tests (sysexits values
//! where one fits).

pub const OK: i32 = 0;
/// Unexpected startup or runtime failure.
pub const FATAL: i32 = 1;
/// Command-line usage error, as reported by clap.
pub const USAGE: i32 = 2;
/// The listen address is already owned by another process.
pub const LOCK_HELD: i32 = 73;
/// The configuration failed to load or validate.
pub const CONFIG_INVALID: i32 = 78;
