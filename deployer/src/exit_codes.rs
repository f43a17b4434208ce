//! Stable exit codes for deployer CLI commands.

/// Command succeeded, or the task does not apply to the application.
pub const OK: i32 = 0;
/// Invalid documents, configuration, arguments, or an I/O failure.
pub const INVALID: i32 = 1;
/// Required parameters have no value; nothing was executed.
pub const UNRESOLVED: i32 = 2;
/// A run started and halted on a failed command.
pub const HALTED: i32 = 3;
