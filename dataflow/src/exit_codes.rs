//! Stable exit codes for dataflow CLI commands.

/// Pipeline ran to completion, or `check` found no problem.
pub const OK: i32 = 0;
/// At least one task failed or was cancelled.
pub const FAILED: i32 = 1;
/// The pipeline, its parameters or the configuration are invalid; nothing ran.
pub const INVALID: i32 = 2;
