//! Stable exit codes for warden CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid layout/config/input or other errors.
pub const INVALID: i32 = 1;
/// `warden cycle` observed the kill-switch and did not process tasks.
pub const HALTED: i32 = 2;
/// A rollback did not verify; manual intervention is required.
pub const ROLLBACK_FAILED: i32 = 3;
/// `warden verify` found live state drifted from the snapshot.
pub const DRIFT: i32 = 4;
