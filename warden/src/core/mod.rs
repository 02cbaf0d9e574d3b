//! Deterministic, pure logic shared by the admission pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod fingerprint;
pub mod fix_rules;
pub mod operation;
pub mod retention;
pub mod risk;
pub mod router;
pub mod score;
pub mod status;
pub mod types;
