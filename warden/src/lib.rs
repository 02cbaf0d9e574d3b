//! Risk-tiered admission control for autonomous task execution.
//!
//! Each pending task is scored, routed to one of four decisions, optionally
//! validated in an isolated sandbox with a bounded fix loop, and finally
//! committed against live state under snapshot-and-rollback protection.
//!
//! - **[`core`]**: Pure, deterministic logic (risk scoring, routing, trace
//!   scoring, operation planning, the task state machine). No I/O.
//! - **[`io`]**: Side-effecting adapters (config, state store, task source,
//!   snapshots, sinks, locks) behind traits so tests can swap them.
//!
//! Orchestration modules ([`sandbox`], [`production`], [`heartbeat`],
//! [`commands`]) compose the two into the CLI commands.

pub mod commands;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod heartbeat;
pub mod io;
pub mod logging;
pub mod production;
pub mod sandbox;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
