//! Construction progress tracking: hierarchical progress roll-up, idempotent
//! daily snapshots, and an offline-first time clock.
//!
//! # Conventions
//!
//! - **Errors**: library functions return [`error::Result`]; the binary wraps
//!   them in `anyhow`.
//! - **Logging**: `tracing` macros; the subscriber is installed by the binary.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod progress;
pub mod snapshot;
pub mod sync;
pub mod tracker;
pub mod types;

pub use error::{Error, Result};
