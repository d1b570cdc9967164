//! Observability Module
//!
//! In-process tracking of active scans, logged as tables.

mod common;
mod scan_tracker;

pub use scan_tracker::{ScanPhase, ScanTracker};
