//! Scan Tracker Module
//!
//! Live view of running scans. Each scan is keyed by its session id and
//! removed once it reaches a terminal phase.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::info;
use uuid::Uuid;

use super::common::{format_elapsed_secs, format_table, Progress};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPhase {
    Listing,
    Detecting,
    Complete,
    Failed { error: String },
}

impl ScanPhase {
    fn short_name(&self) -> &str {
        match self {
            ScanPhase::Listing => "Listing",
            ScanPhase::Detecting => "Detecting",
            ScanPhase::Complete => "Complete",
            ScanPhase::Failed { .. } => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanPhase::Complete | ScanPhase::Failed { .. })
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanPhase::Failed { error } => write!(f, "Failed: {}", error),
            other => write!(f, "{}", other.short_name()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub user_id: Uuid,
    pub phase: ScanPhase,
    pub progress: Progress,
    pub found: u64,
    pub started_at: Instant,
}

/// Thread-safe tracker for active scans
#[derive(Clone, Default)]
pub struct ScanTracker {
    active_scans: Arc<RwLock<HashMap<Uuid, ScanEntry>>>,
}

impl ScanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry(&self, session_id: Uuid, f: impl FnOnce(&mut ScanEntry)) {
        let mut scans = self.active_scans.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = scans.get_mut(&session_id) {
            f(entry);
        }
    }

    pub fn register_scan(&self, session_id: Uuid, user_id: Uuid) {
        let entry = ScanEntry {
            user_id,
            phase: ScanPhase::Listing,
            progress: Progress::default(),
            found: 0,
            started_at: Instant::now(),
        };
        self.active_scans
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id, entry);
        self.log_state();
    }

    pub fn set_phase(&self, session_id: Uuid, phase: ScanPhase) {
        let terminal = phase.is_terminal();
        self.with_entry(session_id, |entry| entry.phase = phase);
        self.log_state();
        if terminal {
            self.remove_scan(session_id);
        }
    }

    pub fn set_estimated_total(&self, session_id: Uuid, total: u64) {
        self.with_entry(session_id, |entry| entry.progress.total = total);
    }

    pub fn set_counts(&self, session_id: Uuid, processed: u64, found: u64) {
        self.with_entry(session_id, |entry| {
            entry.progress.current = processed;
            entry.found = found;
        });
    }

    pub fn remove_scan(&self, session_id: Uuid) {
        self.active_scans
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session_id);
    }

    pub fn scan_count(&self) -> usize {
        self.active_scans
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn get_scan(&self, session_id: Uuid) -> Option<ScanEntry> {
        self.active_scans
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session_id)
            .cloned()
    }

    pub fn get_scans_table(&self) -> Option<String> {
        let scans = self.active_scans.read().unwrap_or_else(|e| e.into_inner());
        if scans.is_empty() {
            return None;
        }

        let headers = ["Session", "User", "Phase", "Progress", "Found", "Elapsed"];
        let mut rows: Vec<Vec<String>> = scans
            .iter()
            .map(|(session_id, s)| {
                vec![
                    session_id.to_string(),
                    s.user_id.to_string(),
                    s.phase.short_name().to_string(),
                    s.progress.format_progress(),
                    s.found.to_string(),
                    format_elapsed_secs(s.started_at.elapsed().as_secs()),
                ]
            })
            .collect();
        rows.sort_by(|a, b| a[0].cmp(&b[0]));

        Some(format!(
            "Scans ({}):\n{}",
            scans.len(),
            format_table(&headers, &rows)
        ))
    }

    pub fn log_state(&self) {
        if let Some(table) = self.get_scans_table() {
            info!("Scan Status Update:\n{}", table);
        }
    }
}
