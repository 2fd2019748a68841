//! Process-wide, read-only session statistics for the admin surface.
//!
//! Counters are aggregated per target server: reads and writes routed to
//! it, how many sessions touched it, and how long those sessions ran
//! (total and the fraction spent waiting on a backend reply, the same
//! `AwaitingReply` state `session::SessionState` already tracks). A
//! session updates this once, when it closes, rather than on every
//! packet, since the admin surface only needs eventually-consistent
//! numbers refreshed on a scrape interval.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct TargetCounters {
    pub sessions: AtomicU64,
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub total_duration_micros: AtomicU64,
    pub active_duration_micros: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct TargetStats {
    pub server: String,
    pub sessions: u64,
    pub reads: u64,
    pub writes: u64,
    pub mean_session_duration_micros: u64,
    pub mean_active_fraction: f64,
}

/// What one session reports about itself for each server it talked to.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionSummary {
    pub reads: u64,
    pub writes: u64,
}

#[derive(Default)]
pub struct SessionStats {
    targets: DashMap<String, TargetCounters>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the end of a session: `per_server` is what the session did
    /// against each server it opened a channel to; `total` and `active`
    /// are the whole session's wall-clock duration and the portion of it
    /// spent waiting on a backend (`SessionState::AwaitingReply`).
    pub fn record_session(
        &self,
        per_server: &std::collections::HashMap<String, SessionSummary>,
        total: Duration,
        active: Duration,
    ) {
        for (server, summary) in per_server {
            let entry = self.targets.entry(server.clone()).or_default();
            entry.sessions.fetch_add(1, Ordering::Relaxed);
            entry.reads.fetch_add(summary.reads, Ordering::Relaxed);
            entry.writes.fetch_add(summary.writes, Ordering::Relaxed);
            entry
                .total_duration_micros
                .fetch_add(total.as_micros() as u64, Ordering::Relaxed);
            entry
                .active_duration_micros
                .fetch_add(active.as_micros() as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> Vec<TargetStats> {
        self.targets
            .iter()
            .map(|entry| {
                let server = entry.key().clone();
                let counters = entry.value();
                let sessions = counters.sessions.load(Ordering::Relaxed);
                let total_micros = counters.total_duration_micros.load(Ordering::Relaxed);
                let active_micros = counters.active_duration_micros.load(Ordering::Relaxed);
                TargetStats {
                    server,
                    sessions,
                    reads: counters.reads.load(Ordering::Relaxed),
                    writes: counters.writes.load(Ordering::Relaxed),
                    mean_session_duration_micros: if sessions > 0 { total_micros / sessions } else { 0 },
                    mean_active_fraction: if total_micros > 0 {
                        active_micros as f64 / total_micros as f64
                    } else {
                        0.0
                    },
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_across_multiple_sessions_against_the_same_server() {
        let stats = SessionStats::new();
        let mut per_server = std::collections::HashMap::new();
        per_server.insert("r1".to_string(), SessionSummary { reads: 3, writes: 1 });
        stats.record_session(&per_server, Duration::from_millis(100), Duration::from_millis(40));
        stats.record_session(&per_server, Duration::from_millis(200), Duration::from_millis(40));

        let snapshot = stats.snapshot();
        let r1 = snapshot.iter().find(|t| t.server == "r1").unwrap();
        assert_eq!(r1.sessions, 2);
        assert_eq!(r1.reads, 6);
        assert_eq!(r1.writes, 2);
        assert_eq!(r1.mean_session_duration_micros, 150_000);
    }
}
