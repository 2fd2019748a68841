//! Read-only JSON views of registry, pool and session state for the admin
//! surface (`web_service`). Kept in `proxy` rather than built ad hoc in
//! `web_service` so the serialisable shape stays next to the state it
//! mirrors.

use crate::backend::registry::Registry;
use crate::stats::{SessionStats, TargetStats};
use serde::Serialize;
use std::sync::atomic::Ordering;

#[derive(Debug, Serialize)]
pub struct ServerView {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub rank: u32,
    pub status_bits: u16,
    pub lag_seconds: u32,
    pub in_maintenance: bool,
    pub connections_opened: u64,
    pub currently_open: u64,
    pub auth_failures: u64,
}

/// `GET /registry`.
pub fn registry_view(registry: &Registry) -> Vec<ServerView> {
    registry
        .list()
        .into_iter()
        .map(|server| {
            let snapshot = server.snapshot();
            ServerView {
                name: server.name.clone(),
                address: server.address.clone(),
                port: server.port,
                rank: server.rank,
                status_bits: snapshot.status.bits(),
                lag_seconds: snapshot.lag_seconds,
                in_maintenance: server.in_maintenance(),
                connections_opened: server.counters.connections_opened.load(Ordering::Relaxed),
                currently_open: server.counters.currently_open.load(Ordering::Relaxed),
                auth_failures: server.counters.auth_failures.load(Ordering::Relaxed),
            }
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct PoolView {
    pub server: String,
    /// Connections currently open to this server across every worker's
    /// pool. Workers own their pools independently (see `backend::pool`'s
    /// module doc), so this is the sum of worker-local state rather than a
    /// read of one shared structure.
    pub currently_open: u64,
}

/// `GET /pool`.
pub fn pool_view(registry: &Registry) -> Vec<PoolView> {
    registry
        .list()
        .into_iter()
        .map(|server| PoolView {
            server: server.name.clone(),
            currently_open: server.counters.currently_open.load(Ordering::Relaxed),
        })
        .collect()
}

/// `GET /sessions`.
pub fn sessions_view(stats: &SessionStats) -> Vec<TargetStats> {
    stats.snapshot()
}
