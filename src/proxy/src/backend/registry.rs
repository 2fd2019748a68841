//! Named backend servers and the status/lag snapshot the monitor publishes for
//! each of them.
//!
//! A server's `(status, lag)` pair is packed into one `AtomicU64` so a reader
//! never observes a torn combination: the monitor always replaces the whole
//! pair in one store, and a reader always loads the whole pair in one load.
//! Everything else about a server (name, address, rank) is immutable after
//! construction.

use bitflags::bitflags;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u16 {
        const RUNNING   = 1 << 0;
        const PRIMARY   = 1 << 1;
        const REPLICA   = 1 << 2;
        const SYNCED    = 1 << 3;
        const MAINT     = 1 << 4;
        const DRAINING  = 1 << 5;
        const STALE     = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub status: StatusFlags,
    pub lag_seconds: u32,
}

impl Snapshot {
    fn pack(self) -> u64 {
        (self.status.bits() as u64) | ((self.lag_seconds as u64) << 16)
    }

    fn unpack(word: u64) -> Self {
        Snapshot {
            status: StatusFlags::from_bits_truncate((word & 0xFFFF) as u16),
            lag_seconds: (word >> 16) as u32,
        }
    }
}

#[derive(Debug, Default)]
pub struct ServerCounters {
    pub connections_opened: AtomicU64,
    pub currently_open: AtomicU64,
    pub auth_failures: AtomicU64,
}

/// One configured backend. Lives for the process lifetime once registered;
/// never relocated, only its snapshot and counters mutate.
#[derive(Debug)]
pub struct Server {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub rank: u32,
    snapshot: AtomicU64,
    in_maintenance: AtomicBool,
    pub counters: ServerCounters,
}

impl Server {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16, rank: u32) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            protocol: "mariadb".to_string(),
            rank,
            snapshot: AtomicU64::new(Snapshot::default().pack()),
            in_maintenance: AtomicBool::new(false),
            counters: ServerCounters::default(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::unpack(self.snapshot.load(Ordering::Acquire))
    }

    fn set_snapshot(&self, snapshot: Snapshot) {
        self.snapshot.store(snapshot.pack(), Ordering::Release);
    }

    pub fn in_maintenance(&self) -> bool {
        self.in_maintenance.load(Ordering::Acquire)
    }

    pub fn set_maintenance(&self, maint: bool) {
        self.in_maintenance.store(maint, Ordering::Release);
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn record_connection_opened(&self) {
        self.counters.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.counters.currently_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.counters.currently_open.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Named index of servers. Reads never block; the monitor is the only writer
/// of `publish`. Insertion order is preserved for `list()`.
#[derive(Debug, Default)]
pub struct Registry {
    servers: DashMap<String, Arc<Server>>,
    order: Mutex<Vec<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a server under its name. A second registration under the
    /// same name replaces the entry but does not reorder `list()`.
    pub fn register(&self, server: Server) -> Arc<Server> {
        let name = server.name.clone();
        let arc = Arc::new(server);
        if self.servers.insert(name.clone(), Arc::clone(&arc)).is_none() {
            self.order.lock().push(name);
        }
        arc
    }

    pub fn get(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Servers in the order they were first registered.
    pub fn list(&self) -> Vec<Arc<Server>> {
        let order = self.order.lock();
        order
            .iter()
            .filter_map(|name| self.servers.get(name).map(|e| Arc::clone(e.value())))
            .collect()
    }

    /// Monitor-only: publishes a new `(status, lag)` pair for `name`.
    pub fn publish(&self, name: &str, status: StatusFlags, lag_seconds: u32) {
        if let Some(server) = self.get(name) {
            server.set_snapshot(Snapshot { status, lag_seconds });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_get_is_self_consistent() {
        let registry = Registry::new();
        registry.register(Server::new("m", "127.0.0.1", 3306, 0));
        registry.publish("m", StatusFlags::RUNNING | StatusFlags::PRIMARY, 0);
        let snap = registry.get("m").unwrap().snapshot();
        assert_eq!(snap.status, StatusFlags::RUNNING | StatusFlags::PRIMARY);
        assert_eq!(snap.lag_seconds, 0);
    }

    #[test]
    fn list_preserves_insertion_order() {
        let registry = Registry::new();
        registry.register(Server::new("r2", "h2", 3306, 2));
        registry.register(Server::new("r1", "h1", 3306, 1));
        let names: Vec<_> = registry.list().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["r2", "r1"]);
    }

    #[test]
    fn counters_are_additive() {
        let server = Server::new("m", "h", 3306, 0);
        server.record_connection_opened();
        server.record_connection_opened();
        server.record_connection_closed();
        assert_eq!(server.counters.connections_opened.load(Ordering::Relaxed), 2);
        assert_eq!(server.counters.currently_open.load(Ordering::Relaxed), 1);
    }
}
