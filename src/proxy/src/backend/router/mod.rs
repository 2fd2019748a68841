//! Router policy contract and the three concrete routers.
//!
//! Per design note: dynamic dispatch is kept at exactly one point on this
//! hot path (`SessionRouter::route_query`); which concrete router backs a
//! session is a tagged enum, not a trait object hierarchy.

pub mod conn_router;
pub mod hint_router;
pub mod rw_split_router;

use crate::backend::registry::{Registry, StatusFlags};
use crate::backend::router::conn_router::{ConnRouter, ConnRouterConfig};
use crate::backend::router::hint_router::{DefaultAction, HintRouter};
use crate::backend::router::rw_split_router::RwSplitRouter;
use crate::classifier::Classification;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    Primary,
    Replica,
    Named(String),
    All,
}

/// Result of a routing decision for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    One(String),
    FanOut(Vec<String>),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no backend satisfies the current role mask and replication-lag bound")]
    NoTarget,
    #[error("no open backend candidate for this statement")]
    NoBackend,
}

/// A router's view of a session: which servers it currently has an open
/// channel to, keyed by server name, and which of those is the designated
/// write backend (if the policy has one).
pub struct SessionView<'a> {
    pub open_backends: &'a [String],
    pub write_backend: Option<&'a str>,
}

/// Per-session routing state. Each concrete router owns the state it needs
/// (bound server, round-robin cursor, in-transaction flag, ...).
pub trait SessionRouter: Send {
    fn route_query(
        &mut self,
        registry: &Registry,
        view: SessionView<'_>,
        classification: &Classification,
        hints: &[Hint],
    ) -> Result<RouteTarget, RoutingError>;
}

/// Filters `registry.list()` down to servers matching `role_mask`, preferring
/// lower rank, then fewer currently-open connections, then fewer cumulative
/// connections; rejects replicas exceeding `max_replication_lag` when it is
/// set (`> 0`). Falls back to a usable primary if nothing else qualifies.
pub fn pick_least_loaded(
    registry: &Registry,
    role_mask: StatusFlags,
    max_replication_lag: Option<u32>,
) -> Option<String> {
    let mut candidates: Vec<_> = registry
        .list()
        .into_iter()
        .filter(|s| s.snapshot().status.contains(role_mask))
        .filter(|s| {
            if let Some(bound) = max_replication_lag {
                if s.snapshot().status.contains(StatusFlags::REPLICA) {
                    return s.snapshot().lag_seconds <= bound;
                }
            }
            true
        })
        .collect();

    candidates.sort_by_key(|s| {
        (
            s.rank,
            s.counters.currently_open.load(std::sync::atomic::Ordering::Relaxed),
            s.counters.connections_opened.load(std::sync::atomic::Ordering::Relaxed),
        )
    });

    if let Some(best) = candidates.first() {
        return Some(best.name.clone());
    }

    registry
        .list()
        .into_iter()
        .find(|s| s.snapshot().status.contains(StatusFlags::PRIMARY | StatusFlags::RUNNING))
        .map(|s| s.name.clone())
}

/// Which router policy a session should run, and the parameters it needs.
/// One value configures the whole process; `build` is called fresh for
/// every new session, since every concrete router keeps per-session state.
#[derive(Debug, Clone)]
pub enum RouterConfig {
    Conn(ConnRouterConfig),
    Hint(DefaultAction),
    RwSplit { write_backend: String },
}

impl RouterConfig {
    pub fn build(&self) -> Box<dyn SessionRouter> {
        match self {
            RouterConfig::Conn(config) => Box::new(ConnRouter::new(config.clone())),
            RouterConfig::Hint(default_action) => Box::new(HintRouter::new(default_action.clone())),
            RouterConfig::RwSplit { write_backend } => Box::new(RwSplitRouter::new(write_backend.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::registry::Server;

    #[test]
    fn picks_lowest_rank_among_running_replicas() {
        let registry = Registry::new();
        registry.register(Server::new("r1", "h1", 3306, 2));
        registry.register(Server::new("r2", "h2", 3306, 1));
        registry.publish("r1", StatusFlags::RUNNING | StatusFlags::REPLICA, 0);
        registry.publish("r2", StatusFlags::RUNNING | StatusFlags::REPLICA, 0);
        let picked = pick_least_loaded(&registry, StatusFlags::RUNNING | StatusFlags::REPLICA, None);
        assert_eq!(picked, Some("r2".to_string()));
    }

    #[test]
    fn falls_back_to_primary_when_no_replica_qualifies() {
        let registry = Registry::new();
        registry.register(Server::new("m", "h", 3306, 0));
        registry.publish("m", StatusFlags::RUNNING | StatusFlags::PRIMARY, 0);
        let picked = pick_least_loaded(&registry, StatusFlags::RUNNING | StatusFlags::REPLICA, None);
        assert_eq!(picked, Some("m".to_string()));
    }
}
