//! Stateful per-session round-robin read/write split router (§4.8).

use crate::backend::router::{Hint, RouteTarget, RoutingError, SessionRouter, SessionView};
use crate::backend::registry::Registry;
use crate::classifier::{Classification, TypeMask};

pub struct RwSplitRouter {
    write_backend: String,
    rr_cursor: usize,
    in_transaction: bool,
}

impl RwSplitRouter {
    pub fn new(write_backend: impl Into<String>) -> Self {
        Self {
            write_backend: write_backend.into(),
            rr_cursor: 0,
            in_transaction: false,
        }
    }

    fn update_transaction_flag(&mut self, mask: TypeMask) {
        if mask.contains(TypeMask::BEGIN_TRX) {
            self.in_transaction = true;
        } else if mask.contains(TypeMask::COMMIT) || mask.contains(TypeMask::ROLLBACK) {
            self.in_transaction = false;
        }
    }
}

impl SessionRouter for RwSplitRouter {
    fn route_query(
        &mut self,
        _registry: &Registry,
        view: SessionView<'_>,
        classification: &Classification,
        _hints: &[Hint],
    ) -> Result<RouteTarget, RoutingError> {
        let mask = classification.type_mask;

        if mask.contains(TypeMask::SESSION_WRITE) {
            self.update_transaction_flag(mask);
            if view.open_backends.is_empty() {
                return Err(RoutingError::NoBackend);
            }
            return Ok(RouteTarget::FanOut(view.open_backends.to_vec()));
        }

        let routes_to_write = mask.intersects(
            TypeMask::WRITE
                | TypeMask::MASTER_READ
                | TypeMask::BEGIN_TRX
                | TypeMask::CREATE_TMP_TABLE
                | TypeMask::READ_TMP_TABLE,
        ) || self.in_transaction;

        self.update_transaction_flag(mask);

        if routes_to_write {
            return Ok(RouteTarget::One(self.write_backend.clone()));
        }

        let candidates: Vec<&String> = view
            .open_backends
            .iter()
            .filter(|name| name.as_str() != self.write_backend)
            .collect();
        if candidates.is_empty() {
            return Err(RoutingError::NoBackend);
        }
        let idx = self.rr_cursor % candidates.len();
        self.rr_cursor = self.rr_cursor.wrapping_add(1);
        Ok(RouteTarget::One(candidates[idx].clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify;

    fn view<'a>(open: &'a [String]) -> SessionView<'a> {
        SessionView { open_backends: open, write_backend: Some("m") }
    }

    #[test]
    fn reads_round_robin_over_replicas_excluding_write_backend() {
        let registry = Registry::new();
        let mut router = RwSplitRouter::new("m");
        let open = vec!["m".to_string(), "r1".to_string(), "r2".to_string()];

        let c = classify(b"SELECT 1").unwrap();
        let first = router.route_query(&registry, view(&open), &c, &[]).unwrap();
        let second = router.route_query(&registry, view(&open), &c, &[]).unwrap();
        assert_ne!(first, second);
        assert!(matches!(first, RouteTarget::One(ref s) if s != "m"));
        assert!(matches!(second, RouteTarget::One(ref s) if s != "m"));
    }

    #[test]
    fn writes_always_go_to_write_backend() {
        let registry = Registry::new();
        let mut router = RwSplitRouter::new("m");
        let open = vec!["m".to_string(), "r1".to_string()];
        let c = classify(b"INSERT INTO t VALUES (1)").unwrap();
        let target = router.route_query(&registry, view(&open), &c, &[]).unwrap();
        assert_eq!(target, RouteTarget::One("m".to_string()));
    }

    #[test]
    fn everything_between_begin_and_commit_sticks_to_write_backend() {
        let registry = Registry::new();
        let mut router = RwSplitRouter::new("m");
        let open = vec!["m".to_string(), "r1".to_string()];

        let begin = classify(b"BEGIN").unwrap();
        assert_eq!(
            router.route_query(&registry, view(&open), &begin, &[]).unwrap(),
            RouteTarget::One("m".to_string())
        );

        let select = classify(b"SELECT 1").unwrap();
        assert_eq!(
            router.route_query(&registry, view(&open), &select, &[]).unwrap(),
            RouteTarget::One("m".to_string())
        );

        let commit = classify(b"COMMIT").unwrap();
        assert_eq!(
            router.route_query(&registry, view(&open), &commit, &[]).unwrap(),
            RouteTarget::One("m".to_string())
        );

        let select_after = classify(b"SELECT 2").unwrap();
        let after = router.route_query(&registry, view(&open), &select_after, &[]).unwrap();
        assert_eq!(after, RouteTarget::One("r1".to_string()));
    }

    #[test]
    fn session_write_fans_out_to_every_open_backend() {
        let registry = Registry::new();
        let mut router = RwSplitRouter::new("m");
        let open = vec!["m".to_string(), "r1".to_string(), "r2".to_string()];
        let c = classify(b"SET autocommit=0").unwrap();
        let target = router.route_query(&registry, view(&open), &c, &[]).unwrap();
        assert_eq!(target, RouteTarget::FanOut(open));
    }
}
