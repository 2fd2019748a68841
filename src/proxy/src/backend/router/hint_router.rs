//! Hint-driven router (§4.9): tries each attached hint in order, falling
//! back to a configured default action when the hints list is empty or
//! every hint's precondition fails.

use crate::backend::registry::{Registry, StatusFlags};
use crate::backend::router::{Hint, RouteTarget, RoutingError, SessionRouter, SessionView};
use crate::classifier::Classification;

#[derive(Debug, Clone)]
pub enum DefaultAction {
    Primary,
    Replica,
    Named(String),
    All,
}

pub struct HintRouter {
    default_action: DefaultAction,
    rr_cursor: usize,
}

impl HintRouter {
    pub fn new(default_action: DefaultAction) -> Self {
        Self { default_action, rr_cursor: 0 }
    }

    fn find_primary(&self, registry: &Registry, view: &SessionView<'_>) -> Option<String> {
        view.open_backends
            .iter()
            .find(|name| {
                registry
                    .get(name)
                    .map(|s| s.snapshot().status.contains(StatusFlags::PRIMARY))
                    .unwrap_or(false)
            })
            .cloned()
            .or_else(|| view.write_backend.map(|s| s.to_string()))
    }

    fn next_replica(&mut self, registry: &Registry, view: &SessionView<'_>) -> Option<String> {
        let primary = self.find_primary(registry, view);
        let candidates: Vec<&String> = view
            .open_backends
            .iter()
            .filter(|name| Some(name.as_str()) != primary.as_deref())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = self.rr_cursor % candidates.len();
        self.rr_cursor = self.rr_cursor.wrapping_add(1);
        Some(candidates[idx].clone())
    }

    fn try_hint(&mut self, registry: &Registry, view: &SessionView<'_>, hint: &Hint) -> Option<RouteTarget> {
        match hint {
            Hint::Primary => self.find_primary(registry, view).map(RouteTarget::One),
            Hint::Replica => self.next_replica(registry, view).map(RouteTarget::One),
            Hint::Named(name) => view
                .open_backends
                .iter()
                .find(|n| *n == name)
                .cloned()
                .map(RouteTarget::One),
            Hint::All => {
                if view.open_backends.is_empty() {
                    None
                } else {
                    Some(RouteTarget::FanOut(view.open_backends.to_vec()))
                }
            }
        }
    }

    fn apply_default(&mut self, registry: &Registry, view: &SessionView<'_>) -> Result<RouteTarget, RoutingError> {
        let action = self.default_action.clone();
        let hint = match action {
            DefaultAction::Primary => Hint::Primary,
            DefaultAction::Replica => Hint::Replica,
            DefaultAction::Named(name) => Hint::Named(name),
            DefaultAction::All => Hint::All,
        };
        self.try_hint(registry, view, &hint).ok_or(RoutingError::NoTarget)
    }
}

impl SessionRouter for HintRouter {
    fn route_query(
        &mut self,
        registry: &Registry,
        view: SessionView<'_>,
        _classification: &Classification,
        hints: &[Hint],
    ) -> Result<RouteTarget, RoutingError> {
        for hint in hints {
            if let Some(target) = self.try_hint(registry, &view, hint) {
                return Ok(target);
            }
        }
        self.apply_default(registry, &view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::registry::Server;
    use crate::classifier::classify;

    #[test]
    fn named_hint_routes_to_the_named_server() {
        let registry = Registry::new();
        registry.register(Server::new("m", "h", 3306, 0));
        registry.register(Server::new("r2", "h2", 3306, 0));
        registry.publish("m", StatusFlags::RUNNING | StatusFlags::PRIMARY, 0);
        let mut router = HintRouter::new(DefaultAction::Primary);
        let open = vec!["m".to_string(), "r2".to_string()];
        let view = SessionView { open_backends: &open, write_backend: Some("m") };
        let c = classify(b"SELECT 1").unwrap();
        let target = router
            .route_query(&registry, view, &c, &[Hint::Named("r2".to_string())])
            .unwrap();
        assert_eq!(target, RouteTarget::One("r2".to_string()));
    }

    #[test]
    fn falls_back_to_default_when_named_target_is_offline() {
        let registry = Registry::new();
        registry.register(Server::new("m", "h", 3306, 0));
        registry.publish("m", StatusFlags::RUNNING | StatusFlags::PRIMARY, 0);
        let mut router = HintRouter::new(DefaultAction::Primary);
        let open = vec!["m".to_string()];
        let view = SessionView { open_backends: &open, write_backend: Some("m") };
        let c = classify(b"SELECT 1").unwrap();
        let target = router
            .route_query(&registry, view, &c, &[Hint::Named("r2".to_string())])
            .unwrap();
        assert_eq!(target, RouteTarget::One("m".to_string()));
    }

    #[test]
    fn all_hint_fans_out() {
        let registry = Registry::new();
        let mut router = HintRouter::new(DefaultAction::Primary);
        let open = vec!["m".to_string(), "r1".to_string()];
        let view = SessionView { open_backends: &open, write_backend: Some("m") };
        let c = classify(b"SELECT 1").unwrap();
        let target = router.route_query(&registry, view, &c, &[Hint::All]).unwrap();
        assert_eq!(target, RouteTarget::FanOut(open));
    }
}
