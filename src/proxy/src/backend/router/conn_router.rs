//! Least-loaded connection router (§4.7): binds one backend at session
//! start and sticks to it for the session lifetime.

use crate::backend::registry::{Registry, StatusFlags};
use crate::backend::router::{pick_least_loaded, RouteTarget, RoutingError, SessionRouter, SessionView};
use crate::classifier::Classification;

#[derive(Debug, Clone)]
pub struct ConnRouterConfig {
    pub role_mask: StatusFlags,
    pub max_replication_lag: Option<u32>,
}

impl Default for ConnRouterConfig {
    fn default() -> Self {
        Self {
            role_mask: StatusFlags::RUNNING,
            max_replication_lag: None,
        }
    }
}

pub struct ConnRouter {
    config: ConnRouterConfig,
    bound: Option<String>,
}

impl ConnRouter {
    pub fn new(config: ConnRouterConfig) -> Self {
        Self { config, bound: None }
    }
}

impl SessionRouter for ConnRouter {
    fn route_query(
        &mut self,
        registry: &Registry,
        _view: SessionView<'_>,
        _classification: &Classification,
        _hints: &[crate::backend::router::Hint],
    ) -> Result<RouteTarget, RoutingError> {
        if let Some(name) = &self.bound {
            // Mid-session: the bound server must still satisfy the role mask.
            if let Some(server) = registry.get(name) {
                if server.snapshot().status.contains(self.config.role_mask) {
                    return Ok(RouteTarget::One(name.clone()));
                }
            }
            return Err(RoutingError::NoTarget);
        }

        let picked = pick_least_loaded(registry, self.config.role_mask, self.config.max_replication_lag)
            .ok_or(RoutingError::NoTarget)?;
        self.bound = Some(picked.clone());
        Ok(RouteTarget::One(picked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::registry::Server;
    use crate::classifier::{classify, OpCode};

    fn classification() -> Classification {
        classify(b"SELECT 1").unwrap()
    }

    #[test]
    fn binds_once_and_then_sticks() {
        let registry = Registry::new();
        registry.register(Server::new("r1", "h1", 3306, 1));
        registry.publish("r1", StatusFlags::RUNNING | StatusFlags::REPLICA, 0);
        let mut router = ConnRouter::new(ConnRouterConfig {
            role_mask: StatusFlags::RUNNING,
            max_replication_lag: None,
        });
        let view = SessionView { open_backends: &[], write_backend: None };
        let first = router.route_query(&registry, view, &classification(), &[]).unwrap();
        assert_eq!(first, RouteTarget::One("r1".to_string()));

        let view = SessionView { open_backends: &["r1".to_string()], write_backend: None };
        let second = router.route_query(&registry, view, &classification(), &[]).unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn fails_once_bound_server_leaves_role_mask() {
        let registry = Registry::new();
        registry.register(Server::new("r1", "h1", 3306, 1));
        registry.publish("r1", StatusFlags::RUNNING, 0);
        let mut router = ConnRouter::new(ConnRouterConfig::default());
        let view = SessionView { open_backends: &[], write_backend: None };
        router.route_query(&registry, view, &classification(), &[]).unwrap();

        registry.publish("r1", StatusFlags::empty(), 0);
        let view = SessionView { open_backends: &["r1".to_string()], write_backend: None };
        let result = router.route_query(&registry, view, &classification(), &[]);
        assert_eq!(result, Err(RoutingError::NoTarget));
    }

    #[test]
    fn op_code_is_select_for_plain_query() {
        assert_eq!(classification().op, OpCode::Select);
    }
}
