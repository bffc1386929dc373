//! The multi-server controller: several independent HTTP servers in one
//! process, each serving a partition of the registered routes.
//!
//! Partitioning rule per (server, route): the route is assigned iff the
//! instance has no filter at all, or its `route_prefix` prefixes the
//! route's path, or one of its `allowed_routes` patterns matches (exact
//! path or trailing-`/*` wildcard). Start and stop run concurrently
//! across instances and aggregate per-instance results — one instance
//! failing to bind never stops the others.

use crate::app::App;
use crate::models::config::ServerInstanceConfig;
use crate::models::error::AppError;
use crate::models::route::Route;
use crate::server::{spawn_server, RunningServer};
use crate::utils::path::normalize;
use log::{error, info, warn};

/// Whether `instance` serves a route registered at `pattern`.
pub fn allows_route(instance: &ServerInstanceConfig, pattern: &str) -> bool {
    let path = normalize(pattern);
    let no_filter = instance.route_prefix.is_none() && instance.allowed_routes.is_none();
    if no_filter {
        return true;
    }
    if let Some(prefix) = &instance.route_prefix {
        if path.starts_with(normalize(prefix).as_str()) {
            return true;
        }
    }
    if let Some(patterns) = &instance.allowed_routes {
        for allowed in patterns {
            if let Some(prefix) = allowed.strip_suffix("/*") {
                if path.starts_with(&normalize(prefix)) {
                    return true;
                }
            } else if normalize(allowed) == path {
                return true;
            }
        }
    }
    false
}

/// One instance's startup outcome inside a composite report.
#[derive(Debug)]
pub enum InstanceOutcome {
    Started { id: String, port: u16 },
    Failed { id: String, error: AppError },
}

/// Composite result of starting all configured instances.
pub struct MultiServerReport {
    pub servers: Vec<RunningServer>,
    pub outcomes: Vec<InstanceOutcome>,
}

impl MultiServerReport {
    pub fn started_count(&self) -> usize {
        self.servers.len()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, InstanceOutcome::Failed { .. }))
            .count()
    }

    /// Stops every running instance, waiting for graceful completion.
    pub async fn stop_all(self) {
        let stops = self
            .servers
            .iter()
            .map(|s| s.handle.stop(true))
            .collect::<Vec<_>>();
        futures::future::join_all(stops).await;
    }
}

pub struct MultiServerController {
    instances: Vec<ServerInstanceConfig>,
}

impl MultiServerController {
    pub fn new(instances: Vec<ServerInstanceConfig>) -> Self {
        Self { instances }
    }

    pub fn from_config(config: &crate::models::config::MultiServerSection) -> Self {
        Self::new(config.servers.clone())
    }

    /// Routes assigned to each instance, in configuration order.
    pub fn distribute(&self, routes: &[Route]) -> Vec<(ServerInstanceConfig, Vec<Route>)> {
        self.instances
            .iter()
            .map(|instance| {
                let assigned: Vec<Route> = routes
                    .iter()
                    .filter(|r| allows_route(instance, &r.pattern))
                    .cloned()
                    .collect();
                (instance.clone(), assigned)
            })
            .collect()
    }

    /// Starts every configured instance against partitions of `app`'s
    /// routes. Failures are collected, not propagated.
    pub fn start(&self, app: &App) -> MultiServerReport {
        let routes = app.routes_snapshot();
        let mut servers = Vec::new();
        let mut outcomes = Vec::new();

        for (instance, assigned) in self.distribute(&routes) {
            let host = instance
                .host
                .clone()
                .unwrap_or_else(|| app.config().server.host.clone());
            info!(
                "multi-server '{}': {} route(s) on {}:{}",
                instance.id,
                assigned.len(),
                host,
                instance.port
            );
            if assigned.is_empty() {
                warn!("multi-server '{}': no routes assigned", instance.id);
            }
            let dispatcher = app.build_partition_dispatcher(&assigned);
            match spawn_server(dispatcher, &host, instance.port) {
                Ok(running) => {
                    outcomes.push(InstanceOutcome::Started {
                        id: instance.id.clone(),
                        port: running.port,
                    });
                    servers.push(running);
                }
                Err(e) => {
                    error!("multi-server '{}' failed to start: {}", instance.id, e);
                    outcomes.push(InstanceOutcome::Failed {
                        id: instance.id.clone(),
                        error: AppError::Internal {
                            message: e.to_string(),
                        },
                    });
                }
            }
        }

        MultiServerReport { servers, outcomes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(
        id: &str,
        prefix: Option<&str>,
        allowed: Option<Vec<&str>>,
    ) -> ServerInstanceConfig {
        ServerInstanceConfig {
            id: id.to_string(),
            port: 0,
            host: None,
            route_prefix: prefix.map(|s| s.to_string()),
            allowed_routes: allowed.map(|v| v.into_iter().map(|s| s.to_string()).collect()),
        }
    }

    #[test]
    fn no_filter_accepts_everything() {
        let i = instance("open", None, None);
        assert!(allows_route(&i, "/anything"));
        assert!(allows_route(&i, "/"));
    }

    #[test]
    fn prefix_filter() {
        let i = instance("api", Some("/api"), None);
        assert!(allows_route(&i, "/api/x"));
        assert!(allows_route(&i, "/api"));
        assert!(!allows_route(&i, "/pub/y"));
    }

    #[test]
    fn root_prefix_accepts_everything() {
        let i = instance("catchall", Some("/"), None);
        assert!(allows_route(&i, "/pub/y"));
        assert!(allows_route(&i, "/api/x"));
    }

    #[test]
    fn allow_list_exact_and_wildcard() {
        let i = instance("picky", None, Some(vec!["/exact", "/tree/*"]));
        assert!(allows_route(&i, "/exact"));
        assert!(!allows_route(&i, "/exact/child"));
        assert!(allows_route(&i, "/tree/a/b"));
        assert!(!allows_route(&i, "/other"));
    }

    #[test]
    fn distribution_partitions_routes() {
        use crate::models::context::Response;
        use crate::models::route::{handler_fn, Method};

        let controller = MultiServerController::new(vec![
            instance("a", Some("/api"), None),
            instance("b", Some("/"), None),
        ]);
        let mk = |pattern: &str| {
            Route::new(
                Method::Get,
                pattern,
                handler_fn(|_req| async move {
                    let mut res = Response::new();
                    res.send_text("ok")?;
                    Ok(res)
                }),
            )
        };
        let routes = vec![mk("/api/x"), mk("/pub/y")];
        let parts = controller.distribute(&routes);
        assert_eq!(parts[0].1.len(), 1);
        assert_eq!(parts[0].1[0].pattern, "/api/x");
        assert_eq!(parts[1].1.len(), 2);
    }
}
