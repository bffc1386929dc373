//! Strato application server.
//!
//! Process roles, selected from the environment:
//!
//! - **worker** (`CLUSTER_MODE=true`): serve HTTP on the assigned port,
//!   obey the supervisor over stdio IPC.
//! - **supervisor** (`cluster.enabled` and not disabled by env): spawn
//!   and coordinate workers; fall back to serving in-process when worker
//!   startup fails.
//! - **single process**: everything else, including multi-server mode.

use std::sync::Arc;

use strato_rs::app::App;
use strato_rs::cluster::supervisor::{ClusterStartOutcome, ClusterSupervisor};
use strato_rs::cluster::worker::{run_worker, AppFactory};
use strato_rs::config::{is_worker_process, load_config};
use strato_rs::config::validation::ConfigValidator;
use strato_rs::logs::logger::configure_logger;
use strato_rs::models::config::ServerConfig;
use strato_rs::models::context::Response;
use strato_rs::models::route::handler_fn;
use strato_rs::server::run_app;
use strato_rs::services::multi_server::MultiServerController;

use log::{error, info};
use serde_json::json;
use tokio::signal;

/// Builds the served application for a configuration snapshot. Shared by
/// every process role so workers and the fallback parent agree on routes.
fn app_factory() -> AppFactory {
    Arc::new(|config: ServerConfig| {
        let app = App::new(config);
        let register = app.get(
            "/",
            handler_fn(|_req| async move {
                let mut res = Response::new();
                res.send_json(&json!({
                    "service": "strato",
                    "version": env!("CARGO_PKG_VERSION"),
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                }))?;
                Ok(res)
            }),
        );
        if let Err(e) = register {
            error!("failed to register root route: {}", e);
        }
        app
    })
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    configure_logger();

    // Workers reconstruct their configuration from the environment the
    // supervisor prepared; everything else loads the config file.
    if is_worker_process() {
        if let Err(e) = run_worker(app_factory()).await {
            error!("worker failed: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Strato v{}", env!("CARGO_PKG_VERSION"));

    let validation = ConfigValidator::validate_comprehensive(&config);
    if !validation.is_valid {
        error!("configuration validation failed:");
        for e in &validation.errors {
            error!("  - {}", e);
        }
        std::process::exit(1);
    }
    info!(
        "configuration validated with {} warning(s)",
        validation.warnings.len()
    );

    let factory = app_factory();

    if config.multi_server.enabled {
        let app = factory(config.clone());
        let controller = MultiServerController::from_config(&config.multi_server);
        let report = controller.start(&app);
        info!(
            "multi-server: {} started, {} failed",
            report.started_count(),
            report.failed_count()
        );
        if report.started_count() == 0 {
            error!("multi-server: no instance could start");
            std::process::exit(1);
        }
        signal::ctrl_c().await?;
        info!("shutdown signal received");
        report.stop_all().await;
        return Ok(());
    }

    if config.cluster.enabled {
        let supervisor = ClusterSupervisor::new(Arc::new(config.clone()));
        match supervisor.start().await {
            Ok(ClusterStartOutcome::Clustered { workers }) => {
                info!("cluster: supervising {} worker(s)", workers);
                signal::ctrl_c().await?;
                info!("shutdown signal received");
                supervisor.shutdown().await;
                return Ok(());
            }
            Ok(ClusterStartOutcome::SingleProcessFallback) => {
                // Keep handling requests in this process; clustering is
                // gone but the server is not.
                let app = factory(config);
                app.role().set("master");
                if let Err(e) = run_app(app).await {
                    error!("server failed: {}", e);
                    std::process::exit(1);
                }
                return Ok(());
            }
            Err(e) => {
                error!("cluster startup error: {}", e);
                std::process::exit(1);
            }
        }
    }

    let app = factory(config);
    if let Err(e) = run_app(app).await {
        error!("server failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
