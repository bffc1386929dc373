//! HTTP engine bootstrap.
//!
//! Binds the acquired port and hands every connection to the dispatcher
//! through a single catch-all service; the engine parses HTTP/1.1 (and
//! HTTP/2 where negotiated), everything else — routing, middleware,
//! caching, lifecycle — happens in the dispatcher.

use crate::app::App;
use crate::models::error::AppError;
use crate::services::http::{
    request_from_actix, response_into_actix, RequestDispatcher,
};
use crate::services::port::PortAcquirer;
use actix_web::{web, App as ActixApp, HttpRequest, HttpResponse, HttpServer};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

/// Interval of the cache maintenance sweep.
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Swappable dispatcher slot. Requests read the current dispatcher per
/// call, so replacing it (a `config_update`) is atomic from the request's
/// point of view: a request sees the old snapshot or the new one, never a
/// mixture.
#[derive(Clone)]
pub struct DispatcherHandle(Arc<std::sync::RwLock<Arc<RequestDispatcher>>>);

impl DispatcherHandle {
    pub fn new(dispatcher: Arc<RequestDispatcher>) -> Self {
        Self(Arc::new(std::sync::RwLock::new(dispatcher)))
    }

    pub fn current(&self) -> Arc<RequestDispatcher> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn swap(&self, dispatcher: Arc<RequestDispatcher>) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = dispatcher;
    }
}

/// A running server instance: its bound address and control handle.
pub struct RunningServer {
    pub host: String,
    pub port: u16,
    pub handle: actix_web::dev::ServerHandle,
    pub dispatcher: DispatcherHandle,
    join: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    /// Waits for the server future to finish.
    pub async fn join(self) -> std::io::Result<()> {
        self.join.await.unwrap_or_else(|e| {
            Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })
    }
}

/// The catch-all entry: convert, dispatch, convert back.
async fn entry(
    req: HttpRequest,
    body: web::Bytes,
    holder: web::Data<DispatcherHandle>,
) -> HttpResponse {
    let dispatcher = holder.current();
    let request = match request_from_actix(&req, body, dispatcher.config()) {
        Ok(request) => request,
        Err(err) => {
            // Unknown method: 501 without entering the pipeline.
            return HttpResponse::build(
                actix_web::http::StatusCode::from_u16(err.status().as_u16())
                    .unwrap_or(actix_web::http::StatusCode::NOT_IMPLEMENTED),
            )
            .json(err.body());
        }
    };
    let response = dispatcher.dispatch_request(request).await;
    response_into_actix(response)
}

/// Binds `dispatcher` on `host:port` and spawns the server. The returned
/// handle stops it; `acquire` has already run, so binding is expected to
/// succeed barring races.
pub fn spawn_server(
    dispatcher: Arc<RequestDispatcher>,
    host: &str,
    port: u16,
) -> std::io::Result<RunningServer> {
    let holder = DispatcherHandle::new(dispatcher);
    let data = web::Data::new(holder.clone());
    let server = HttpServer::new(move || {
        ActixApp::new()
            .app_data(data.clone())
            .app_data(web::PayloadConfig::new(64 * 1024 * 1024))
            .default_service(web::to(entry))
    })
    .disable_signals()
    .bind((host, port))?
    .run();

    let handle = server.handle();
    let join = tokio::spawn(server);
    info!("listening on {}:{}", host, port);
    Ok(RunningServer {
        host: host.to_string(),
        port,
        handle,
        dispatcher: holder,
        join,
    })
}

/// Runs an app to completion: port acquisition, serving, and graceful
/// shutdown on ctrl-c. This is the single-process / worker serving path;
/// the cluster supervisor drives workers through their own entrypoint.
pub async fn run_app(app: App) -> Result<(), AppError> {
    let config = app.config().clone();
    let acquired = PortAcquirer::acquire(
        &config.server.host,
        config.server.port,
        &config.server.auto_port_switch,
    )?;

    let dispatcher = app.build_dispatcher();
    let _sweeper = app.cache().start_maintenance(CACHE_SWEEP_INTERVAL);

    let running = spawn_server(dispatcher, &config.server.host, acquired.port)
        .map_err(|e| AppError::Internal {
            message: format!("bind failed: {}", e),
        })?;
    let handle = running.handle.clone();
    let lifecycle = app.lifecycle().clone();
    let graceful =
        Duration::from_millis(config.cluster.process_management.graceful_shutdown_timeout_ms);

    tokio::select! {
        result = running.join() => {
            if let Err(e) = result {
                error!("server stopped with error: {}", e);
                return Err(AppError::Internal { message: e.to_string() });
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let drained = lifecycle.shutdown(graceful).await;
            handle.stop(drained).await;
        }
    }
    info!("server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::ServerConfig;
    use crate::models::context::Response;
    use crate::models::route::handler_fn;

    #[actix_web::test]
    async fn spawned_server_serves_requests() {
        let mut config = ServerConfig::default();
        config.security.csrf = false;
        let app = App::new(config);
        app.get(
            "/ping",
            handler_fn(|_req| async move {
                let mut res = Response::new();
                res.send_text("pong")?;
                Ok(res)
            }),
        )
        .unwrap();

        let probe = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let running = spawn_server(app.build_dispatcher(), "127.0.0.1", port).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let body = reqwest::get(format!("http://127.0.0.1:{}/ping", port))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "pong");

        running.handle.stop(true).await;
    }
}
