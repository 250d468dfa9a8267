use crate::http_handler::*;
use crate::proxy_handler::{pool_status, route_status};

use anyhow::anyhow;
use axum::routing::get;
use axum::Router;
use proxy::backend::pool::ConnectionPool;
use proxy::server::router_server::RouterServer;
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

pub struct RouterRest;

/// Read-only view over the core's counters; the REST tier never mutates
/// router state.
#[derive(Clone)]
pub struct RouterRestState {
    routes: Vec<Arc<RouterServer>>,
    pool: Arc<ConnectionPool>,
}

impl RouterRestState {
    pub fn new(routes: Vec<Arc<RouterServer>>, pool: Arc<ConnectionPool>) -> Self {
        Self { routes, pool }
    }

    pub fn route(&self, name: &str) -> Option<&Arc<RouterServer>> {
        self.routes.iter().find(|r| r.route_name() == name)
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

impl RouterRest {
    pub async fn start_server<F>(
        addr: String,
        port: u16,
        enable_metric: bool,
        state: RouterRestState,
        shutdown: F,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut app = Router::new()
            .route("/", get(|| async { "Hi I'm SqlRouterREST" }))
            .route("/routes/:name/status", get(route_status))
            .route("/connection_pool/main/status", get(pool_status))
            .with_state(state);

        if enable_metric {
            app = app.merge(route_metrics(MetricsHandler {}));
        }

        app = app.layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new()));
        let listener = tokio::net::TcpListener::bind(format!("{addr}:{port}")).await?;

        match axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => Err(anyhow!(e.to_string())),
        }
    }
}
