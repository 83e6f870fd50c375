//! HTTP Gateway
//!
//! OpenAI-compatible chat completion endpoint plus a small JSON monitoring
//! surface, served with axum.

mod auth;
pub mod error;
mod routes;

pub use error::{ApiError, ErrorResponse};

use crate::config::{ConfigLoader, GatewayConfig};
use crate::error::Result;
use crate::router::RetryCoordinator;
use crate::stats::StatsCollector;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Everything built from one configuration. Replaced as a whole on reload;
/// requests already running keep the runtime they started with.
#[derive(Debug)]
pub struct Runtime {
    pub config: GatewayConfig,
    pub coordinator: RetryCoordinator,
}

impl Runtime {
    pub fn build(config: GatewayConfig, stats: Arc<StatsCollector>) -> Result<Self> {
        let coordinator = RetryCoordinator::from_config(&config, stats)?;
        Ok(Self {
            config,
            coordinator,
        })
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    runtime: Arc<RwLock<Arc<Runtime>>>,
    stats: Arc<StatsCollector>,
    loader: Arc<Mutex<ConfigLoader>>,
}

impl AppState {
    pub fn new(loader: ConfigLoader) -> Result<Self> {
        let config = loader.config().clone();
        let stats = Arc::new(StatsCollector::new(&config.stats));
        let runtime = Runtime::build(config, stats.clone())?;

        Ok(Self {
            runtime: Arc::new(RwLock::new(Arc::new(runtime))),
            stats,
            loader: Arc::new(Mutex::new(loader)),
        })
    }

    /// The runtime in effect right now
    pub fn runtime(&self) -> Arc<Runtime> {
        self.runtime.read().clone()
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    /// Re-read the configuration file and swap in a fresh key pool.
    ///
    /// Statistics survive. On any error the running configuration stays.
    pub fn reload(&self) -> Result<Arc<Runtime>> {
        let config = {
            let mut loader = self.loader.lock();
            loader.reload()?.clone()
        };

        let runtime = Arc::new(Runtime::build(config, self.stats.clone())?);
        *self.runtime.write() = runtime.clone();

        tracing::info!(
            keys = runtime.coordinator.pool().len(),
            "configuration reloaded"
        );
        Ok(runtime)
    }
}

/// Build the gateway router
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(routes::chat_completions))
        .route("/api/stats", get(routes::stats))
        .route("/api/stats/logs", get(routes::logs))
        .route("/api/stats/reset", post(routes::reset_stats))
        .route("/api/keys", get(routes::keys))
        .route("/api/config/reload", post(routes::reload_config))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_caller_secret,
        ));

    Router::new()
        .route("/api", get(routes::status))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the gateway on a bound listener until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("keyrelay listening on http://{addr}");
    tracing::info!("OpenAI base URL for clients: http://{addr}/v1");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    tracing::info!("keyrelay shut down");
    Ok(())
}
