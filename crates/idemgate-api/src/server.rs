//! API server implementation.
//!
//! Serves health, readiness and metrics endpoints alongside an application
//! router whose routes run behind the idempotency middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use idemgate_core::coordinator::Coordinator;
use idemgate_core::policy::PolicyResolver;
use idemgate_core::store::{MemoryStore, SharedStore};

use crate::config::Config;

// ============================================================================
// Health and Ready Responses
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
    /// Shared store backend name.
    pub store: String,
    /// Optional message about readiness state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared state for the middleware and system handlers.
///
/// Built once at startup; nothing in it changes while serving.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    coordinator: Coordinator,
    policies: PolicyResolver,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("coordinator", &self.coordinator)
            .field("routes", &self.policies.route_count())
            .finish()
    }
}

impl AppState {
    /// Creates application state over `store`.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn SharedStore>, policies: PolicyResolver) -> Self {
        let coordinator = Coordinator::new(store, config.key_prefix.clone());
        Self {
            config,
            coordinator,
            policies,
        }
    }

    /// Returns the coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Returns the policy resolver.
    #[must_use]
    pub const fn policies(&self) -> &PolicyResolver {
        &self.policies
    }
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Health check endpoint handler.
///
/// Returns 200 OK if the process is alive; dependencies are not checked.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness check endpoint handler.
///
/// Returns 200 OK when the shared store answers a ping.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = state.coordinator().store().name().to_string();
    match state.coordinator().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                store,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                store,
                message: Some(format!("store check failed: {e}")),
            }),
        ),
    }
}

/// The demonstration application: `POST /`.
#[must_use]
pub fn demo_routes() -> Router {
    Router::new().route("/", post(crate::demo::echo_with_delay))
}

// ============================================================================
// Server
// ============================================================================

/// The idemgate API server.
pub struct Server {
    config: Config,
    store: Arc<dyn SharedStore>,
    policies: PolicyResolver,
    app: Router,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("store", &self.store.name())
            .field("routes", &self.policies.route_count())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a server with an explicit store and policy resolver, serving
    /// the demonstration routes.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn SharedStore>, policies: PolicyResolver) -> Self {
        Self {
            config,
            store,
            policies,
            app: demo_routes(),
        }
    }

    /// Creates a new `ServerBuilder`.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the server configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Creates the router with all routes and middleware.
    fn create_router(&self) -> Router {
        let state = Arc::new(AppState::new(
            self.config.clone(),
            Arc::clone(&self.store),
            self.policies.clone(),
        ));

        let idempotency_layer = middleware::from_fn_with_state(
            Arc::clone(&state),
            crate::middleware::idempotency_middleware,
        );
        let metrics_layer = middleware::from_fn(crate::metrics::metrics_middleware);

        let system = Router::new()
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/metrics", get(crate::metrics::serve_metrics))
            .with_state(state);

        system
            .merge(self.app.clone().route_layer(idempotency_layer))
            // Metrics outermost for timing, then trace.
            .layer(TraceLayer::new_for_http())
            .layer(metrics_layer)
    }

    /// Starts the server and blocks until shutdown (Ctrl-C / SIGTERM).
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the port or fails while serving.
    pub async fn serve(&self) -> Result<()> {
        crate::metrics::init_metrics();

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = self.create_router();

        tracing::info!(
            http_port = self.config.http_port,
            store = self.store.name(),
            routes = self.policies.route_count(),
            failure_mode = ?self.config.store_failure_mode,
            "Starting idemgate API server"
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind to {addr}"))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("server error")?;

        tracing::info!("server stopped");
        Ok(())
    }

    /// Creates a test router for the server.
    ///
    /// Useful for integration tests that exercise the routes without binding
    /// to a port.
    #[doc(hidden)]
    pub fn test_router(&self) -> Router {
        self.create_router()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

/// Builder for constructing a server.
pub struct ServerBuilder {
    config: Config,
    store: Arc<dyn SharedStore>,
    policies: Option<PolicyResolver>,
    app: Router,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("store", &self.store.name())
            .field("policies", &self.policies.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            store: Arc::new(MemoryStore::new()),
            policies: None,
            app: demo_routes(),
        }
    }
}

impl ServerBuilder {
    /// Creates a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the HTTP port.
    #[must_use]
    pub const fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    /// Enables debug mode.
    #[must_use]
    pub const fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets the shared store.
    ///
    /// By default, the server uses an in-memory store intended only for tests/dev.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = store;
        self
    }

    /// Sets the policy resolver.
    ///
    /// By default, a resolver is built from the configured defaults without
    /// reading the policy file.
    #[must_use]
    pub fn policies(mut self, policies: PolicyResolver) -> Self {
        self.policies = Some(policies);
        self
    }

    /// Replaces the application routes served behind the idempotency middleware.
    #[must_use]
    pub fn app(mut self, app: Router) -> Self {
        self.app = app;
        self
    }

    /// Builds the server.
    #[must_use]
    pub fn build(self) -> Server {
        let policies = self
            .policies
            .unwrap_or_else(|| PolicyResolver::new(self.config.policy, &self.config.bypass_methods));
        Server {
            config: self.config,
            store: self.store,
            policies,
            app: self.app,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
