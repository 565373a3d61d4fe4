//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::service::Service;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub service: Arc<Service>,
}

/// HTTP server over the monitoring core.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, service: Arc<Service>) -> Self {
        Self {
            state: AppState { config, service },
        }
    }

    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/api/nodes", get(handlers::handle_list_nodes))
            .route("/api/nodes", post(handlers::handle_create_node))
            .route("/api/nodes/{id}", get(handlers::handle_get_node))
            .route("/api/nodes/{id}", put(handlers::handle_update_node))
            .route("/api/nodes/{id}", delete(handlers::handle_delete_node))
            .route("/api/nodes/{id}/pause", post(handlers::handle_pause_node))
            .route("/api/nodes/{id}/resume", post(handlers::handle_resume_node))
            .route("/api/nodes/{id}/test", post(handlers::handle_test_probe))
            .route("/api/test-connection", post(handlers::handle_test_connection))
            .route("/api/dashboard", get(handlers::handle_dashboard))
            .route("/api/status", get(handlers::handle_system_status))
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve until interrupted.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
            })
            .await?;

        Ok(())
    }
}
