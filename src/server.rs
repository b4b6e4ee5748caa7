use crate::handlers::{
    approve, clear_quota, get_quota, health_check, release, reserve, use_quota, AppState,
};
use crate::middleware::logging_middleware;
use crate::policy::ThrottlePolicy;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Builds the HTTP router around a policy.
pub fn create_app(policy: Arc<ThrottlePolicy>) -> Router {
    Router::new()
        .route("/quota/:entity", get(get_quota).delete(clear_quota))
        .route("/quota/:entity/approve", post(approve))
        .route("/quota/:entity/use", post(use_quota))
        .route("/quota/:entity/release", post(release))
        .route("/quota/:entity/reserve", post(reserve))
        .route("/health", get(health_check))
        .with_state(AppState::new(policy))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(policy: Arc<ThrottlePolicy>, bind_addr: SocketAddr) -> Self {
        Self {
            app: create_app(policy),
            bind_addr,
        }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Quota throttler listening on {}", self.bind_addr);

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
