//! Introspection endpoint of the alarm generator
//!
//! ## Endpoints
//!
//! - `GET /api/v1/health` - Health check
//! - `GET /api/v1/stats` - Cache, alarm and output counters
//! - `GET /api/v1/partitions` - Owned partitions and their workers
//! - `POST /api/v1/partitions/:id` - Manually acquire or release a partition
//! - `GET /api/v1/uves/:table` - UVE names of a table
//! - `GET /api/v1/uves/:table/*name` - Merged UVE contents
//! - `GET /api/v1/alarms` - Current alarm and aggregate records
//! - `POST /api/v1/alarms/ack` - Ack an alarm
//! - `GET|PUT /api/v1/alarm-configs` - List or create/replace alarm rules
//! - `DELETE /api/v1/alarm-configs/:name` - Delete an alarm rule
//! - `WS /api/v1/stream` - Alarm output stream

pub mod error;
pub mod routes;
pub mod state;
pub mod types;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;
pub use types::{AckRequest, AckResponse, AlarmsResponse, HealthResponse, StatsResponse};

use std::net::SocketAddr;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tracing::info;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind address (e.g., "0.0.0.0:5995")
    pub bind_addr: SocketAddr,

    /// Enable CORS for browser clients
    pub enable_cors: bool,
}

impl ApiConfig {
    /// Listen on every interface at `port`
    pub fn on_port(port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            enable_cors: true,
        }
    }
}

/// Router with every endpoint
pub fn router(state: ApiState) -> Router {
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route("/api/v1/stats", get(routes::stats::get_stats))
        .route("/api/v1/partitions", get(routes::partitions::list_partitions))
        .route("/api/v1/partitions/:id", post(routes::partitions::set_partition))
        .route("/api/v1/uves/:table", get(routes::uves::list_uves))
        .route("/api/v1/uves/:table/*name", get(routes::uves::get_uve))
        .route("/api/v1/alarms", get(routes::alarms::list_alarms))
        .route("/api/v1/alarms/ack", post(routes::alarms::ack_alarm))
        .route(
            "/api/v1/alarm-configs",
            get(routes::alarms::list_configs).put(routes::alarms::put_config),
        )
        .route("/api/v1/alarm-configs/:name", delete(routes::alarms::delete_config))
        .route("/api/v1/stream", get(websocket::websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Spawn the API server
///
/// This starts an Axum HTTP server in a background task.
/// Returns the server's local address.
pub async fn spawn_api_server(config: ApiConfig, state: ApiState) -> anyhow::Result<SocketAddr> {
    use tower_http::cors::{Any, CorsLayer};

    info!("starting API server on {}", config.bind_addr);

    let mut app = router(state);

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(addr)
}
