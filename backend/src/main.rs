use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};
use unimount_backend::config::Config;
use unimount_backend::db::{make_pool, PgStore};
use unimount_backend::rest::{create_router, AppState};
use unimount_backend::token::TokenService;
use unimount_backend::users::StaticUsers;
use unimount_backend::{metrics, mqtt};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // A partially configured service must not start.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Refusing to start: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Unimount IoT backend");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Database: {}",
        config.database_url.split('@').last().unwrap_or("***")
    );

    metrics::init_metrics();

    let pool = match make_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    let store = Arc::new(PgStore::new(pool));
    let state = AppState {
        store: store.clone(),
        tokens: Arc::new(TokenService::new(&config.jwt_secret)),
        identity: Arc::new(StaticUsers::with_defaults()),
    };

    let client_id = format!("unimount-backend-{}", uuid::Uuid::new_v4());
    let mqtt_store = store.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(config.mqtt_broker, config.mqtt_port, client_id, mqtt_store)
            .await
        {
            error!("MQTT task failed: {}", e);
        }
    });

    let app = Router::new()
        .route("/", get(root))
        .route("/metrics", get(metrics_handler))
        .merge(create_router(state));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn root() -> Json<Value> {
    Json(json!({ "status": "Unimount backend running" }))
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
