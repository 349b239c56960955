use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;
use std::time::Duration;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    store: StoreHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_pool: Option<ConnectionPoolHealth>,
    event_bus: EventBusHealth,
    active_sessions: i64,
}

#[derive(Serialize)]
pub struct StoreHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
pub struct ConnectionPoolHealth {
    size: u32,
    idle_connections: usize,
    max_connections: u32,
}

#[derive(Serialize)]
pub struct EventBusHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Health check endpoint
///
/// Checks:
/// - Store connectivity (backs session state and the durable event log)
/// - Connection pool utilization (when Postgres-backed)
/// - Live fan-out reachability (broker flush when NATS-backed)
///
/// Returns 200 OK if all systems are healthy, 503 Service Unavailable
/// otherwise.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let store_probe = tokio::time::timeout(
        Duration::from_secs(5),
        state.deps.store.count_active_sessions(),
    )
    .await;

    let (store_health, active_sessions) = match store_probe {
        Ok(Ok(count)) => (
            StoreHealth {
                status: "ok".to_string(),
                error: None,
            },
            count,
        ),
        Ok(Err(e)) => (
            StoreHealth {
                status: "error".to_string(),
                error: Some(format!("query failed: {}", e)),
            },
            0,
        ),
        Err(_) => (
            StoreHealth {
                status: "error".to_string(),
                error: Some("query timeout (>5s)".to_string()),
            },
            0,
        ),
    };

    let bus_health = match tokio::time::timeout(Duration::from_secs(2), state.deps.fanout.ping())
        .await
    {
        Ok(Ok(())) => EventBusHealth {
            status: "ok".to_string(),
            error: None,
        },
        Ok(Err(e)) => EventBusHealth {
            status: "error".to_string(),
            error: Some(format!("ping failed: {}", e)),
        },
        Err(_) => EventBusHealth {
            status: "error".to_string(),
            error: Some("ping timeout (>2s)".to_string()),
        },
    };

    let pool_health = state.db_pool.as_ref().map(|pool| ConnectionPoolHealth {
        size: pool.size(),
        idle_connections: pool.num_idle(),
        max_connections: pool.options().get_max_connections(),
    });

    let is_healthy = store_health.status == "ok" && bus_health.status == "ok";
    let status_code = if is_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if is_healthy { "healthy" } else { "unhealthy" }.to_string(),
            store: store_health,
            connection_pool: pool_health,
            event_bus: bus_health,
            active_sessions,
        }),
    )
}
