use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use propline_db::{ping, DbPool};
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    graph_pool: DbPool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub graph: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, graph_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, graph_pool })
}

/// Readiness follows the relational store only. A graph outage is reported but
/// intake keeps working without it.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = store_check(&state.db_pool, "database").await;
    let graph = store_check(&state.graph_pool, "graph store").await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: match (ready, graph.status) {
            (false, _) => "degraded",
            (true, "ready") => "ready",
            (true, _) => "graph_degraded",
        },
        service: HealthCheck {
            status: "ready",
            detail: "propline-server runtime initialized".to_string(),
        },
        database,
        graph,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn store_check(pool: &DbPool, label: &str) -> HealthCheck {
    match ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: format!("{label} query succeeded") },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("{label} query failed: {error}") }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{extract::State, http::StatusCode, Json};
    use propline_db::connect_with_settings;

    use crate::health::{health, HealthState};

    #[tokio::test]
    async fn health_returns_ready_when_both_stores_are_reachable() {
        let db_pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("db pool");
        let graph_pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("graph pool");

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: db_pool.clone(), graph_pool })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.graph.status, "ready");

        db_pool.close().await;
    }

    #[tokio::test]
    async fn graph_outage_degrades_without_failing_readiness() {
        let db_pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("db pool");
        let graph_pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("graph pool");
        graph_pool.close().await;

        let (status, Json(payload)) = health(State(HealthState { db_pool, graph_pool })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "graph_degraded");
        assert_eq!(payload.graph.status, "degraded");
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let db_pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("db pool");
        let graph_pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("graph pool");
        db_pool.close().await;

        let (status, Json(payload)) = health(State(HealthState { db_pool, graph_pool })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.service.status, "ready");
    }
}
