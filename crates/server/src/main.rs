mod bootstrap;
mod health;
mod properties;
mod webhook;

use std::future::IntoFuture;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use propline_core::config::{AppConfig, LoadOptions};
use tower_http::cors::CorsLayer;

use crate::bootstrap::Application;

fn init_logging(config: &AppConfig) {
    use propline_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

fn app_router(app: &Application) -> Router {
    health::router(app.db_pool.clone(), app.graph_pool.clone())
        .merge(webhook::router(app.runtime.clone()))
        .merge(properties::router(app.runtime.clone()))
        .layer(CorsLayer::permissive())
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging comes up before anything else can fail
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        llm_provider = app.config.llm.provider.as_str(),
        "propline-server listening"
    );

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(
        axum::serve(listener, app_router(&app))
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .into_future(),
    );

    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        grace_secs = grace.as_secs(),
        "propline-server draining in-flight requests"
    );
    let _ = stop_tx.send(());

    match tokio::time::timeout(grace, server).await {
        Ok(joined) => joined??,
        Err(_) => tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            "in-flight requests did not drain before the grace period ended"
        ),
    }

    app.db_pool.close().await;
    app.graph_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use propline_core::config::{ConfigOverrides, LlmProvider, LoadOptions};
    use tower::ServiceExt;

    use crate::{app_router, bootstrap::bootstrap};

    #[tokio::test]
    async fn combined_router_serves_health_and_cors_preflight() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(format!("sqlite://{}", dir.path().join("db.sqlite").display())),
                graph_url: Some(format!("sqlite://{}", dir.path().join("graph.sqlite").display())),
                llm_provider: Some(LlmProvider::Rules),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap");
        let router = app_router(&app);

        let health = router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(health.status(), StatusCode::OK);

        let preflight = router
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/v1/properties")
                    .header(header::ORIGIN, "https://dashboard.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert!(preflight.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));

        app.db_pool.close().await;
        app.graph_pool.close().await;
    }
}
