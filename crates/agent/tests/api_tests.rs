//! Integration tests for the agent API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use rca_agent::api::{create_router, AppState};
use rca_lib::{
    config::{ConfHandle, RcaConf},
    graph::{AnalysisGraph, GraphContext, GraphRegistry, DEFAULT_ENTRY_POINT},
    health::{components, HealthRegistry},
    net::{NetworkConfig, NetworkLayer},
    observability::{RcaMetrics, StructuredLogger},
    scheduler::{Scheduler, SchedulerConfig},
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::COLLECTOR).await;
    health_registry.register(components::SCHEDULER).await;

    let metrics = RcaMetrics::new();
    let state = Arc::new(AppState::new(health_registry, metrics));
    let router = create_router(state.clone());

    (router, state)
}

/// App wired to a real scheduler and network layer
fn setup_engine_app() -> (Router, Arc<Scheduler>) {
    let conf = RcaConf {
        peer_ip_list: vec!["10.0.0.2:9650".to_string()],
        ..RcaConf::default()
    };
    let network = Arc::new(NetworkLayer::new(
        "10.0.0.1:9650",
        &conf,
        NetworkConfig::default(),
    ));
    let definition = GraphRegistry::with_builtins()
        .resolve(DEFAULT_ENTRY_POINT, &conf)
        .unwrap();
    let graph = AnalysisGraph::build(
        &definition,
        &GraphContext::local(&conf, Duration::from_secs(60)).with_network(Arc::clone(&network)),
    )
    .unwrap();

    let scheduler = Arc::new(Scheduler::new(
        Arc::new(graph),
        Arc::new(ConfHandle::new(conf)),
        SchedulerConfig::default(),
        StructuredLogger::new("10.0.0.1:9650"),
    ));

    let state = AppState::new(HealthRegistry::new(), RcaMetrics::new())
        .with_scheduler(Arc::clone(&scheduler))
        .with_network(network);
    (create_router(Arc::new(state)), scheduler)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::COLLECTOR, "metrics file missing")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::SCHEDULER, "Tick loop exited")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(health["components"]["scheduler"]["message"], "Tick loop exited");
}

#[tokio::test]
async fn test_readyz_returns_503_when_not_ready() {
    let (app, _state) = setup_test_app().await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_unhealthy(components::COLLECTOR, "Failed")
        .await;

    let (status, _) = get_json(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, scheduler) = setup_engine_app();

    // One tick records tick and evaluation latencies
    scheduler.tick_at(1_000).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("rca_tick_latency_seconds_bucket"));
    assert!(metrics_text.contains("rca_evaluation_latency_seconds_count"));
    assert!(metrics_text.contains("rca_ticks_total"));
    assert!(metrics_text.contains("rca_known_peers"));
}

#[tokio::test]
async fn test_stats_reports_scheduler_and_network() {
    let (app, scheduler) = setup_engine_app();
    scheduler.tick_at(1_000).await;

    let (status, stats) = get_json(app, "/stats").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["graph"], "heap-young-gen");
    assert_eq!(stats["scheduler"]["ticks"], 1);
    assert_eq!(stats["scheduler"]["evaluations"], 3);
    assert_eq!(stats["network"]["node_address"], "10.0.0.1:9650");
    assert_eq!(stats["network"]["peers"][0]["status"], "up");
    assert!(stats["buffers"].as_array().unwrap().len() >= 4);
    assert_eq!(
        stats["schema_version"].as_str().unwrap(),
        scheduler.graph().schema_version()
    );
}

#[tokio::test]
async fn test_stats_without_engine() {
    let (app, _state) = setup_test_app().await;

    let (status, stats) = get_json(app, "/stats").await;

    assert_eq!(status, StatusCode::OK);
    assert!(stats.get("scheduler").is_none());
    assert_eq!(stats["buffers"], serde_json::json!([]));
}
