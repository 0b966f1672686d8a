use axum::http::StatusCode;
use training_operator::{
    metrics::{register_metrics, RECONCILES_TOTAL},
    server::{metrics_router, probe_router, Readiness},
};

#[tokio::test]
async fn test_probe_endpoints() {
    let readiness = Readiness::new();
    let client = axum_test::TestServer::new(probe_router(readiness.clone())).unwrap();

    let response = client.get("/healthz").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "ok");

    let response = client.get("/readyz").await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);

    readiness.mark_ready();
    let response = client.get("/readyz").await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    register_metrics().expect("Failed to register metrics");
    RECONCILES_TOTAL.with_label_values(&["tfjob"]).inc();

    let client = axum_test::TestServer::new(metrics_router()).unwrap();
    let response = client.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body = response.text();
    assert!(body.contains("training_operator_reconciles_total"));
    assert!(body.contains("kind=\"tfjob\""));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let client = axum_test::TestServer::new(probe_router(Readiness::new())).unwrap();
    let response = client.get("/alerts").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}
