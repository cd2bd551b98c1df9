//! HTTP + WebSocket Server
//!
//! The small API surface over the tenant registry. Tenant id is always the
//! first path segment; handlers resolve the actor (cold-starting it if
//! needed) and delegate. Everything else - authentication, TLS, routing to
//! the right node - belongs to the outer router, not this crate.
//!
//! # Routes
//!
//! - `GET  /{tenant}/can`, `/accessible`, `/accessors`, `/stats`, `/schema`
//! - `POST /{tenant}/grant`, `/revoke`, `/bulk`, `/validate`, `/snapshot`
//! - `PUT  /{tenant}/schema`
//! - `POST /{tenant}/schema/activate/{version}`, `/schema/rollback/{version}`
//! - `GET  /{tenant}/ws` (WebSocket upgrade)
//! - `GET  /health`

pub mod handlers;
pub mod ws;

use crate::tenant::TenantRegistry;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TenantRegistry>,
}

/// Liveness probe
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Build the router over a tenant registry
pub fn router(registry: Arc<TenantRegistry>) -> Router {
    let state = AppState { registry };

    Router::new()
        .route("/health", get(health))
        .route("/:tenant/can", get(handlers::can))
        .route("/:tenant/accessible", get(handlers::accessible))
        .route("/:tenant/accessors", get(handlers::accessors))
        .route("/:tenant/stats", get(handlers::stats))
        .route("/:tenant/grant", post(handlers::grant))
        .route("/:tenant/revoke", post(handlers::revoke))
        .route("/:tenant/bulk", post(handlers::bulk))
        .route("/:tenant/validate", post(handlers::validate))
        .route("/:tenant/snapshot", post(handlers::snapshot))
        .route(
            "/:tenant/schema",
            put(handlers::upload_schema).get(handlers::get_schema),
        )
        .route(
            "/:tenant/schema/activate/:version",
            post(handlers::activate_schema),
        )
        .route(
            "/:tenant/schema/rollback/:version",
            post(handlers::activate_schema),
        )
        .route("/:tenant/ws", get(ws::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until ctrl-c, then drain every tenant
pub async fn run_server(
    addr: std::net::SocketAddr,
    registry: Arc<TenantRegistry>,
) -> anyhow::Result<()> {
    let maintenance = registry.spawn_maintenance();
    let app = router(registry.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    maintenance.abort();
    registry.shutdown().await;
    info!("all tenants drained");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::db::{MemoryMutationLog, MemoryObjectStore};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let registry = TenantRegistry::new(
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryMutationLog::new()),
            Arc::new(CoreConfig::default()),
        );
        router(registry)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn post_json(
        app: &Router,
        uri: &str,
        body: serde_json::Value,
    ) -> axum::response::Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_router();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_grant_then_can_over_http() {
        let app = test_router();

        for (entity, id) in [("user", "user:alice"), ("resource", "resource:doc1")] {
            let response = post_json(
                &app,
                "/acme/bulk",
                serde_json::json!({
                    "operations": [
                        { "op": "upsert_entity", "entity": entity, "row": { "id": id } }
                    ]
                }),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = post_json(
            &app,
            "/acme/grant",
            serde_json::json!({
                "type": "has_permission",
                "source": "user:alice",
                "target": "resource:doc1",
                "properties": { "capability": "read" }
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["version"], 3);
        assert!(body["edge_id"].is_string());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/acme/can?subject=user:alice&capability=read&object=resource:doc1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["allowed"], true);
        assert!(body["latency_ms"].is_number());
        assert_eq!(body["proof"].as_array().unwrap().len(), 1);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/acme/can?subject=user:bob&capability=read&object=resource:doc1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["allowed"], false);
    }

    #[tokio::test]
    async fn test_validate_rejects_broken_chain_with_403() {
        let app = test_router();

        let response = post_json(
            &app,
            "/acme/validate",
            serde_json::json!({
                "subject": "user:alice",
                "object": "resource:doc2",
                "capability": "write",
                "edge_ids": ["nonexistent"]
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["allowed"], false);
        assert_eq!(body["reason"], "UnknownEdge");
        assert_eq!(body["invalid_edge"], "nonexistent");
    }

    #[tokio::test]
    async fn test_bulk_aborts_and_skips_after_failure() {
        let app = test_router();

        let response = post_json(
            &app,
            "/acme/bulk",
            serde_json::json!({
                "operations": [
                    { "op": "upsert_entity", "entity": "user", "row": { "id": "user:alice" } },
                    { "op": "upsert_entity", "entity": "ghost_table", "row": { "id": "x" } },
                    { "op": "upsert_entity", "entity": "user", "row": { "id": "user:bob" } }
                ]
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let results = body["results"].as_array().unwrap();
        assert_eq!(results[0]["status"], "ok");
        assert_eq!(results[1]["status"], "error");
        assert_eq!(results[1]["error"], "UnknownTable");
        assert_eq!(results[2]["status"], "skipped");
    }

    #[tokio::test]
    async fn test_unknown_tenant_id_is_404() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/bad%20tenant/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "UnknownTenant");
    }

    #[tokio::test]
    async fn test_schema_endpoints_round_trip() {
        let app = test_router();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/acme/schema")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["version"], 1);

        let mut source = crate::models::schema::default_schema();
        source.relationships.insert(
            "supervises".to_string(),
            crate::models::schema::RelationshipDefinition {
                source: "user".to_string(),
                target: "user".to_string(),
                kind: crate::models::schema::RelationKind::Plain,
                propagates: false,
                cascade_on_delete: false,
                properties: indexmap::IndexMap::new(),
                description: None,
            },
        );
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/acme/schema")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_string(&source).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["version"], 2);

        let response = post_json(&app, "/acme/schema/activate/2", serde_json::json!({})).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = post_json(&app, "/acme/schema/activate/9", serde_json::json!({})).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Rollback to v1 passes the same forward-compatibility gate
        let response = post_json(&app, "/acme/schema/rollback/1", serde_json::json!({})).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_revoke_both_forms() {
        let app = test_router();

        post_json(
            &app,
            "/acme/bulk",
            serde_json::json!({
                "operations": [
                    { "op": "upsert_entity", "entity": "user", "row": { "id": "user:alice" } },
                    { "op": "upsert_entity", "entity": "resource", "row": { "id": "resource:doc1" } },
                    { "op": "grant", "type": "has_permission", "source": "user:alice",
                      "target": "resource:doc1", "properties": { "capability": "read" } }
                ]
            }),
        )
        .await;

        // Tuple form
        let response = post_json(
            &app,
            "/acme/revoke",
            serde_json::json!({
                "type": "has_permission",
                "source": "user:alice",
                "target": "resource:doc1",
                "capability": "read"
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["version"], 4);

        // Id form against an unknown edge is a 404
        let response = post_json(
            &app,
            "/acme/revoke",
            serde_json::json!({ "edge_id": "00000000-0000-4000-8000-00000000dead" }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
