//! HTTP Handlers
//!
//! The JSON surface over the tenant actors. Handlers are thin: resolve the
//! tenant, call the handle, shape the response. Status codes come from the
//! service error taxonomy; bodies are `{error, details?}` on failure.

use crate::models::edge::Capability;
use crate::models::mutation::{MutationRequest, RevokeTarget};
use crate::models::proof::{EdgePathProof, ProofVerdict};
use crate::models::schema::SchemaDefinition;
use crate::server::AppState;
use crate::services::error::ServiceError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::debug;

/// Service error as an HTTP response
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Storage and internal faults keep their specifics in the log, not
        // the response body
        let details = match &self.0 {
            ServiceError::Storage(_)
            | ServiceError::Serialization(_)
            | ServiceError::ReplayFailed { .. } => None,
            ServiceError::SchemaValidationFailed { issues } => {
                Some(json!({ "issues": issues }))
            }
            other => Some(Value::String(other.to_string())),
        };

        let mut body = json!({ "error": self.0.category() });
        if let Some(details) = details {
            body["details"] = details;
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn operator_from(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get("x-operator")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

// ---- Read endpoints ------------------------------------------------------

#[derive(Deserialize)]
pub struct CanParams {
    subject: String,
    capability: String,
    object: String,
}

/// `GET /{tenant}/can?subject=&capability=&object=`
pub async fn can(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(params): Query<CanParams>,
) -> ApiResult {
    let started = Instant::now();
    let handle = state.registry.tenant(&tenant).await?;
    let (allowed, witness) = handle
        .can(
            &params.subject,
            &Capability::new(&params.capability),
            &params.object,
        )
        .await?;

    let mut body = json!({
        "allowed": allowed,
        "latency_ms": started.elapsed().as_secs_f64() * 1000.0,
    });
    if let Some(witness) = witness {
        // The witness doubles as a server-minted proof the caller can
        // submit to /validate later
        body["proof"] = json!(witness
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>());
    }
    Ok(Json(body))
}

#[derive(Deserialize)]
pub struct AccessibleParams {
    subject: String,
    capability: String,
}

/// `GET /{tenant}/accessible?subject=&capability=`
pub async fn accessible(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(params): Query<AccessibleParams>,
) -> ApiResult {
    let handle = state.registry.tenant(&tenant).await?;
    let objects = handle
        .accessible_objects(&params.subject, &Capability::new(&params.capability))
        .await?;
    Ok(Json(json!({ "objects": objects })))
}

#[derive(Deserialize)]
pub struct AccessorsParams {
    object: String,
    capability: String,
}

/// `GET /{tenant}/accessors?object=&capability=`
pub async fn accessors(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(params): Query<AccessorsParams>,
) -> ApiResult {
    let handle = state.registry.tenant(&tenant).await?;
    let accessors = handle
        .accessors(&params.object, &Capability::new(&params.capability))
        .await?;
    Ok(Json(json!({ "accessors": accessors })))
}

/// `GET /{tenant}/stats`
pub async fn stats(State(state): State<AppState>, Path(tenant): Path<String>) -> ApiResult {
    let handle = state.registry.tenant(&tenant).await?;
    Ok(Json(serde_json::to_value(handle.stats().await).map_err(ServiceError::from)?))
}

// ---- Write endpoints -----------------------------------------------------

#[derive(Deserialize)]
pub struct GrantBody {
    source: String,
    target: String,
    #[serde(rename = "type")]
    relation: String,
    #[serde(default)]
    properties: Option<serde_json::Map<String, Value>>,
}

/// `POST /{tenant}/grant`
pub async fn grant(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    headers: axum::http::HeaderMap,
    Json(body): Json<GrantBody>,
) -> ApiResult {
    let handle = state.registry.tenant(&tenant).await?;
    let request = MutationRequest::Grant {
        relation: body.relation,
        source: body.source,
        target: body.target,
        properties: body.properties,
    };
    let outcome = handle.apply(&request, operator_from(&headers)).await?;
    Ok(Json(json!({
        "edge_id": outcome.edge_id.map(|id| id.to_string()),
        "version": outcome.version,
    })))
}

/// `POST /{tenant}/revoke` accepting both the id and tuple forms
pub async fn revoke(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    headers: axum::http::HeaderMap,
    Json(target): Json<RevokeTarget>,
) -> ApiResult {
    let handle = state.registry.tenant(&tenant).await?;
    let request = MutationRequest::Revoke { target };
    let outcome = handle.apply(&request, operator_from(&headers)).await?;
    Ok(Json(json!({ "version": outcome.version })))
}

#[derive(Deserialize)]
pub struct BulkBody {
    operations: Vec<MutationRequest>,
}

/// `POST /{tenant}/bulk`
///
/// Operations apply in submission order; the first failure aborts the rest,
/// which are reported as `skipped`.
pub async fn bulk(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    headers: axum::http::HeaderMap,
    Json(body): Json<BulkBody>,
) -> ApiResult {
    let handle = state.registry.tenant(&tenant).await?;
    let operator = operator_from(&headers);

    let mut results: Vec<Value> = Vec::with_capacity(body.operations.len());
    let mut failed = false;
    for operation in &body.operations {
        if failed {
            results.push(json!({ "status": "skipped" }));
            continue;
        }
        match handle.apply(operation, operator.clone()).await {
            Ok(outcome) => results.push(json!({
                "status": "ok",
                "version": outcome.version,
                "edge_id": outcome.edge_id.map(|id| id.to_string()),
            })),
            Err(e) => {
                debug!(%tenant, "bulk aborted: {e}");
                results.push(json!({ "status": "error", "error": e.category() }));
                failed = true;
            }
        }
    }
    Ok(Json(json!({ "results": results })))
}

/// `POST /{tenant}/validate`
///
/// A rejected proof answers 403 with the category, the break index, and the
/// offending edge; the concrete reason is logged server-side.
pub async fn validate(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(proof): Json<EdgePathProof>,
) -> Result<Response, ApiError> {
    let handle = state.registry.tenant(&tenant).await?;
    match handle.check_proof(&proof).await? {
        Ok(()) => Ok(Json(ProofVerdict::allowed()).into_response()),
        Err(rejection) => Ok((
            StatusCode::FORBIDDEN,
            Json(ProofVerdict::rejected(&rejection)),
        )
            .into_response()),
    }
}

/// `POST /{tenant}/snapshot` - administrative snapshot request
pub async fn snapshot(State(state): State<AppState>, Path(tenant): Path<String>) -> ApiResult {
    let handle = state.registry.tenant(&tenant).await?;
    let version = handle.flush_snapshot().await?;
    Ok(Json(json!({ "snapshot_version": version })))
}

// ---- Schema endpoints ----------------------------------------------------

/// `PUT /{tenant}/schema` - upload a new version without activating
pub async fn upload_schema(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(source): Json<SchemaDefinition>,
) -> ApiResult {
    let handle = state.registry.tenant(&tenant).await?;
    let version = handle.upload_schema(source).await?;
    Ok(Json(json!({ "version": version })))
}

/// `POST /{tenant}/schema/activate/{version}` and `.../rollback/{version}`
///
/// Rollback is activation of an earlier version; both run the same
/// forward-compatibility gate.
pub async fn activate_schema(
    State(state): State<AppState>,
    Path((tenant, version)): Path<(String, u32)>,
) -> ApiResult {
    let handle = state.registry.tenant(&tenant).await?;
    let version = handle.activate_schema(version).await?;
    Ok(Json(json!({ "version": version })))
}

/// `GET /{tenant}/schema` - the active compiled schema
pub async fn get_schema(State(state): State<AppState>, Path(tenant): Path<String>) -> ApiResult {
    let handle = state.registry.tenant(&tenant).await?;
    Ok(Json(handle.schema_json().await?))
}
