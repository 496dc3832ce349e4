//! Admin HTTP API.
//!
//! JSON over HTTP, mounted on the worker library's shard server. Successful
//! responses are 200; failures carry a `{code, msg}` body with a non-200
//! status. All writes go straight to etcd; the leader's watchers pick them
//! up, so any replica can serve the admin surface.

use crate::replica::SmReplica;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shardman_core::{now_unix, NodeManager, ServiceSpec, ShardSpec, SmError};
use shardman_etcd::{
    create_and_get, delete_key, get_json, get_json_prefix, get_prefix, put_json, Client,
};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct ApiState {
    pub client: Client,
    pub nm: NodeManager,
    pub replica: Arc<SmReplica>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/sm/server/add-spec", post(add_spec))
        .route("/sm/server/del-spec", get(del_spec))
        .route("/sm/server/get-spec", get(get_spec))
        .route("/sm/server/update-spec", post(update_spec))
        .route("/sm/server/add-shard", post(add_shard))
        .route("/sm/server/del-shard", post(del_shard))
        .route("/sm/server/get-shard", get(get_shard))
        .with_state(state)
}

/// Error body: `{code, msg}` with `code` mirroring the HTTP status.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u16,
    msg: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    msg: String,
}

impl ApiError {
    fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            msg: msg.into(),
        }
    }
}

impl From<SmError> for ApiError {
    fn from(err: SmError) -> Self {
        let status = match &err {
            SmError::Config(_) => StatusCode::BAD_REQUEST,
            SmError::NotExist => StatusCode::NOT_FOUND,
            SmError::Exist => StatusCode::CONFLICT,
            SmError::Closing | SmError::SessionLost | SmError::TransientKv(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SmError::PlannerInfeasible(_) | SmError::Codec(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.status.as_u16(),
            msg: self.msg,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn guard_mutations(state: &ApiState) -> ApiResult<()> {
    if state.replica.is_closing() {
        return Err(SmError::Closing.into());
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ServiceQuery {
    service: String,
}

/// POST /sm/server/add-spec — create-if-absent; re-posting an existing spec
/// succeeds without change.
async fn add_spec(
    State(state): State<ApiState>,
    Json(mut spec): Json<ServiceSpec>,
) -> ApiResult<Json<serde_json::Value>> {
    guard_mutations(&state)?;
    if spec.service.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "service required"));
    }
    if spec.create_time == 0 {
        spec.create_time = now_unix();
    }

    let key = state.nm.service_spec(&spec.service);
    let value = serde_json::to_string(&spec).map_err(SmError::from)?;
    let (_, created) = create_and_get(&state.client, &key, &value, None).await?;
    info!(service = %spec.service, created, "add-spec");
    Ok(Json(serde_json::json!({})))
}

/// GET /sm/server/del-spec?service= — refused while shards remain.
async fn del_spec(
    State(state): State<ApiState>,
    Query(query): Query<ServiceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    guard_mutations(&state)?;

    let (shards, _) = get_prefix(&state.client, &state.nm.shard_root(&query.service)).await?;
    if !shards.is_empty() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("{} shards remain, delete them first", shards.len()),
        ));
    }
    delete_key(&state.client, &state.nm.service_spec(&query.service)).await?;
    info!(service = %query.service, "del-spec");
    Ok(Json(serde_json::json!({})))
}

/// GET /sm/server/get-spec — every declared service.
async fn get_spec(State(state): State<ApiState>) -> ApiResult<Json<Vec<ServiceSpec>>> {
    let root = state.nm.service_root();
    let (entries, _) = get_prefix(&state.client, &root).await?;
    let mut specs = Vec::new();
    for (key, value) in entries {
        if state.nm.service_of_spec_key(&key).is_none() {
            continue;
        }
        let spec: ServiceSpec = serde_json::from_str(&value).map_err(SmError::from)?;
        specs.push(spec);
    }
    Ok(Json(specs))
}

/// POST /sm/server/update-spec — replace an existing spec.
async fn update_spec(
    State(state): State<ApiState>,
    Json(spec): Json<ServiceSpec>,
) -> ApiResult<Json<serde_json::Value>> {
    guard_mutations(&state)?;
    if spec.service.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "service required"));
    }

    let key = state.nm.service_spec(&spec.service);
    if get_json::<ServiceSpec>(&state.client, &key).await?.is_none() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "service not registered"));
    }
    put_json(&state.client, &key, &spec, None).await?;
    info!(service = %spec.service, "update-spec");
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddShardRequest {
    service: String,
    shard_id: String,
    task: String,
    #[serde(default)]
    group: String,
    #[serde(default)]
    manual_container_id: String,
}

/// POST /sm/server/add-shard — create or update a shard spec. An existing
/// shard keeps its current placement, so a task change recycles the
/// instance in place instead of moving it.
async fn add_shard(
    State(state): State<ApiState>,
    Json(req): Json<AddShardRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    guard_mutations(&state)?;
    if req.service.is_empty() || req.shard_id.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "service and shardId required",
        ));
    }

    let spec_key = state.nm.service_spec(&req.service);
    if get_json::<ServiceSpec>(&state.client, &spec_key).await?.is_none() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "service not registered"));
    }

    let shard_key = state.nm.shard_spec(&req.service, &req.shard_id);
    let existing = get_json::<ShardSpec>(&state.client, &shard_key).await?;
    let spec = ShardSpec {
        id: req.shard_id.clone(),
        service: req.service.clone(),
        task: req.task,
        group: req.group,
        container_id: existing.map(|s| s.container_id).unwrap_or_default(),
        manual_container_id: req.manual_container_id,
    };
    put_json(&state.client, &shard_key, &spec, None).await?;
    info!(service = %req.service, shard = %req.shard_id, "add-shard");
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelShardRequest {
    service: String,
    shard_id: String,
}

/// POST /sm/server/del-shard — idempotent delete; the next rebalance drops
/// the running instance.
async fn del_shard(
    State(state): State<ApiState>,
    Json(req): Json<DelShardRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    guard_mutations(&state)?;
    delete_key(
        &state.client,
        &state.nm.shard_spec(&req.service, &req.shard_id),
    )
    .await?;
    info!(service = %req.service, shard = %req.shard_id, "del-shard");
    Ok(Json(serde_json::json!({})))
}

/// GET /sm/server/get-shard?service= — every declared shard of a service.
async fn get_shard(
    State(state): State<ApiState>,
    Query(query): Query<ServiceQuery>,
) -> ApiResult<Json<Vec<ShardSpec>>> {
    let (entries, _) =
        get_json_prefix::<ShardSpec>(&state.client, &state.nm.shard_root(&query.service)).await?;
    let shards = entries.into_iter().map(|(_, spec)| spec).collect();
    Ok(Json(shards))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_shape() {
        let err: ApiError = SmError::Closing.into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);

        let body = ErrorBody {
            code: err.status.as_u16(),
            msg: err.msg.clone(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], 503);
        assert_eq!(json["msg"], "component is closing");
    }

    #[test]
    fn error_kind_status_mapping() {
        let cases = [
            (SmError::Config("x".into()), StatusCode::BAD_REQUEST),
            (SmError::NotExist, StatusCode::NOT_FOUND),
            (SmError::Exist, StatusCode::CONFLICT),
            (SmError::SessionLost, StatusCode::SERVICE_UNAVAILABLE),
            (
                SmError::TransientKv("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.status, status);
        }
    }

    #[test]
    fn add_shard_request_is_camel_case() {
        let req: AddShardRequest = serde_json::from_str(
            r#"{"service":"svc","shardId":"s1","task":"t","manualContainerId":"c2"}"#,
        )
        .unwrap();
        assert_eq!(req.shard_id, "s1");
        assert_eq!(req.manual_container_id, "c2");
        assert!(req.group.is_empty());
    }
}
