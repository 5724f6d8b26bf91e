//! REST API handlers.
//!
//! Resource handlers read and write the keyspace directly; the controllers
//! pick the changes up through their watches.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use keel_core::objects::resolve_uid;
use keel_core::{AppKind, KeyValue, Revision};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn internal(e: impl std::fmt::Display) -> Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
}

fn parse_kind(kind: &str) -> Result<AppKind, Response> {
    kind.parse::<AppKind>()
        .map_err(|e| error_response(&e.to_string(), StatusCode::NOT_FOUND))
}

/// A stored record as returned by the API.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceView {
    pub key: String,
    pub uid: String,
    pub resource_version: Revision,
    pub create_revision: Revision,
    pub version: u64,
    /// The stored document, or `null` if it is not JSON.
    pub document: Value,
}

impl From<KeyValue> for ResourceView {
    fn from(kv: KeyValue) -> Self {
        Self {
            uid: resolve_uid(&kv.key, kv.create_revision, Some(kv.value.as_slice())),
            resource_version: kv.mod_revision,
            create_revision: kv.create_revision,
            version: kv.version,
            document: serde_json::from_slice(&kv.value).unwrap_or(Value::Null),
            key: kv.key,
        }
    }
}

// ── Status ─────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusView {
    revision: Revision,
    compaction_boundary: Revision,
}

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> Response {
    let view = state.keyspace.current_revision().and_then(|revision| {
        Ok(StatusView {
            revision,
            compaction_boundary: state.keyspace.compaction_boundary()?,
        })
    });
    match view {
        Ok(view) => ApiResponse::ok(view).into_response(),
        Err(e) => internal(e),
    }
}

// ── Resources ──────────────────────────────────────────────────

/// GET /api/v1/resources/:kind
pub async fn list_resources(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    match state.keyspace.list(&kind.prefix()) {
        Ok(snapshot) => {
            let items: Vec<ResourceView> = snapshot.items.into_iter().map(Into::into).collect();
            ApiResponse::ok(items).into_response()
        }
        Err(e) => internal(e),
    }
}

/// GET /api/v1/resources/:kind/:namespace/:name
pub async fn get_resource(
    State(state): State<ApiState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    match state.keyspace.get(&kind.key(&namespace, &name)) {
        Ok(Some(kv)) => ApiResponse::ok(ResourceView::from(kv)).into_response(),
        Ok(None) => error_response("resource not found", StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

/// PUT /api/v1/resources/:kind/:namespace/:name
///
/// The body is stored as given, with `apiVersion`, `kind` and the
/// metadata name and namespace filled in from the path. Only the document
/// shape is checked; `spec` is validated by the controller.
pub async fn put_resource(
    State(state): State<ApiState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    let Value::Object(mut doc) = body else {
        return error_response("body must be a JSON object", StatusCode::BAD_REQUEST);
    };

    doc.insert("apiVersion".into(), Value::String(kind.api_version()));
    doc.insert("kind".into(), Value::String(kind.kind_name().to_string()));
    let metadata = doc
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(metadata) = metadata else {
        return error_response("metadata must be an object", StatusCode::BAD_REQUEST);
    };
    metadata.insert("name".into(), Value::String(name.clone()));
    metadata.insert("namespace".into(), Value::String(namespace.clone()));

    let key = kind.key(&namespace, &name);
    let bytes = match serde_json::to_vec(&Value::Object(doc)) {
        Ok(bytes) => bytes,
        Err(e) => return internal(e),
    };
    let existed = match state.keyspace.get(&key) {
        Ok(current) => current.is_some(),
        Err(e) => return internal(e),
    };
    if let Err(e) = state.keyspace.put(&key, &bytes) {
        return internal(e);
    }

    match state.keyspace.get(&key) {
        Ok(Some(kv)) => {
            info!(%kind, %namespace, %name, resource_version = kv.mod_revision, "resource written");
            let status = if existed {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, ApiResponse::ok(ResourceView::from(kv))).into_response()
        }
        Ok(None) => error_response("resource vanished after write", StatusCode::CONFLICT),
        Err(e) => internal(e),
    }
}

/// DELETE /api/v1/resources/:kind/:namespace/:name
pub async fn delete_resource(
    State(state): State<ApiState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    match state.keyspace.delete(&kind.key(&namespace, &name)) {
        Ok(Some(revision)) => {
            info!(%kind, %namespace, %name, revision, "resource deleted");
            ApiResponse::ok(revision).into_response()
        }
        Ok(None) => error_response("resource not found", StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/resources/:kind/:namespace/:name/children
pub async fn get_children(
    State(state): State<ApiState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    let mut children = Vec::new();
    for child in kind.child_kinds() {
        let key = child.key(&namespace, &child.child_name(&name));
        match state.keyspace.get(&key) {
            Ok(Some(kv)) => children.push(ResourceView::from(kv)),
            Ok(None) => {}
            Err(e) => return internal(e),
        }
    }
    ApiResponse::ok(children).into_response()
}

// ── Diagnostics ────────────────────────────────────────────────

/// GET /api/v1/checkpoints
pub async fn list_checkpoints(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.diagnostics.checkpoints()).into_response()
}

/// GET /api/v1/orphans
pub async fn list_orphans(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.diagnostics.orphans()).into_response()
}

/// GET /api/v1/phases
pub async fn list_phases(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.diagnostics.phases()).into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use keel_controller::Diagnostics;
    use keel_state::Keyspace;
    use tower::ServiceExt;

    use crate::build_router;

    use super::*;

    async fn call(router: axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                req = req.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&body).unwrap())
            }
            None => Body::empty(),
        };
        let resp = router.oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn put_stamps_identity_from_path() {
        let ks = Keyspace::open_in_memory().unwrap();
        let router = build_router(ks.clone(), Diagnostics::new());

        let body = serde_json::json!({"metadata": {"name": "wrong"}, "spec": {"image": "nginx"}});
        let (status, resp) = call(
            router.clone(),
            "PUT",
            "/api/v1/resources/configmapapps/default/app-a",
            Some(body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(resp["data"]["document"]["metadata"]["name"], "app-a");
        assert_eq!(resp["data"]["document"]["kind"], "ConfigMapApp");
        assert_eq!(resp["data"]["resourceVersion"], 1);

        let (status, _) = call(
            router,
            "PUT",
            "/api/v1/resources/ConfigMapApp/default/app-a",
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ks.current_revision().unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_kind_is_not_found() {
        let router = build_router(Keyspace::open_in_memory().unwrap(), Diagnostics::new());
        let (status, resp) = call(router, "GET", "/api/v1/resources/pods", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(resp["success"], false);
    }

    #[tokio::test]
    async fn non_object_body_is_rejected() {
        let router = build_router(Keyspace::open_in_memory().unwrap(), Diagnostics::new());
        let (status, _) = call(
            router,
            "PUT",
            "/api/v1/resources/simpleapps/default/app-a",
            Some(serde_json::json!([1, 2])),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
