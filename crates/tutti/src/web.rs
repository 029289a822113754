//! Operator HTTP API.
//!
//! Thin JSON layer over [`ControllerHandle`]. Every mutation goes through the
//! controller actor; the device endpoints read the registry directly.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;
use tuttiproto::DeviceId;

use crate::controller::ControllerHandle;
use crate::error::TuttiError;
use crate::session::SessionRequest;

/// Shared state for web handlers
#[derive(Clone)]
pub struct WebState {
    pub controller: ControllerHandle,
    pub started: Instant,
}

impl WebState {
    pub fn new(controller: ControllerHandle) -> Self {
        Self {
            controller,
            started: Instant::now(),
        }
    }
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/", get(serve_root))
        .route("/health", get(health))
        .route("/devices", get(list_devices))
        .route("/devices/{id}", get(get_device))
        .route("/session", get(current_session).post(create_session))
        .route("/session/start", post(start_session))
        .route("/session/stop", post(stop_session))
        .route("/session/abort", post(abort_session))
        .route("/session/demote", post(demote))
        .route("/session/retry", post(retry))
        .route("/reports", get(reports))
        .with_state(state)
}

/// [`TuttiError`] rendered as a JSON response.
pub struct ApiError(TuttiError);

impl From<TuttiError> for ApiError {
    fn from(err: TuttiError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            TuttiError::Consistency(_) => StatusCode::CONFLICT,
            TuttiError::UnknownDevice(_) => StatusCode::NOT_FOUND,
            TuttiError::NoEligibleDevices { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            TuttiError::ControllerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            TuttiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            TuttiError::Protocol(_) => StatusCode::BAD_REQUEST,
            TuttiError::ClockQuality { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        if let TuttiError::NoEligibleDevices { unsynchronized, .. } = &self.0 {
            body["unsynchronized"] = json!(unsynchronized);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn serve_root() -> impl IntoResponse {
    Json(json!({
        "name": "tutti",
        "version": env!("CARGO_PKG_VERSION"),
        "links": {
            "health": "/health",
            "devices": "/devices",
            "session": "/session",
            "reports": "/reports",
        }
    }))
}

async fn health(State(state): State<WebState>) -> impl IntoResponse {
    let devices = state.controller.registry().summary();
    let session = state.controller.current_session().await;
    let (status, session) = match session {
        Ok(view) => ("healthy", json!(view)),
        Err(_) => ("degraded", serde_json::Value::Null),
    };
    Json(json!({
        "status": status,
        "uptime_secs": state.started.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "devices": devices,
        "session": session,
    }))
}

async fn list_devices(State(state): State<WebState>) -> impl IntoResponse {
    Json(state.controller.registry().all())
}

async fn get_device(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = DeviceId::new(id);
    state
        .controller
        .registry()
        .lookup(&id)
        .map(Json)
        .ok_or_else(|| TuttiError::UnknownDevice(id).into())
}

async fn current_session(State(state): State<WebState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.controller.current_session().await?))
}

async fn create_session(
    State(state): State<WebState>,
    Json(request): Json<SessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.controller.create_session(request).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn start_session(State(state): State<WebState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.controller.start_session().await?))
}

async fn stop_session(State(state): State<WebState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.controller.stop_session().await?))
}

#[derive(Debug, Default, Deserialize)]
struct AbortBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn abort_session(
    State(state): State<WebState>,
    body: Option<Json<AbortBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "requested by operator".to_string());
    Ok(Json(state.controller.abort_session(reason).await?))
}

#[derive(Debug, Deserialize)]
struct DemoteBody {
    device_id: DeviceId,
}

async fn demote(
    State(state): State<WebState>,
    Json(body): Json<DemoteBody>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.controller.registry().contains(&body.device_id) {
        return Err(TuttiError::UnknownDevice(body.device_id).into());
    }
    Ok(Json(state.controller.demote(body.device_id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct RetryBody {
    #[serde(default)]
    demote: Vec<DeviceId>,
}

async fn retry(
    State(state): State<WebState>,
    body: Option<Json<RetryBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let demote = body.map(|Json(b)| b.demote).unwrap_or_default();
    let view = state.controller.retry(demote).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn reports(State(state): State<WebState>) -> ApiResult<Vec<crate::session::SessionReport>> {
    Ok(Json(state.controller.reports().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller;
    use crate::registry::DeviceRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;
    use tutticonf::TuttiConfig;
    use tuttiproto::Capability;

    struct Api {
        router: Router,
        registry: Arc<DeviceRegistry>,
        shutdown: CancellationToken,
        _reports: tempfile::TempDir,
    }

    fn api() -> Api {
        let reports = tempfile::tempdir().unwrap();
        let mut config = TuttiConfig::default();
        config.infra.paths.report_dir = reports.path().to_path_buf();
        let registry = Arc::new(DeviceRegistry::new());
        let shutdown = CancellationToken::new();
        let handle = controller::spawn(&config, registry.clone(), shutdown.clone());
        Api {
            router: router(WebState::new(handle)),
            registry,
            shutdown,
            _reports: reports,
        }
    }

    async fn call(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_device_counts() {
        let api = api();
        api.registry
            .register(&DeviceId::from("cam"), [Capability::Camera], 1);

        let (status, body) = call(&api.router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["devices"]["total"], 1);
        assert!(body["session"].is_null());
        api.shutdown.cancel();
    }

    #[tokio::test]
    async fn unknown_device_is_404() {
        let api = api();
        let (status, body) = call(&api.router, "GET", "/devices/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown_device");

        let (status, _) = call(
            &api.router,
            "POST",
            "/session/demote",
            Some(json!({"device_id": "ghost"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        api.shutdown.cancel();
    }

    #[tokio::test]
    async fn start_without_session_conflicts() {
        let api = api();
        let (status, body) = call(&api.router, "POST", "/session/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "consistency");
        api.shutdown.cancel();
    }

    #[tokio::test]
    async fn session_without_devices_is_unprocessable() {
        let api = api();
        let (status, body) = call(
            &api.router,
            "POST",
            "/session",
            Some(json!({"capabilities": ["camera"]})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "no_eligible_devices");
        assert_eq!(body["unsynchronized"], json!([]));
        api.shutdown.cancel();
    }

    #[tokio::test]
    async fn stopped_controller_is_unavailable() {
        let api = api();
        api.shutdown.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let (status, body) = call(&api.router, "GET", "/reports", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "controller_unavailable");
    }
}
