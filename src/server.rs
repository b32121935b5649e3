//! Webhook HTTP surface
//!
//! cert-manager reaches external solvers through the Kubernetes aggregated
//! API: it posts a `ChallengePayload` to
//! `/apis/{group}/v1alpha1/{solver}` and reads the response back out of the
//! same object.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIResource, APIResourceList, Status};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::solver::{ChallengeRequest, Solver};

pub const API_VERSION: &str = "v1alpha1";
pub const PAYLOAD_KIND: &str = "ChallengePayload";

const ACTION_PRESENT: &str = "Present";
const ACTION_CLEANUP: &str = "CleanUp";

/// Request/response envelope exchanged with cert-manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengePayload {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ChallengeRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ChallengeResponse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub uid: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl ChallengeResponse {
    fn ok(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            success: true,
            status: None,
        }
    }

    fn failure(uid: &str, message: String) -> Self {
        Self {
            uid: uid.to_string(),
            success: false,
            status: Some(Status {
                status: Some("Failure".to_string()),
                message: Some(message),
                code: Some(500),
                ..Default::default()
            }),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub solver: Arc<Solver>,
    pub group_name: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/apis/:group/:version", get(discovery))
        .route("/apis/:group/:version/:solver", post(solve))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` flips; in-flight requests are allowed to finish
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Webhook listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            info!("Stopping webhook server");
        })
        .await
}

async fn health_check() -> &'static str {
    "ok"
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 page not found").into_response()
}

async fn discovery(
    State(state): State<AppState>,
    Path((group, version)): Path<(String, String)>,
) -> Response {
    if group != state.group_name || version != API_VERSION {
        return not_found();
    }

    Json(APIResourceList {
        group_version: format!("{}/{}", group, version),
        resources: vec![APIResource {
            name: state.solver.name().to_string(),
            singular_name: state.solver.name().to_string(),
            kind: PAYLOAD_KIND.to_string(),
            namespaced: false,
            verbs: vec!["create".to_string()],
            ..Default::default()
        }],
    })
    .into_response()
}

async fn solve(
    State(state): State<AppState>,
    Path((group, version, solver)): Path<(String, String, String)>,
    Json(mut payload): Json<ChallengePayload>,
) -> Response {
    if group != state.group_name || version != API_VERSION || solver != state.solver.name() {
        return not_found();
    }

    let Some(request) = payload.request.take() else {
        return (StatusCode::BAD_REQUEST, "payload has no request").into_response();
    };

    let result = match request.action.as_str() {
        ACTION_PRESENT => state.solver.present(&request).await.map_err(|e| e.to_string()),
        ACTION_CLEANUP => state.solver.cleanup(&request).await.map_err(|e| e.to_string()),
        other => {
            warn!(uid = %request.uid, action = %other, "Unknown challenge action");
            Err(format!("unknown action '{}'", other))
        }
    };

    payload.response = Some(match result {
        Ok(()) => ChallengeResponse::ok(&request.uid),
        Err(message) => ChallengeResponse::failure(&request.uid, message),
    });
    payload.request = Some(request);

    Json(payload).into_response()
}
