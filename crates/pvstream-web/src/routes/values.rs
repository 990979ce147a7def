//! One-off variable reads and writes.
//!
//! # Endpoints
//!
//! ### `GET /api/pvs`
//! Names of all variables with a known value.
//!
//! ### `GET /api/pv/*pv`
//! Current value of one variable, `404` if none is known.
//!
//! ### `PUT /api/pv/*pv`
//! Write `{"value": v}` through the active source:
//! - `204` written
//! - `404` unknown variable
//! - `422` rejected by the source, or a missing value
//! - `504` the device did not acknowledge in time
//! - `503` the source is unavailable

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use pvstream_core::{PvError, Severity};
use pvstream_protocol::round_millis;
use pvstream_sources::ValueSource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/pvs", get(list_handler))
        .route("/pv/*pv", get(get_handler).put(put_handler))
}

/// Current value of one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentValue {
    pub pv: String,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

/// Body of a put request.
#[derive(Debug, Clone, Deserialize)]
pub struct PutBody {
    #[serde(default)]
    pub value: Value,
}

/// Known variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableList {
    pub pvs: Vec<String>,
}

/// Error response carrying a [`PvError`].
pub struct ApiError(PvError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PvError::UnknownVariable(_) => StatusCode::NOT_FOUND,
            PvError::WriteRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PvError::WriteTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PvError::SourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PvError::CallbackFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn variable_name(path: &str) -> String {
    path.strip_prefix('/').unwrap_or(path).to_string()
}

async fn list_handler(State(state): State<AppState>) -> Json<VariableList> {
    Json(VariableList {
        pvs: state.dispatcher.variables(),
    })
}

async fn get_handler(
    State(state): State<AppState>,
    Path(pv): Path<String>,
) -> Result<Json<CurrentValue>, ApiError> {
    let pv = variable_name(&pv);
    let value = state
        .source
        .current_value(&pv)
        .ok_or_else(|| ApiError(PvError::UnknownVariable(pv.clone())))?;
    let last = state.dispatcher.current(&pv);

    Ok(Json(CurrentValue {
        timestamp: last.as_ref().map(|u| round_millis(u.timestamp)),
        severity: last.as_ref().map(|u| u.severity),
        pv,
        value,
    }))
}

async fn put_handler(
    State(state): State<AppState>,
    Path(pv): Path<String>,
    Json(body): Json<PutBody>,
) -> Result<StatusCode, ApiError> {
    let pv = variable_name(&pv);
    if body.value.is_null() {
        return Err(ApiError(PvError::rejected(pv, "value is required")));
    }

    match state.source.put(&pv, body.value.clone()).await {
        Ok(()) => {
            info!(pv = %pv, value = %body.value, "Put via HTTP");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) => {
            warn!(pv = %pv, error = %e, "Put via HTTP failed");
            Err(ApiError(e))
        }
    }
}
