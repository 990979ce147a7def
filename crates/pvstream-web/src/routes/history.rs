//! History query route.
//!
//! ### `GET /api/pv-history/*pv?window=3600&max_points=1000`
//! Returns cached samples of `pv` from the last `window` seconds, downsampled
//! to at most `max_points`. Unknown variables yield an empty `data` array.
//!
//! ```json
//! {"pv": "SIM:TEMP:1", "window": 60.0, "max_points": 2,
//!  "data": [{"t": 1700000000.1, "v": 25.1}, {"t": 1700000030.4, "v": 25.3}]}
//! ```

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use pvstream_protocol::{HistoryQuery, HistoryResponse};

use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/pv-history/*pv", get(history_handler))
}

async fn history_handler(
    State(state): State<AppState>,
    Path(pv): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryResponse> {
    let pv = pv.strip_prefix('/').unwrap_or(&pv).to_string();
    let window = query.window();
    let max_points = query.max_points();
    let data = state.dispatcher.history().query(&pv, window, max_points);

    Json(HistoryResponse {
        pv,
        window,
        max_points,
        data,
    })
}
