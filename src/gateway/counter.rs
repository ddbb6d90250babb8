use super::AppState;
use crate::counter::COUNTER_ID;
use axum::{body::Bytes, extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::Value;

const MISSING_ACTION: &str = "missing action parameter";
const INVALID_ACTION: &str = "invalid action parameter";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterAction {
    Increment,
    Clear,
}

/// Reads `action` from a JSON body. A body that is not a JSON object counts
/// as having no action.
fn parse_action(body: &[u8]) -> Result<CounterAction, &'static str> {
    let value: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let Some(action) = value.get("action") else {
        return Err(MISSING_ACTION);
    };
    match action.as_str() {
        Some("inc") => Ok(CounterAction::Increment),
        Some("clear") => Ok(CounterAction::Clear),
        _ => Err(INVALID_ACTION),
    }
}

fn success(data: Value) -> Json<Value> {
    Json(serde_json::json!({ "code": 0, "data": data }))
}

fn failure(message: &str) -> Json<Value> {
    Json(serde_json::json!({ "code": -1, "errorMsg": message }))
}

pub(super) async fn handle_get_count(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.record_counter_action("get");
    match state.counter_store.get(COUNTER_ID).await {
        Ok(counter) => (
            StatusCode::OK,
            success(Value::from(counter.map_or(0, |c| c.count))),
        ),
        Err(err) => {
            tracing::error!("Counter read failed: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                failure("counter storage unavailable"),
            )
        }
    }
}

pub(super) async fn handle_post_count(
    State(state): State<AppState>,
    body: Bytes,
) -> impl IntoResponse {
    let action = match parse_action(&body) {
        Ok(action) => action,
        Err(message) => {
            state.metrics.record_counter_action("invalid");
            return (StatusCode::OK, failure(message));
        }
    };

    let result = match action {
        CounterAction::Increment => {
            state.metrics.record_counter_action("inc");
            state
                .counter_store
                .increment(COUNTER_ID)
                .await
                .map(|counter| success(Value::from(counter.count)))
        }
        CounterAction::Clear => {
            state.metrics.record_counter_action("clear");
            state
                .counter_store
                .delete(COUNTER_ID)
                .await
                .map(|_| success(serde_json::json!({})))
        }
    };

    match result {
        Ok(envelope) => (StatusCode::OK, envelope),
        Err(err) => {
            tracing::error!("Counter {action:?} failed: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                failure("counter storage unavailable"),
            )
        }
    }
}
