//! HTTP handlers.
//!
//! Every counter route accepts `/{namespace}/{key}` or `/{key}` (namespace
//! `default`). Errors render as `{"error": "..."}`.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderName};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use tally_core::{Topic, TopicError};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::counter::CounterError;
use crate::health::{self, HealthResponse};
use crate::server::AppState;
use crate::stream::{ChannelTransport, StreamError, StreamStats};

/// Frames buffered between a session worker and the response body.
const STREAM_BODY_BUFFER: usize = 4;

/// Handler error rendered as a JSON body.
#[derive(Debug)]
pub enum ApiError {
    /// 400
    BadRequest(String),
    /// 404
    NotFound(String),
    /// 409
    Conflict(String),
    /// 503
    Unavailable(String),
    /// 500
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Conflict(m) => (StatusCode::CONFLICT, m),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<TopicError> for ApiError {
    fn from(error: TopicError) -> Self {
        Self::BadRequest(error.to_string())
    }
}

impl From<CounterError> for ApiError {
    fn from(error: CounterError) -> Self {
        match error {
            CounterError::AlreadyExists(_) | CounterError::Missing(_) => {
                Self::Conflict(error.to_string())
            }
            CounterError::NotFound(_) => Self::NotFound(error.to_string()),
            CounterError::Overflow(_) => Self::BadRequest(error.to_string()),
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(error: StreamError) -> Self {
        match error {
            StreamError::CapacityExceeded { .. }
            | StreamError::ShuttingDown
            | StreamError::SessionClosed => Self::Unavailable(error.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

fn topic_from(params: &HashMap<String, String>) -> Result<Topic, ApiError> {
    let key = params.get("key").map_or("", String::as_str);
    let topic = match params.get("namespace") {
        Some(namespace) => Topic::new(namespace, key)?,
        None => Topic::in_default(key)?,
    };
    Ok(topic)
}

/// GET /stream/{namespace}/{key}
pub async fn stream_handler(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let topic = topic_from(&params)?;
    let initial = state.counters.get(&topic);
    let (transport, rx) = ChannelTransport::new(STREAM_BODY_BUFFER);
    let session = state.lifecycle.accept_stream(topic, transport, initial)?;
    debug!(session_id = %session.id(), topic = %session.topic(), "stream accepted");

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let headers = [
        (CONTENT_TYPE, "text/event-stream"),
        (CACHE_CONTROL, "no-cache"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    Ok((headers, body).into_response())
}

/// GET /hit/{namespace}/{key}
pub async fn hit_handler(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let topic = topic_from(&params)?;
    let value = state.counters.hit(&topic)?;
    counter!(crate::metrics::COUNTER_HITS_TOTAL).increment(1);
    let _ = state.lifecycle.on_hit(topic, value);
    Ok(Json(json!({ "value": value })))
}

/// GET /get/{namespace}/{key}
pub async fn get_handler(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let topic = topic_from(&params)?;
    let value = state
        .counters
        .get(&topic)
        .ok_or_else(|| ApiError::NotFound(CounterError::NotFound(topic).to_string()))?;
    Ok(Json(json!({ "value": value })))
}

/// Query string for `/create`.
#[derive(Debug, Default, Deserialize)]
pub struct CreateQuery {
    /// Starting value; defaults to `0`.
    pub initializer: Option<String>,
}

/// GET|POST /create/{namespace}/{key}?initializer=N
pub async fn create_handler(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<CreateQuery>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let topic = topic_from(&params)?;
    create_counter(&state, topic, &query)
}

/// GET|POST /create?initializer=N, under a random namespace and key.
pub async fn create_random_handler(
    State(state): State<AppState>,
    Query(query): Query<CreateQuery>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    create_counter(&state, Topic::random(), &query)
}

fn create_counter(
    state: &AppState,
    topic: Topic,
    query: &CreateQuery,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let initial = match query.initializer.as_deref() {
        None | Some("") => 0,
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| ApiError::BadRequest("initializer must be a number".into()))?,
    };
    let value = state.counters.create(&topic, initial)?;
    info!(%topic, value, "counter created");
    let _ = state.lifecycle.on_hit(topic.clone(), value);
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "namespace": topic.namespace(),
            "key": topic.key(),
            "value": value,
        })),
    ))
}

/// Query string for `/set` and `/update`.
#[derive(Debug, Default, Deserialize)]
pub struct ValueQuery {
    /// New value (`/set`) or signed delta (`/update`).
    pub value: Option<String>,
}

impl ValueQuery {
    fn parse(&self) -> Result<i64, ApiError> {
        match self.value.as_deref() {
            None | Some("") => Err(ApiError::BadRequest(
                "value is required, please provide a number in the fmt of ?value=NEW_VALUE".into(),
            )),
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| ApiError::BadRequest("value must be a number".into())),
        }
    }
}

/// POST /set/{namespace}/{key}?value=N
pub async fn set_handler(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<ValueQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let value = query.parse()?;
    let topic = topic_from(&params)?;
    let value = state.counters.set(&topic, value)?;
    info!(%topic, value, "counter set");
    let _ = state.lifecycle.on_hit(topic, value);
    Ok(Json(json!({ "value": value })))
}

/// POST /reset/{namespace}/{key}
pub async fn reset_handler(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let topic = topic_from(&params)?;
    let value = state.counters.reset(&topic)?;
    info!(%topic, "counter reset");
    let _ = state.lifecycle.on_hit(topic, value);
    Ok(Json(json!({ "value": value })))
}

/// POST /update/{namespace}/{key}?value=DELTA
pub async fn update_handler(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<ValueQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let delta = query.parse()?;
    if delta == 0 {
        return Err(ApiError::BadRequest(
            "changing value by 0 does nothing, please provide a non-zero value".into(),
        ));
    }
    let topic = topic_from(&params)?;
    let value = state.counters.update_by(&topic, delta)?;
    debug!(%topic, delta, value, "counter updated");
    let _ = state.lifecycle.on_hit(topic, value);
    Ok(Json(json!({ "value": value })))
}

/// GET /info/{namespace}/{key}
///
/// `value` is `-1` when the counter does not exist.
pub async fn info_handler(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let topic = topic_from(&params)?;
    let value = state.counters.get(&topic);
    Ok(Json(json!({
        "value": value.unwrap_or(-1),
        "full_key": topic.to_string(),
        "exists": value.is_some(),
        "streams": state.lifecycle.subscriber_count(&topic),
    })))
}

/// POST /delete/{namespace}/{key}
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let topic = topic_from(&params)?;
    if state.counters.delete(&topic).is_err() {
        debug!(%topic, "delete of missing counter");
    }
    let closed = state.lifecycle.close_topic(&topic);
    info!(%topic, closed, "counter deleted");
    Ok(Json(json!({
        "status": "ok",
        "message": format!("Deleted key: {topic}"),
        "closed_streams": closed,
    })))
}

/// GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StreamStats> {
    Json(state.lifecycle.stats())
}

/// GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.lifecycle.active_sessions(),
        state.counters.len(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.as_ref() {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => {
            warn!("metrics requested but no recorder installed");
            ApiError::NotFound("metrics recorder not installed".into()).into_response()
        }
    }
}
