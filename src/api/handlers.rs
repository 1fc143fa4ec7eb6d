//! HTTP handlers, one entry point per client protocol.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde_json::{json, Value};

use super::auth::KeyStore;
use super::bridge::{Relay, RelayRequest};
use super::disconnect::DisconnectStream;
use crate::core::config::AppConfig;
use crate::core::logging::{generate_request_id, REQUEST_ID};
use crate::core::{metrics, AppError, Result, StreamCancelHandle};
use crate::services::{ClientPool, ModelRegistry};
use crate::transformer::{Protocol, TranslatorRegistry};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub registry: Arc<ModelRegistry>,
    pub keys: KeyStore,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        pool: Arc<ClientPool>,
        translators: Arc<TranslatorRegistry>,
    ) -> Self {
        Self {
            registry: pool.registry().clone(),
            relay: Relay::new(
                pool,
                translators,
                config.quota_exceeded.switch_project,
                config.keep_alive_interval(),
            ),
            keys: KeyStore::new(&config.api_keys),
        }
    }
}

/// Build the router with every relay endpoint.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .route("/v1/messages", post(messages))
        .route("/v1/models", get(list_models))
        .route("/v1beta/models", get(list_gemini_models))
        .route("/v1beta/models/:action", post(gemini_action))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/:action", post(gemini_cli_action))
        .with_state(state)
}

/// Where the model name and streaming flag come from.
#[derive(Debug, Default)]
struct Routing {
    model: Option<String>,
    stream: Option<bool>,
    query_key: Option<String>,
}

async fn dispatch(
    state: Arc<AppState>,
    protocol: Protocol,
    headers: HeaderMap,
    routing: Routing,
    body: Bytes,
) -> Response {
    REQUEST_ID
        .scope(generate_request_id(), async move {
            match relay(&state, protocol, &headers, routing, &body).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(%protocol, status = %e.status_code(), error = %e, "Request failed");
                    e.into_protocol_response(protocol)
                }
            }
        })
        .await
}

async fn relay(
    state: &AppState,
    protocol: Protocol,
    headers: &HeaderMap,
    routing: Routing,
    body: &[u8],
) -> Result<Response> {
    state.keys.verify(headers, routing.query_key.as_deref())?;

    let body: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("Invalid JSON: {}", e)))?;
    let model = routing
        .model
        .or_else(|| body.get("model").and_then(|m| m.as_str()).map(String::from))
        .filter(|m| !m.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing 'model' field".into()))?;
    let stream = routing
        .stream
        .unwrap_or_else(|| body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false));

    tracing::info!(%protocol, %model, stream, "Relaying request");
    let request = RelayRequest {
        client_protocol: protocol,
        model,
        body,
        stream,
    };

    if stream {
        let caller = StreamCancelHandle::new();
        let frames = state.relay.relay_stream(request, caller.clone()).await?;
        sse_response(frames, caller)
    } else {
        Ok(Json(state.relay.relay_non_stream(&request).await?).into_response())
    }
}

fn sse_response<S>(frames: S, caller: StreamCancelHandle) -> Result<Response>
where
    S: Stream<Item = std::result::Result<Bytes, Infallible>> + Send + 'static,
{
    let body = Body::from_stream(DisconnectStream::new(Box::pin(frames), caller));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Streaming flag for a generation method name.
fn parse_generate_method(method: &str) -> Result<bool> {
    match method {
        "generateContent" => Ok(false),
        "streamGenerateContent" => Ok(true),
        other => Err(AppError::BadRequest(format!("Unsupported method: {}", other))),
    }
}

/// Split `gemini-2.5-pro:streamGenerateContent` into model and streaming flag.
fn parse_gemini_action(action: &str) -> Result<(Option<String>, bool)> {
    let (model, method) = action
        .rsplit_once(':')
        .ok_or_else(|| AppError::BadRequest(format!("Unsupported action: {}", action)))?;
    let stream = parse_generate_method(method)?;
    let model = model.trim_start_matches("models/");
    Ok(((!model.is_empty()).then(|| model.to_string()), stream))
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state, Protocol::OpenAI, headers, Routing::default(), body).await
}

pub async fn responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state, Protocol::OpenAIResponses, headers, Routing::default(), body).await
}

pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state, Protocol::Claude, headers, Routing::default(), body).await
}

pub async fn gemini_action(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (model, stream) = match parse_gemini_action(&action) {
        Ok(parsed) => parsed,
        Err(e) => return e.into_protocol_response(Protocol::Gemini),
    };
    let routing = Routing {
        model,
        stream: Some(stream),
        query_key: query.get("key").cloned(),
    };
    dispatch(state, Protocol::Gemini, headers, routing, body).await
}

/// `POST /v1internal:generateContent` and `:streamGenerateContent`.
pub async fn gemini_cli_action(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let stream = match action.strip_prefix("v1internal:").map(parse_generate_method) {
        Some(Ok(stream)) => stream,
        Some(Err(e)) => return e.into_protocol_response(Protocol::GeminiCli),
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    let routing = Routing {
        model: None,
        stream: Some(stream),
        query_key: query.get("key").cloned(),
    };
    dispatch(state, Protocol::GeminiCli, headers, routing, body).await
}

/// `GET /v1/models`, in the Claude shape when the caller sends `anthropic-version`.
pub async fn list_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let protocol = if headers.contains_key("anthropic-version") {
        Protocol::Claude
    } else {
        Protocol::OpenAI
    };
    if let Err(e) = state.keys.verify(&headers, None) {
        return e.into_protocol_response(protocol);
    }
    Json(state.registry.available_models(protocol)).into_response()
}

pub async fn list_gemini_models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = state.keys.verify(&headers, query.get("key").map(String::as_str)) {
        return e.into_protocol_response(Protocol::Gemini);
    }
    Json(state.registry.available_models(Protocol::Gemini)).into_response()
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "clients": state.relay.pool().len(),
        "models": state.registry.available().len(),
    }))
    .into_response()
}

pub async fn metrics_handler() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
        .into_response()
}
