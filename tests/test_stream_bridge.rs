//! Streaming bridge and failover tests.
//!
//! Backends are scripted clients; the bridge runs exactly as the HTTP layer
//! drives it, minus the response body wrapper.

mod common;

use assert_matches::assert_matches;
use axum::http::StatusCode;
use common::*;
use llm_relay_rust::api::{Relay, RelayRequest};
use llm_relay_rust::core::{AppError, StreamCancelHandle};
use llm_relay_rust::services::{BackendClient, ClientPool, ModelRegistry};
use llm_relay_rust::transformer::{Protocol, TranslatorRegistry};
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const MODEL: &str = "gemini-2.5-pro";

fn gemini(id: &str, reply: Reply) -> Arc<ScriptedClient> {
    Arc::new(ScriptedClient::new(id, Protocol::Gemini, &[MODEL], reply))
}

fn relay(pool: Arc<ClientPool>, failover: bool) -> Relay {
    Relay::new(
        pool,
        Arc::new(TranslatorRegistry::with_defaults()),
        failover,
        Duration::from_millis(500),
    )
}

fn openai_stream_request() -> RelayRequest {
    RelayRequest {
        client_protocol: Protocol::OpenAI,
        model: MODEL.to_string(),
        body: openai_chat(MODEL, true),
        stream: true,
    }
}

fn streamed_text(body: &str) -> String {
    data_payloads(body)
        .iter()
        .filter_map(|chunk| chunk.pointer("/choices/0/delta/content").and_then(Value::as_str))
        .collect()
}

#[tokio::test]
async fn test_quota_failover_is_invisible_to_caller() {
    let c1 = gemini("cred-1", Reply::Fail(429, quota_body()));
    let c2 = gemini("cred-2", Reply::Ok(gemini_text_chunks(&["Hello", " world"])));
    let c3 = gemini("cred-3", Reply::Ok(gemini_text_chunks(&["unused"])));
    let pool = pool_of(&[c1.clone(), c2.clone(), c3.clone()]);
    let registry = pool.registry().clone();
    let relay = relay(pool.clone(), true);

    let stream = relay
        .relay_stream(openai_stream_request(), StreamCancelHandle::new())
        .await
        .unwrap();
    let body = collect_body(stream).await;

    assert!(body.ends_with("data: [DONE]\n\n"), "body: {}", body);
    assert!(!body.contains("RESOURCE_EXHAUSTED"));
    assert!(!body.contains("\"error\""));
    assert_eq!(streamed_text(&body), "Hello world");

    let finish: Vec<Value> = data_payloads(&body)
        .into_iter()
        .filter_map(|c| c.pointer("/choices/0/finish_reason").cloned())
        .filter(|r| !r.is_null())
        .collect();
    assert_eq!(finish, vec![Value::from("stop")]);

    assert_eq!((c1.calls(), c2.calls(), c3.calls()), (1, 1, 0));
    assert!(registry.is_model_quota_exceeded("cred-1", MODEL));
    assert!(!registry.is_model_quota_exceeded("cred-2", MODEL));
    assert!(["cred-1", "cred-2", "cred-3"]
        .iter()
        .all(|id| !pool.is_client_locked(id)));

    // The flag lasts five minutes
    tokio::time::pause();
    tokio::time::advance(Duration::from_secs(299)).await;
    assert!(registry.is_model_quota_exceeded("cred-1", MODEL));
    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(!registry.is_model_quota_exceeded("cred-1", MODEL));
}

#[tokio::test]
async fn test_mid_stream_quota_replays_request_into_same_message() {
    let c1 = gemini(
        "cred-1",
        Reply::Partial(gemini_text_chunks(&["Hello"])[..1].to_vec(), 429, quota_body()),
    );
    // A fresh credential answers the whole request again
    let c2 = gemini("cred-2", Reply::Ok(gemini_text_chunks(&["Hello", " world"])));
    let pool = pool_of(&[c1.clone(), c2.clone()]);
    let relay = relay(pool.clone(), true);

    let stream = relay
        .relay_stream(openai_stream_request(), StreamCancelHandle::new())
        .await
        .unwrap();
    let body = collect_body(stream).await;

    assert!(body.ends_with("data: [DONE]\n\n"));
    assert!(!body.contains("\"error\""));
    // Text delivered before the 429 stays delivered; the replay follows it
    assert_eq!(streamed_text(&body), "HelloHello world");
    assert_eq!(c2.bodies(), c1.bodies());

    let payloads = data_payloads(&body);
    let roles = payloads
        .iter()
        .filter(|c| c.pointer("/choices/0/delta/role").is_some())
        .count();
    assert_eq!(roles, 1);
    let ids: std::collections::HashSet<&str> =
        payloads.iter().filter_map(|c| c["id"].as_str()).collect();
    assert_eq!(ids.len(), 1);
    let finish: Vec<&str> = payloads
        .iter()
        .filter_map(|c| c.pointer("/choices/0/finish_reason").and_then(Value::as_str))
        .collect();
    assert_eq!(finish, vec!["stop"]);
    assert!(pool.registry().is_model_quota_exceeded("cred-1", MODEL));
}

#[tokio::test]
async fn test_stream_failover_ends_when_every_credential_was_tried() {
    let c1 = gemini("cred-1", Reply::Fail(429, quota_body()));
    let c2 = gemini("cred-2", Reply::Fail(429, quota_body()));
    let clients = vec![
        c1.clone() as Arc<dyn BackendClient>,
        c2.clone() as Arc<dyn BackendClient>,
    ];
    // Quota flags expire at once, so only the per-request record stops the loop
    let pool = Arc::new(ClientPool::new(
        clients,
        Arc::new(ModelRegistry::with_ttl(Duration::ZERO)),
    ));
    let relay = relay(pool.clone(), true);

    let stream = relay
        .relay_stream(openai_stream_request(), StreamCancelHandle::new())
        .await
        .unwrap();
    let body = tokio::time::timeout(Duration::from_secs(5), collect_body(stream))
        .await
        .expect("failover must stop after every credential was tried");

    let payloads = data_payloads(&body);
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["error"]["code"], "RESOURCE_EXHAUSTED");
    assert_eq!((c1.calls(), c2.calls()), (1, 1));
    assert!(!pool.is_client_locked("cred-1"));
    assert!(!pool.is_client_locked("cred-2"));
}

#[tokio::test]
async fn test_non_stream_failover_ends_when_every_credential_was_tried() {
    let c1 = gemini("cred-1", Reply::Fail(429, quota_body()));
    let clients = vec![c1.clone() as Arc<dyn BackendClient>];
    let pool = Arc::new(ClientPool::new(
        clients,
        Arc::new(ModelRegistry::with_ttl(Duration::ZERO)),
    ));
    let relay = relay(pool, true);

    let request = RelayRequest {
        client_protocol: Protocol::OpenAI,
        model: MODEL.to_string(),
        body: openai_chat(MODEL, false),
        stream: false,
    };
    let err = tokio::time::timeout(Duration::from_secs(5), relay.relay_non_stream(&request))
        .await
        .expect("failover must stop after every credential was tried")
        .unwrap_err();
    assert_matches!(err, AppError::NoCandidate { .. });
    assert_eq!(c1.calls(), 1);
}

fn paced(steps: &[(u64, &str)]) -> Reply {
    let mut chunks = gemini_text_chunks(&steps.iter().map(|(_, t)| *t).collect::<Vec<_>>());
    let finish = chunks.pop().unwrap();
    let mut paced: Vec<(u64, String)> = steps
        .iter()
        .map(|(delay, _)| *delay)
        .zip(chunks)
        .collect();
    paced.push((0, finish));
    Reply::Paced(paced)
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_waits_a_full_period_after_first_frame() {
    // First chunk arrives long after the period, the second shortly after it
    let c1 = gemini("cred-1", paced(&[(2000, "Hel"), (200, "lo")]));
    let relay = relay(pool_of(&[c1]), true);

    let stream = relay
        .relay_stream(openai_stream_request(), StreamCancelHandle::new())
        .await
        .unwrap();
    let body = collect_body(stream).await;

    assert_eq!(streamed_text(&body), "Hello");
    assert!(!body.contains(": keep-alive"), "body: {}", body);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_fills_gaps_between_frames() {
    let c1 = gemini("cred-1", paced(&[(0, "Hel"), (1200, "lo")]));
    let relay = relay(pool_of(&[c1]), true);

    let stream = relay
        .relay_stream(openai_stream_request(), StreamCancelHandle::new())
        .await
        .unwrap();
    let body = collect_body(stream).await;

    assert_eq!(body.matches(": keep-alive\n\n").count(), 2);
    assert!(body.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn test_non_quota_error_becomes_error_frame() {
    let c1 = gemini("cred-1", Reply::Fail(500, r#"{"error":{"message":"boom"}}"#.into()));
    let c2 = gemini("cred-2", Reply::Ok(gemini_text_chunks(&["unused"])));
    let relay = relay(pool_of(&[c1.clone(), c2.clone()]), true);

    let stream = relay
        .relay_stream(openai_stream_request(), StreamCancelHandle::new())
        .await
        .unwrap();
    let body = collect_body(stream).await;

    assert!(!body.contains("[DONE]"));
    let payloads = data_payloads(&body);
    assert_eq!(payloads.last().unwrap()["error"]["message"], "boom");
    assert_eq!(c2.calls(), 0);
}

#[tokio::test]
async fn test_every_credential_exhausted_mid_stream() {
    let clients: Vec<_> = (1..=3)
        .map(|n| gemini(&format!("cred-{}", n), Reply::Fail(429, quota_body())))
        .collect();
    let pool = pool_of(&clients);
    let relay = relay(pool.clone(), true);

    let stream = relay
        .relay_stream(openai_stream_request(), StreamCancelHandle::new())
        .await
        .unwrap();
    let body = collect_body(stream).await;

    let payloads = data_payloads(&body);
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["error"]["code"], "RESOURCE_EXHAUSTED");
    assert!(clients.iter().all(|c| c.calls() == 1));
    assert_eq!(pool.registry().available_count(MODEL), 0);
}

#[tokio::test]
async fn test_exhausted_before_start_is_plain_429() {
    let c1 = gemini("cred-1", Reply::Ok(gemini_text_chunks(&["unused"])));
    let pool = pool_of(&[c1.clone()]);
    pool.registry().set_model_quota_exceeded("cred-1", MODEL);
    let relay = relay(pool, true);

    let err = relay
        .relay_stream(openai_stream_request(), StreamCancelHandle::new())
        .await
        .err()
        .unwrap();
    assert_matches!(err, AppError::NoCandidate { .. });
    assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(c1.calls(), 0);
}

#[tokio::test]
async fn test_unknown_model_rejected() {
    let relay = relay(pool_of(&[gemini("cred-1", Reply::Hang)]), true);
    let mut request = openai_stream_request();
    request.model = "no-such-model".into();

    let err = relay
        .relay_stream(request, StreamCancelHandle::new())
        .await
        .err()
        .unwrap();
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_failover_disabled_still_flags_credential() {
    let c1 = gemini("cred-1", Reply::Fail(429, quota_body()));
    let c2 = gemini("cred-2", Reply::Ok(gemini_text_chunks(&["unused"])));
    let pool = pool_of(&[c1.clone(), c2.clone()]);
    let relay = relay(pool.clone(), false);

    let stream = relay
        .relay_stream(openai_stream_request(), StreamCancelHandle::new())
        .await
        .unwrap();
    let body = collect_body(stream).await;

    assert!(body.contains("\"error\""));
    assert_eq!(c2.calls(), 0);
    assert!(pool.registry().is_model_quota_exceeded("cred-1", MODEL));
}

#[tokio::test]
async fn test_claude_caller_gets_event_named_frames() {
    let c1 = gemini("cred-1", Reply::Ok(gemini_text_chunks(&["Hi there"])));
    let relay = relay(pool_of(&[c1]), true);
    let request = RelayRequest {
        client_protocol: Protocol::Claude,
        model: MODEL.to_string(),
        body: serde_json::json!({
            "model": MODEL,
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "Hi"}],
            "stream": true
        }),
        stream: true,
    };

    let stream = relay
        .relay_stream(request, StreamCancelHandle::new())
        .await
        .unwrap();
    let body = collect_body(stream).await;

    let events: Vec<&str> = body
        .lines()
        .filter_map(|l| l.strip_prefix("event: "))
        .collect();
    assert_eq!(
        events,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    assert!(!body.contains("[DONE]"));
}

#[tokio::test]
async fn test_non_stream_failover() {
    let c1 = gemini("cred-1", Reply::Fail(429, quota_body()));
    let c2 = gemini("cred-2", Reply::Ok(vec![gemini_response("Hello")]));
    let pool = pool_of(&[c1.clone(), c2.clone()]);
    let relay = relay(pool.clone(), true);

    let request = RelayRequest {
        client_protocol: Protocol::OpenAI,
        model: MODEL.to_string(),
        body: openai_chat(MODEL, false),
        stream: false,
    };
    let response = relay.relay_non_stream(&request).await.unwrap();

    assert_eq!(response["object"], "chat.completion");
    assert_eq!(response["choices"][0]["message"]["content"], "Hello");
    assert_eq!(response["choices"][0]["finish_reason"], "stop");
    assert_eq!((c1.calls(), c2.calls()), (1, 1));
    assert!(pool.registry().is_model_quota_exceeded("cred-1", MODEL));
}

#[tokio::test]
async fn test_non_stream_upstream_error_passes_through() {
    let body = r#"{"error":{"code":400,"message":"bad","status":"INVALID_ARGUMENT"}}"#;
    let c1 = gemini("cred-1", Reply::Fail(400, body.into()));
    let relay = relay(pool_of(&[c1]), true);

    let request = RelayRequest {
        client_protocol: Protocol::OpenAI,
        model: MODEL.to_string(),
        body: openai_chat(MODEL, false),
        stream: false,
    };
    match relay.relay_non_stream(&request).await {
        Err(AppError::Upstream { status, body: got }) => {
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(got, body);
        }
        other => panic!("expected upstream error, got {:?}", other),
    }
}
