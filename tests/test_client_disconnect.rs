//! Caller disconnects must cancel the backend stream and free the credential.

mod common;

use common::*;
use futures::StreamExt;
use llm_relay_rust::api::{DisconnectStream, Relay, RelayRequest};
use llm_relay_rust::core::StreamCancelHandle;
use llm_relay_rust::services::ClientPool;
use llm_relay_rust::transformer::{Protocol, TranslatorRegistry};
use std::sync::Arc;
use std::time::Duration;

const MODEL: &str = "gemini-2.5-pro";

fn setup(reply: Reply) -> (Arc<ScriptedClient>, Arc<ClientPool>, Relay) {
    let client = Arc::new(ScriptedClient::new("cred-1", Protocol::Gemini, &[MODEL], reply));
    let pool = pool_of(&[client.clone()]);
    let relay = Relay::new(
        pool.clone(),
        Arc::new(TranslatorRegistry::with_defaults()),
        true,
        Duration::from_secs(60),
    );
    (client, pool, relay)
}

fn request() -> RelayRequest {
    RelayRequest {
        client_protocol: Protocol::OpenAI,
        model: MODEL.to_string(),
        body: openai_chat(MODEL, true),
        stream: true,
    }
}

#[tokio::test]
async fn test_dropped_body_cancels_backend_and_releases_credential() {
    let (client, pool, relay) = setup(Reply::Hang);
    let caller = StreamCancelHandle::new();
    let frames = relay.relay_stream(request(), caller.clone()).await.unwrap();
    let mut body = DisconnectStream::new(Box::pin(frames), caller.clone());

    // Nothing arrives from a hanging backend
    assert!(tokio::time::timeout(Duration::from_millis(50), body.next())
        .await
        .is_err());
    assert_eq!(client.calls(), 1);
    assert!(pool.is_client_locked("cred-1"));

    drop(body);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(caller.is_cancelled());
    assert_eq!(client.cancels(), 1);
    assert!(!pool.is_client_locked("cred-1"));
}

#[tokio::test]
async fn test_cancel_signal_ends_stream_without_frames() {
    let (client, pool, relay) = setup(Reply::Hang);
    let caller = StreamCancelHandle::new();
    let mut frames = Box::pin(relay.relay_stream(request(), caller.clone()).await.unwrap());

    let cancel = caller.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let next = tokio::time::timeout(Duration::from_secs(1), frames.next())
        .await
        .expect("stream must end after cancel");
    assert!(next.is_none());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.cancels(), 1);
    assert!(!pool.is_client_locked("cred-1"));
}

#[tokio::test]
async fn test_completed_stream_is_not_treated_as_disconnect() {
    let (client, pool, relay) = setup(Reply::Ok(gemini_text_chunks(&["done"])));
    let caller = StreamCancelHandle::new();
    let frames = relay.relay_stream(request(), caller.clone()).await.unwrap();
    let body = DisconnectStream::new(Box::pin(frames), caller.clone());

    let text = collect_body(body).await;
    assert!(text.ends_with("data: [DONE]\n\n"));
    assert!(caller.is_completed());
    assert!(!caller.is_cancelled());
    assert_eq!(client.cancels(), 0);
    assert!(!pool.is_client_locked("cred-1"));
}
