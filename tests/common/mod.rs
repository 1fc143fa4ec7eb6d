//! Scripted backend clients shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use llm_relay_rust::core::StreamCancelHandle;
use llm_relay_rust::services::{
    BackendClient, BackendError, BackendStream, ClientIdentity, ClientPool, ModelInfo,
    ModelRegistry,
};
use llm_relay_rust::transformer::Protocol;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// What a scripted client answers with.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Non-streaming body is the first entry; streams send every entry as one chunk
    Ok(Vec<String>),
    Fail(u16, String),
    /// Stream these chunks, then fail
    Partial(Vec<String>, u16, String),
    /// Stream each chunk after waiting the given milliseconds
    Paced(Vec<(u64, String)>),
    /// Never answer; streams wait for cancellation
    Hang,
}

pub struct ScriptedClient {
    id: String,
    protocol: Protocol,
    models: Vec<String>,
    reply: Mutex<Reply>,
    calls: AtomicUsize,
    cancels: Arc<AtomicUsize>,
    bodies: Mutex<Vec<Value>>,
    /// When set, non-streaming calls take a permit before answering
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedClient {
    pub fn new(id: &str, protocol: Protocol, models: &[&str], reply: Reply) -> Self {
        Self {
            id: id.to_string(),
            protocol,
            models: models.iter().map(|m| m.to_string()).collect(),
            reply: Mutex::new(reply),
            calls: AtomicUsize::new(0),
            cancels: Arc::new(AtomicUsize::new(0)),
            bodies: Mutex::new(vec![]),
            gate: None,
        }
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Streams that observed their cancel handle firing.
    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Bodies received, in order.
    pub fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }

    fn record(&self, body: Value) -> Reply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().unwrap().push(body);
        self.reply.lock().unwrap().clone()
    }
}

fn error(status: u16, body: String) -> BackendError {
    BackendError::new(StatusCode::from_u16(status).unwrap(), body)
}

#[async_trait]
impl BackendClient for ScriptedClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            email: Some(format!("{}@example.com", self.id)),
            project_id: None,
            has_api_key: true,
        }
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.models
            .iter()
            .map(|m| ModelInfo::new(m.as_str(), "test"))
            .collect()
    }

    async fn send_raw_message(&self, _model: &str, body: Value) -> Result<Bytes, BackendError> {
        let reply = self.record(body);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        match reply {
            Reply::Ok(bodies) => Ok(Bytes::from(bodies.into_iter().next().unwrap_or_default())),
            Reply::Paced(chunks) => Ok(Bytes::from(
                chunks.into_iter().next().map(|(_, c)| c).unwrap_or_default(),
            )),
            Reply::Fail(status, body) | Reply::Partial(_, status, body) => {
                Err(error(status, body))
            }
            Reply::Hang => std::future::pending().await,
        }
    }

    async fn send_raw_message_stream(
        &self,
        _model: &str,
        body: Value,
        cancel: StreamCancelHandle,
    ) -> BackendStream {
        let reply = self.record(body);
        let cancels = self.cancels.clone();
        let (tx, stream) = BackendStream::channel();
        tokio::spawn(async move {
            match reply {
                Reply::Ok(chunks) => {
                    for chunk in chunks {
                        if tx.chunks.send(Bytes::from(chunk)).await.is_err() {
                            return;
                        }
                    }
                }
                Reply::Fail(status, body) => {
                    let _ = tx.errors.send(error(status, body)).await;
                }
                Reply::Paced(chunks) => {
                    for (delay_ms, chunk) in chunks {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        if tx.chunks.send(Bytes::from(chunk)).await.is_err() {
                            return;
                        }
                    }
                }
                Reply::Partial(chunks, status, body) => {
                    for chunk in chunks {
                        let _ = tx.chunks.send(Bytes::from(chunk)).await;
                    }
                    let _ = tx.errors.send(error(status, body)).await;
                }
                Reply::Hang => {
                    cancel.cancelled().await;
                    cancels.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        stream
    }
}

pub fn pool_of(clients: &[Arc<ScriptedClient>]) -> Arc<ClientPool> {
    let clients: Vec<Arc<dyn BackendClient>> = clients
        .iter()
        .map(|c| c.clone() as Arc<dyn BackendClient>)
        .collect();
    Arc::new(ClientPool::new(clients, Arc::new(ModelRegistry::new())))
}

/// Gemini-protocol stream chunks for `parts`, finishing with STOP.
pub fn gemini_text_chunks(parts: &[&str]) -> Vec<String> {
    let mut chunks: Vec<String> = parts
        .iter()
        .map(|text| {
            json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}],
                "modelVersion": "gemini-2.5-pro"
            })
            .to_string()
        })
        .collect();
    chunks.push(
        json!({
            "candidates": [{
                "content": {"role": "model", "parts": []},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2, "totalTokenCount": 7}
        })
        .to_string(),
    );
    chunks
}

/// A complete Gemini `generateContent` response.
pub fn gemini_response(text: &str) -> String {
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": "STOP"
        }],
        "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 1, "totalTokenCount": 6},
        "modelVersion": "gemini-2.5-pro"
    })
    .to_string()
}

pub fn quota_body() -> String {
    json!({
        "error": {"code": 429, "message": "Resource has been exhausted", "status": "RESOURCE_EXHAUSTED"}
    })
    .to_string()
}

pub fn openai_chat(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "Hi"}],
        "stream": stream
    })
}

/// Drain a relay stream into one string.
pub async fn collect_body<S>(stream: S) -> String
where
    S: Stream<Item = Result<Bytes, std::convert::Infallible>>,
{
    let chunks: Vec<_> = stream.collect().await;
    chunks
        .into_iter()
        .map(|c| String::from_utf8(c.unwrap().to_vec()).unwrap())
        .collect()
}

/// JSON payloads of every `data:` line, skipping `[DONE]`.
pub fn data_payloads(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}
