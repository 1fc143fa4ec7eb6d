//! Relay of one caller request through the client pool.
//!
//! The non-streaming path runs the pool's failover loop around one backend
//! call. The streaming path keeps the caller's connection open across
//! failovers: each attempt gets its own cancellable backend scope and decoder
//! state, while the encoder state (and so the caller-visible message) persists.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use serde_json::Value;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::core::logging::CREDENTIAL_CONTEXT;
use crate::core::{get_metrics, AppError, Result, StreamCancelHandle};
use crate::services::{BackendError, ClientLease, ClientPool};
use crate::transformer::stream::{done_frame, error_frame, framing_for, keep_alive_frame};
use crate::transformer::{Protocol, ResponseContext, StreamState, TranslatorRegistry};

/// One caller request, already parsed.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub client_protocol: Protocol,
    pub model: String,
    pub body: Value,
    pub stream: bool,
}

/// Pool, translators and failover policy shared by every request.
#[derive(Clone)]
pub struct Relay {
    pool: Arc<ClientPool>,
    translators: Arc<TranslatorRegistry>,
    failover: bool,
    keep_alive: Duration,
}

enum BridgeEvent {
    Disconnected,
    Chunk(Bytes),
    ChunksClosed,
    Error(BackendError),
    ErrorsClosed,
    KeepAlive,
}

/// Cancels a backend attempt when the bridge is dropped mid-stream.
struct CancelOnDrop(StreamCancelHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

struct ActiveStream;

impl ActiveStream {
    fn new() -> Self {
        get_metrics().active_streams.inc();
        ActiveStream
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        get_metrics().active_streams.dec();
    }
}

fn record_request(client: Protocol, backend: Option<Protocol>, status: u16) {
    get_metrics()
        .request_count
        .with_label_values(&[
            client.as_str(),
            backend.map(Protocol::as_str).unwrap_or("none"),
            &status.to_string(),
        ])
        .inc();
}

impl Relay {
    pub fn new(
        pool: Arc<ClientPool>,
        translators: Arc<TranslatorRegistry>,
        failover: bool,
        keep_alive: Duration,
    ) -> Self {
        Self {
            pool,
            translators,
            failover,
            keep_alive,
        }
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    /// Select a credential not yet tried and translate the request for it.
    async fn prepare(
        pool: &ClientPool,
        translators: &TranslatorRegistry,
        request: &RelayRequest,
        tried: &HashSet<String>,
    ) -> Result<(ClientLease, Value)> {
        let lease = pool.select_client_excluding(&request.model, tried).await?;
        let backend = lease.client().protocol();
        if request.stream && !translators.supports_streaming(request.client_protocol, backend) {
            return Err(AppError::StreamingUnsupported);
        }
        let translated = translators.request(
            request.client_protocol,
            backend,
            &request.model,
            request.body.clone(),
            request.stream,
        )?;
        Ok((lease, translated))
    }

    /// Relay a non-streaming request and return the caller-protocol body.
    pub async fn relay_non_stream(&self, request: &RelayRequest) -> Result<Value> {
        let client = request.client_protocol;
        let result = self
            .pool
            .execute(&request.model, self.failover, |lease| {
                let translators = self.translators.clone();
                let credential = lease.id().to_string();
                CREDENTIAL_CONTEXT.scope(credential, async move {
                    let backend = lease.client().protocol();
                    let translated = translators.request(
                        client,
                        backend,
                        &request.model,
                        request.body.clone(),
                        false,
                    )?;
                    let response = lease
                        .client()
                        .send_raw_message(&request.model, translated.clone())
                        .await;
                    let result = response.map_err(AppError::from).and_then(|bytes| {
                        let ctx = ResponseContext::new(
                            request.model.clone(),
                            request.body.clone(),
                            translated,
                        );
                        translators.response_non_stream(client, backend, &ctx, &bytes)
                    });
                    let status = match &result {
                        Ok(_) => 200,
                        Err(e) => e.status_code().as_u16(),
                    };
                    record_request(client, Some(backend), status);
                    result
                })
            })
            .await;
        if let Err(e) = &result {
            if !matches!(e, AppError::Upstream { .. }) {
                record_request(client, None, e.status_code().as_u16());
            }
        }
        result
    }

    /// Relay a streaming request.
    ///
    /// The first selection and translation happen before returning, so those
    /// failures surface as a plain HTTP error. Everything after is delivered as
    /// frames in the caller's protocol.
    pub async fn relay_stream(
        &self,
        request: RelayRequest,
        caller_cancel: StreamCancelHandle,
    ) -> Result<impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send + 'static> {
        let first = match Self::prepare(&self.pool, &self.translators, &request, &HashSet::new()).await {
            Ok(first) => first,
            Err(e) => {
                record_request(request.client_protocol, None, e.status_code().as_u16());
                return Err(e);
            }
        };

        let pool = self.pool.clone();
        let translators = self.translators.clone();
        let failover = self.failover;
        let period = self.keep_alive;

        Ok(async_stream::stream! {
            let _active = ActiveStream::new();
            let client = request.client_protocol;
            let model = request.model.clone();
            let framing = framing_for(client);
            let mut state = StreamState::new(&model);
            let mut delivered = false;
            let mut keep_alive = interval_at(Instant::now() + period, period);
            keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut next = Some(first);
            let mut tried = HashSet::new();

            'attempts: loop {
                let (lease, translated) = match next.take() {
                    Some(prepared) => prepared,
                    None => match Self::prepare(&pool, &translators, &request, &tried).await {
                        Ok(prepared) => prepared,
                        Err(e) => {
                            tracing::warn!(%model, error = %e, "No credential left for stream");
                            record_request(client, None, e.status_code().as_u16());
                            caller_cancel.mark_completed();
                            yield Ok(Bytes::from(error_frame(client, &e.protocol_body(client))));
                            break 'attempts;
                        }
                    },
                };
                tried.insert(lease.id().to_string());
                let backend = lease.client().protocol();
                let ctx = ResponseContext::new(model.clone(), request.body.clone(), translated.clone());
                let attempt_cancel = StreamCancelHandle::new();
                let _abort = CancelOnDrop(attempt_cancel.clone());
                let mut upstream = lease
                    .client()
                    .send_raw_message_stream(&model, translated, attempt_cancel.clone())
                    .await;
                state.begin_attempt();
                let mut errors_open = true;

                let failure = loop {
                    let event = tokio::select! {
                        biased;
                        _ = caller_cancel.cancelled() => BridgeEvent::Disconnected,
                        chunk = upstream.chunks.recv() => match chunk {
                            Some(chunk) => BridgeEvent::Chunk(chunk),
                            None => BridgeEvent::ChunksClosed,
                        },
                        err = upstream.errors.recv(), if errors_open => match err {
                            Some(err) => BridgeEvent::Error(err),
                            None => BridgeEvent::ErrorsClosed,
                        },
                        _ = keep_alive.tick(), if delivered => BridgeEvent::KeepAlive,
                    };

                    match event {
                        BridgeEvent::Disconnected => {
                            attempt_cancel.cancel();
                            tracing::info!(client = %lease.id(), %model, "Caller disconnected, cancelling backend stream");
                            record_request(client, Some(backend), 499);
                            break 'attempts;
                        }
                        BridgeEvent::Chunk(chunk) => {
                            match translators.response_stream(client, backend, &ctx, &chunk, &mut state) {
                                Ok(frames) => {
                                    for frame in frames {
                                        if !delivered {
                                            delivered = true;
                                            keep_alive.reset();
                                        }
                                        yield Ok(Bytes::from(frame.render(framing)));
                                    }
                                }
                                Err(e) => break e,
                            }
                        }
                        BridgeEvent::Error(err) => break AppError::from(err),
                        BridgeEvent::ErrorsClosed => errors_open = false,
                        BridgeEvent::KeepAlive => {
                            yield Ok(Bytes::from(keep_alive_frame(client)));
                        }
                        BridgeEvent::ChunksClosed => {
                            if errors_open {
                                if let Some(err) = upstream.errors.recv().await {
                                    break AppError::from(err);
                                }
                            }
                            match translators.finish_stream(client, backend, &ctx, &mut state) {
                                Ok(frames) => {
                                    for frame in frames {
                                        yield Ok(Bytes::from(frame.render(framing)));
                                    }
                                }
                                Err(e) => break e,
                            }
                            if let Some(done) = done_frame(client) {
                                yield Ok(Bytes::from(done));
                            }
                            attempt_cancel.mark_completed();
                            caller_cancel.mark_completed();
                            record_request(client, Some(backend), 200);
                            tracing::debug!(client = %lease.id(), %model, "Stream completed");
                            break 'attempts;
                        }
                    }
                };

                attempt_cancel.cancel();
                if failure.is_quota_exceeded() {
                    pool.mark_quota_exceeded(lease.id(), &model);
                    if failover {
                        tracing::info!(client = %lease.id(), %model, "Quota exceeded mid-stream, failing over");
                        get_metrics().failovers.with_label_values(&[model.as_str()]).inc();
                        lease.release();
                        continue 'attempts;
                    }
                }

                tracing::warn!(client = %lease.id(), %model, error = %failure, "Stream failed");
                record_request(client, Some(backend), failure.status_code().as_u16());
                caller_cancel.mark_completed();
                yield Ok(Bytes::from(error_frame(client, &failure.protocol_body(client))));
                break 'attempts;
            }
        })
    }
}
