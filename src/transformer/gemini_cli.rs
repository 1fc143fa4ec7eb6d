//! Gemini CLI (`v1internal`) envelope transformer.
//!
//! Requests are wrapped as `{model, project, request}` and responses as
//! `{response}`; the payload inside is plain Gemini. The project id is filled
//! in by the backend client, which owns the credential.

use super::gemini::GeminiTransformer;
use super::stream::{DecoderState, EncoderState, SseFrame, StreamDelta};
use super::{Protocol, Result, Transformer, UnifiedRequest, UnifiedResponse, UnifiedStreamChunk};
use crate::core::AppError;
use serde_json::{json, Value};

/// Strip the `{response}` envelope, accepting already-bare payloads.
pub fn unwrap_response(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("response") => {
            map.remove("response").unwrap_or(Value::Null)
        }
        other => other,
    }
}

pub fn wrap_response(value: Value) -> Value {
    json!({"response": value})
}

/// Wrap a Gemini request body in the CLI envelope.
pub fn wrap_request(model: &str, request: Value) -> Value {
    json!({"model": model, "project": "", "request": request})
}

/// Split the CLI envelope into its model and inner Gemini request.
pub fn unwrap_request(mut envelope: Value) -> Result<(String, Value)> {
    let model = envelope
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    let request = envelope
        .get_mut("request")
        .map(Value::take)
        .ok_or_else(|| AppError::BadRequest("Missing 'request' field".into()))?;
    Ok((model, request))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiCliTransformer {
    inner: GeminiTransformer,
}

impl GeminiCliTransformer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transformer for GeminiCliTransformer {
    fn protocol(&self) -> Protocol {
        Protocol::GeminiCli
    }

    fn transform_request_out(&self, raw: Value) -> Result<UnifiedRequest> {
        let (model, request) = unwrap_request(raw)?;
        let mut unified = self.inner.transform_request_out(request)?;
        if !model.is_empty() {
            unified.model = model;
        }
        Ok(unified)
    }

    fn transform_request_in(&self, unified: &UnifiedRequest) -> Result<Value> {
        let request = self.inner.transform_request_in(unified)?;
        Ok(wrap_request(&unified.model, request))
    }

    fn transform_response_in(&self, raw: Value, original_model: &str) -> Result<UnifiedResponse> {
        self.inner
            .transform_response_in(unwrap_response(raw), original_model)
    }

    fn transform_response_out(&self, unified: &UnifiedResponse) -> Result<Value> {
        Ok(wrap_response(self.inner.transform_response_out(unified)?))
    }

    fn transform_stream_chunk_in(
        &self,
        chunk: &[u8],
        state: &mut DecoderState,
    ) -> Result<Vec<StreamDelta>> {
        let value: Value = serde_json::from_slice(chunk)
            .map_err(|e| AppError::BadRequest(format!("Invalid JSON: {}", e)))?;
        GeminiTransformer::decode_stream_value(&unwrap_response(value), state)
    }

    fn transform_stream_chunk_out(
        &self,
        chunk: &UnifiedStreamChunk,
        state: &mut EncoderState,
    ) -> Result<Vec<SseFrame>> {
        Ok(GeminiTransformer::encode_stream_value(chunk, state)
            .map(|value| vec![SseFrame::data(wrap_response(value).to_string())])
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::{UnifiedMessage, UnifiedStreamChunk};
    use serde_json::json;

    #[test]
    fn test_request_envelope() {
        let transformer = GeminiCliTransformer::new();
        let unified = transformer
            .transform_request_out(json!({
                "model": "gemini-2.5-pro",
                "project": "my-project",
                "request": {"contents": [{"role": "user", "parts": [{"text": "hi"}]}]}
            }))
            .unwrap();
        assert_eq!(unified.model, "gemini-2.5-pro");
        assert_eq!(unified.messages, vec![UnifiedMessage::user("hi")]);

        let body = transformer.transform_request_in(&unified).unwrap();
        assert_eq!(body["model"], json!("gemini-2.5-pro"));
        assert_eq!(body["request"]["contents"][0]["parts"][0]["text"], json!("hi"));
    }

    #[test]
    fn test_missing_request_rejected() {
        let err = GeminiCliTransformer::new()
            .transform_request_out(json!({"model": "m"}))
            .unwrap_err();
        assert_eq!(err.status_code().as_u16(), 400);
    }

    #[test]
    fn test_stream_chunk_unwrapped_and_rewrapped() {
        let transformer = GeminiCliTransformer::new();
        let mut decoder = DecoderState::default();
        let deltas = transformer
            .transform_stream_chunk_in(
                br#"{"response":{"candidates":[{"content":{"parts":[{"text":"hey"}]}}]}}"#,
                &mut decoder,
            )
            .unwrap();
        assert_eq!(deltas[1], StreamDelta::Text("hey".into()));

        let mut encoder = EncoderState::default();
        let frames = transformer
            .transform_stream_chunk_out(
                &UnifiedStreamChunk::content_block_delta(
                    0,
                    crate::transformer::BlockDelta::Text("hey".into()),
                ),
                &mut encoder,
            )
            .unwrap();
        let value: Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(
            value["response"]["candidates"][0]["content"]["parts"][0]["text"],
            json!("hey")
        );
    }
}
