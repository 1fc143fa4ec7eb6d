//! LLM Relay Server - a protocol-translating gateway for LLM APIs
//!
//! Callers speak whichever API they already use (OpenAI Chat Completions,
//! OpenAI Responses, Claude Messages, Gemini or Gemini CLI) and the relay
//! forwards the request to any configured backend credential, translating
//! requests, responses and SSE streams on the way.
//!
//! - **Protocol translation**: every pair of protocols goes through a unified
//!   intermediate format, or straight through when both sides match
//! - **Credential pool**: round-robin selection with per-credential admission
//! - **Quota failover**: a 429 marks the credential for the model and the
//!   request moves on, even in the middle of a stream
//! - **Metrics & Monitoring**: Prometheus metrics for observability
//!
//! # Architecture
//!
//! - [`core`]: config, errors, logging context, metrics, cancellation
//! - [`transformer`]: protocol codecs, stream state machine, translator registry
//! - [`services`]: backend clients, model registry, client pool
//! - [`api`]: HTTP handlers and the streaming bridge
//!
//! # Configuration
//!
//! Loaded from the YAML file named by `CONFIG_PATH` (default `config.yaml`).
//! `HOST`, `PORT` and `REQUEST_TIMEOUT_SECS` override the file.

pub mod api;
pub mod core;
pub mod services;
pub mod transformer;

// Re-export commonly used types for convenience
pub use api::{router, AppState, Relay, RelayRequest};
pub use core::{AppConfig, AppError, Result};
pub use services::{BackendClient, ClientPool, ModelRegistry};
pub use transformer::{Protocol, TranslatorRegistry};
