//! Core functionality for the relay.
//!
//! - Configuration management
//! - Error handling
//! - Logging context
//! - Metrics collection
//! - Stream cancellation

pub mod cancel;
pub mod config;
pub mod error;
pub mod error_types;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use cancel::StreamCancelHandle;
pub use config::{AppConfig, CredentialConfig, ModelConfig, QuotaExceededConfig, ServerConfig};
pub use error::{AppError, Result};
pub use logging::{generate_request_id, get_credential_context, get_request_id, REQUEST_ID};
pub use metrics::{get_metrics, init_metrics, Metrics};
