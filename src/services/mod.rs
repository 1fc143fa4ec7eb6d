//! Backend-facing services for the relay.
//!
//! - Backend client capability surface and its HTTP implementation
//! - Model registry with per-credential quota marks
//! - Client pool selection, admission control and failover

pub mod backend;
pub mod client_pool;
pub mod http_backend;
pub mod model_registry;

// Re-export commonly used types
pub use backend::{BackendClient, BackendError, BackendStream, BackendStreamSender, ClientIdentity};
pub use client_pool::{ClientLease, ClientPool};
pub use http_backend::HttpBackendClient;
pub use model_registry::{ModelInfo, ModelRegistry, QUOTA_TTL};
