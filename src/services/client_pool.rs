//! Client pool selection and admission control.
//!
//! Selection is round-robin over the pool, skipping credentials that cannot
//! serve the model or are quota-exceeded for it. Every credential has an
//! exclusive lock held for the whole attempt, so at most one request is in
//! flight per credential.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::backend::BackendClient;
use super::model_registry::ModelRegistry;
use crate::core::error_types::AttemptOutcome;
use crate::core::{get_metrics, AppError, Result};

struct PoolEntry {
    client: Arc<dyn BackendClient>,
    lock: Arc<AsyncMutex<()>>,
}

/// A selected credential with its request lock held.
///
/// The lock is released exactly once, when the lease is dropped or
/// [`release`](ClientLease::release)d.
pub struct ClientLease {
    client: Arc<dyn BackendClient>,
    _guard: OwnedMutexGuard<()>,
}

impl ClientLease {
    pub fn client(&self) -> &Arc<dyn BackendClient> {
        &self.client
    }

    pub fn id(&self) -> &str {
        self.client.id()
    }

    pub fn release(self) {}
}

impl std::fmt::Debug for ClientLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLease").field("client", &self.id()).finish()
    }
}

/// Credentials plus the round-robin cursor over them.
pub struct ClientPool {
    entries: Vec<PoolEntry>,
    registry: Arc<ModelRegistry>,
    /// Index chosen by the previous selection pass
    cursor: Mutex<Option<usize>>,
}

impl ClientPool {
    /// Build a pool and register every client's models.
    pub fn new(clients: Vec<Arc<dyn BackendClient>>, registry: Arc<ModelRegistry>) -> Self {
        let entries = clients
            .into_iter()
            .map(|client| {
                registry.register_client(client.id(), &client.models());
                tracing::info!(
                    client = %client.id(),
                    protocol = %client.protocol(),
                    identity = %client.identity(),
                    "Added client to pool"
                );
                PoolEntry {
                    client,
                    lock: Arc::new(AsyncMutex::new(())),
                }
            })
            .collect();
        Self {
            entries,
            registry,
            cursor: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn clients(&self) -> impl Iterator<Item = &Arc<dyn BackendClient>> {
        self.entries.iter().map(|e| &e.client)
    }

    /// Whether the credential's request lock is currently held.
    pub fn is_client_locked(&self, client_id: &str) -> bool {
        self.entries
            .iter()
            .find(|e| e.client.id() == client_id)
            .is_some_and(|e| e.lock.try_lock().is_err())
    }

    /// Current cursor position, `None` before the first selection.
    pub fn cursor(&self) -> Option<usize> {
        *self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance the cursor by one and return the new start index.
    fn advance_cursor(&self) -> usize {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let start = match *cursor {
            Some(last) => (last + 1) % self.entries.len(),
            None => 0,
        };
        *cursor = Some(start);
        start
    }

    /// Pick and lock a credential for `model`.
    ///
    /// Fails with 400 when no credential serves the model and 429
    /// `RESOURCE_EXHAUSTED` when all of them are quota-exceeded.
    pub async fn select_client(&self, model: &str) -> Result<ClientLease> {
        self.select_client_excluding(model, &HashSet::new()).await
    }

    /// [`select_client`](Self::select_client) without the credentials in `tried`.
    ///
    /// A request that has already attempted every candidate gets the same 429
    /// `RESOURCE_EXHAUSTED` as a fully quota-exceeded pool.
    pub async fn select_client_excluding(
        &self,
        model: &str,
        tried: &HashSet<String>,
    ) -> Result<ClientLease> {
        if !self.entries.iter().any(|e| e.client.can_provide_model(model)) {
            return Err(AppError::UnknownModel(model.to_string()));
        }

        let start = self.advance_cursor();
        let len = self.entries.len();
        let candidates: Vec<&PoolEntry> = (0..len)
            .map(|offset| &self.entries[(start + offset) % len])
            .filter(|e| e.client.can_provide_model(model))
            .filter(|e| !tried.contains(e.client.id()))
            .filter(|e| !self.registry.is_model_quota_exceeded(e.client.id(), model))
            .collect();

        let Some(first) = candidates.first() else {
            tracing::warn!(%model, "All credentials quota exceeded");
            return Err(AppError::NoCandidate {
                model: model.to_string(),
            });
        };

        for entry in &candidates {
            if let Ok(guard) = entry.lock.clone().try_lock_owned() {
                tracing::debug!(client = %entry.client.id(), %model, "Selected client");
                return Ok(ClientLease {
                    client: entry.client.clone(),
                    _guard: guard,
                });
            }
        }

        tracing::debug!(client = %first.client.id(), %model, "All candidates busy, waiting");
        let guard = first.lock.clone().lock_owned().await;
        Ok(ClientLease {
            client: first.client.clone(),
            _guard: guard,
        })
    }

    /// Flag a credential as quota-exceeded for `model`.
    pub fn mark_quota_exceeded(&self, client_id: &str, model: &str) {
        self.registry.set_model_quota_exceeded(client_id, model);
        get_metrics()
            .quota_flags
            .with_label_values(&[client_id, model])
            .inc();
    }

    /// Run `attempt` with a selected credential, failing over on quota errors.
    ///
    /// A 429 flags the credential and, when `failover` is set, releases it and
    /// selects again among the credentials not yet tried for this call. Any
    /// other outcome is returned as is.
    pub async fn execute<T, F, Fut>(&self, model: &str, failover: bool, mut attempt: F) -> Result<T>
    where
        F: FnMut(ClientLease) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut tried = HashSet::new();
        loop {
            let lease = self.select_client_excluding(model, &tried).await?;
            let client_id = lease.id().to_string();
            let result = attempt(lease).await;

            let outcome = match &result {
                Ok(_) => AttemptOutcome::Succeeded,
                Err(e) if e.is_quota_exceeded() => AttemptOutcome::QuotaExceeded,
                Err(_) => AttemptOutcome::Failed,
            };
            tracing::debug!(client = %client_id, %model, %outcome, "Attempt finished");

            if outcome != AttemptOutcome::QuotaExceeded {
                return result;
            }
            self.mark_quota_exceeded(&client_id, model);
            if !failover {
                return result;
            }
            get_metrics().failovers.with_label_values(&[model]).inc();
            tracing::info!(client = %client_id, %model, "Quota exceeded, failing over");
            tried.insert(client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StreamCancelHandle;
    use crate::services::backend::{BackendError, BackendStream, ClientIdentity};
    use crate::services::model_registry::ModelInfo;
    use crate::transformer::Protocol;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::Value;
    use std::time::Duration;

    struct StubClient {
        id: String,
        models: Vec<String>,
    }

    #[async_trait]
    impl BackendClient for StubClient {
        fn id(&self) -> &str {
            &self.id
        }
        fn protocol(&self) -> Protocol {
            Protocol::OpenAI
        }
        fn identity(&self) -> ClientIdentity {
            ClientIdentity::default()
        }
        fn models(&self) -> Vec<ModelInfo> {
            self.models.iter().map(|m| ModelInfo::new(m, "test")).collect()
        }
        async fn send_raw_message(&self, _model: &str, _body: Value) -> std::result::Result<Bytes, BackendError> {
            Ok(Bytes::from_static(b"{}"))
        }
        async fn send_raw_message_stream(
            &self,
            _model: &str,
            _body: Value,
            _cancel: StreamCancelHandle,
        ) -> BackendStream {
            BackendStream::channel().1
        }
    }

    fn pool(ids: &[&str], models: &[&str]) -> ClientPool {
        let clients: Vec<Arc<dyn BackendClient>> = ids
            .iter()
            .map(|id| {
                Arc::new(StubClient {
                    id: id.to_string(),
                    models: models.iter().map(|m| m.to_string()).collect(),
                }) as Arc<dyn BackendClient>
            })
            .collect();
        ClientPool::new(clients, Arc::new(ModelRegistry::new()))
    }

    #[tokio::test]
    async fn test_first_pass_starts_at_zero() {
        let pool = pool(&["a", "b"], &["m"]);
        assert_eq!(pool.cursor(), None);
        let lease = pool.select_client("m").await.unwrap();
        assert_eq!(lease.id(), "a");
        assert_eq!(pool.cursor(), Some(0));
    }

    #[tokio::test]
    async fn test_unknown_model_is_400() {
        let pool = pool(&["a"], &["m"]);
        let err = pool.select_client("other").await.unwrap_err();
        assert_eq!(err.status_code().as_u16(), 400);
    }

    #[tokio::test]
    async fn test_busy_candidate_is_skipped() {
        let pool = pool(&["a", "b"], &["m"]);
        let first = pool.select_client("m").await.unwrap();
        let second = pool.select_client("m").await.unwrap();
        assert_eq!(first.id(), "a");
        assert_eq!(second.id(), "b");
        second.release();
        assert!(!pool.is_client_locked("b"));

        // Cursor starts this pass at "a", which is still held
        let third = pool.select_client("m").await.unwrap();
        assert_eq!(third.id(), "b");
        assert_eq!(pool.cursor(), Some(0));
        drop(first);
        assert!(!pool.is_client_locked("a"));
        drop(third);
        assert!(!pool.is_client_locked("b"));
    }

    #[tokio::test]
    async fn test_execute_fails_over_on_429() {
        let pool = pool(&["a", "b"], &["m"]);
        let mut seen = Vec::new();
        let result = pool
            .execute("m", true, |lease| {
                seen.push(lease.id().to_string());
                let id = lease.id().to_string();
                async move {
                    if id == "a" {
                        Err(BackendError::new(axum::http::StatusCode::TOO_MANY_REQUESTS, "").into())
                    } else {
                        Ok(id)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "b");
        assert_eq!(seen, vec!["a", "b"]);
        assert!(pool.registry().is_model_quota_exceeded("a", "m"));
        assert!(!pool.is_client_locked("a"));
        assert!(!pool.is_client_locked("b"));
    }

    #[tokio::test]
    async fn test_execute_tries_each_credential_once_when_flags_expire() {
        let clients: Vec<Arc<dyn BackendClient>> = ["a", "b"]
            .iter()
            .map(|id| {
                Arc::new(StubClient {
                    id: id.to_string(),
                    models: vec!["m".to_string()],
                }) as Arc<dyn BackendClient>
            })
            .collect();
        let pool = ClientPool::new(clients, Arc::new(ModelRegistry::with_ttl(Duration::ZERO)));

        let mut seen = Vec::new();
        let err = pool
            .execute("m", true, |lease| {
                seen.push(lease.id().to_string());
                async {
                    Err::<(), _>(BackendError::new(axum::http::StatusCode::TOO_MANY_REQUESTS, "").into())
                }
            })
            .await
            .unwrap_err();

        assert_matches!(err, AppError::NoCandidate { .. });
        assert_eq!(seen, vec!["a", "b"]);
        assert!(!pool.registry().is_model_quota_exceeded("a", "m"));
    }

    #[tokio::test]
    async fn test_excluded_credentials_are_skipped() {
        let pool = pool(&["a", "b"], &["m"]);
        let tried: HashSet<String> = ["a".to_string()].into();
        let lease = pool.select_client_excluding("m", &tried).await.unwrap();
        assert_eq!(lease.id(), "b");
        drop(lease);

        let tried: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        let err = pool.select_client_excluding("m", &tried).await.unwrap_err();
        assert_eq!(err.status_code().as_u16(), 429);
    }

    #[tokio::test]
    async fn test_execute_without_failover_surfaces_429() {
        let pool = pool(&["a", "b"], &["m"]);
        let err = pool
            .execute("m", false, |_lease| async {
                Err::<(), _>(BackendError::new(axum::http::StatusCode::TOO_MANY_REQUESTS, "").into())
            })
            .await
            .unwrap_err();
        assert!(err.is_quota_exceeded());
        assert!(pool.registry().is_model_quota_exceeded("a", "m"));
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let pool = pool(&["a", "b"], &["m"]);
        let mut attempts = 0;
        let err = pool
            .execute("m", true, |_lease| {
                attempts += 1;
                async { Err::<(), _>(AppError::BadRequest("bad".into())) }
            })
            .await
            .unwrap_err();
        assert_eq!(attempts, 1);
        assert_eq!(err.status_code().as_u16(), 400);
    }
}
