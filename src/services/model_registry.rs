//! Process-wide registry of the models the client pool can serve.
//!
//! Each credential registers the models it provides; a model is listed while
//! at least one registered credential is not quota-exceeded for it. Quota marks
//! expire after a fixed TTL and are swept by a periodic cleanup task.

use crate::core::config::ModelConfig;
use crate::transformer::Protocol;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long a credential stays quota-exceeded for a model.
pub const QUOTA_TTL: Duration = Duration::from_secs(300);

/// Metadata for one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub owned_by: String,
    /// Unix timestamp, seconds
    pub created: i64,
    pub input_token_limit: Option<u64>,
    pub output_token_limit: Option<u64>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, owned_by: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            owned_by: owned_by.into(),
            created: Utc::now().timestamp(),
            input_token_limit: None,
            output_token_limit: None,
        }
    }

    pub fn from_config(config: &ModelConfig, owned_by: &str) -> Self {
        let mut info = Self::new(&config.id, owned_by);
        if let Some(display_name) = &config.display_name {
            info.display_name = display_name.clone();
        }
        info.input_token_limit = config.input_token_limit;
        info.output_token_limit = config.output_token_limit;
        info
    }
}

#[derive(Debug)]
struct ModelRegistration {
    info: ModelInfo,
    /// Registered credentials providing the model
    count: usize,
    last_updated: Instant,
    /// Credential id -> when it was flagged
    quota_exceeded: HashMap<String, Instant>,
}

impl ModelRegistration {
    fn active_quota_count(&self, ttl: Duration) -> usize {
        self.quota_exceeded
            .values()
            .filter(|flagged| flagged.elapsed() < ttl)
            .count()
    }
}

/// Model reference counts and per-credential quota marks.
pub struct ModelRegistry {
    models: DashMap<String, ModelRegistration>,
    /// Credential id -> models it registered
    clients: DashMap<String, Vec<String>>,
    ttl: Duration,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::with_ttl(QUOTA_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            models: DashMap::new(),
            clients: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register the models a credential provides, replacing any earlier registration.
    pub fn register_client(&self, client_id: &str, models: &[ModelInfo]) {
        self.unregister_client(client_id);
        let now = Instant::now();
        for model in models {
            self.models
                .entry(model.id.clone())
                .and_modify(|reg| {
                    reg.count += 1;
                    reg.last_updated = now;
                })
                .or_insert_with(|| ModelRegistration {
                    info: model.clone(),
                    count: 1,
                    last_updated: now,
                    quota_exceeded: HashMap::new(),
                });
        }
        self.clients.insert(
            client_id.to_string(),
            models.iter().map(|m| m.id.clone()).collect(),
        );
        tracing::debug!(client = %client_id, models = models.len(), "Registered client models");
    }

    pub fn unregister_client(&self, client_id: &str) {
        let Some((_, models)) = self.clients.remove(client_id) else {
            return;
        };
        for model in models {
            let now_empty = match self.models.get_mut(&model) {
                Some(mut reg) => {
                    reg.count = reg.count.saturating_sub(1);
                    reg.quota_exceeded.remove(client_id);
                    reg.last_updated = Instant::now();
                    reg.count == 0
                }
                None => false,
            };
            if now_empty {
                self.models.remove_if(&model, |_, reg| reg.count == 0);
            }
        }
    }

    pub fn set_model_quota_exceeded(&self, client_id: &str, model: &str) {
        if let Some(mut reg) = self.models.get_mut(model) {
            reg.quota_exceeded.insert(client_id.to_string(), Instant::now());
            reg.last_updated = Instant::now();
            tracing::info!(client = %client_id, %model, "Marked model quota exceeded");
        }
    }

    pub fn clear_model_quota_exceeded(&self, client_id: &str, model: &str) {
        if let Some(mut reg) = self.models.get_mut(model) {
            if reg.quota_exceeded.remove(client_id).is_some() {
                tracing::debug!(client = %client_id, %model, "Cleared model quota mark");
            }
        }
    }

    pub fn is_model_quota_exceeded(&self, client_id: &str, model: &str) -> bool {
        self.models
            .get(model)
            .and_then(|reg| reg.quota_exceeded.get(client_id).copied())
            .is_some_and(|flagged| flagged.elapsed() < self.ttl)
    }

    /// Registered credentials minus those currently quota-exceeded.
    pub fn available_count(&self, model: &str) -> usize {
        self.models
            .get(model)
            .map(|reg| reg.count.saturating_sub(reg.active_quota_count(self.ttl)))
            .unwrap_or(0)
    }

    /// Models with positive availability, sorted by id.
    pub fn available(&self) -> Vec<ModelInfo> {
        let mut models: Vec<ModelInfo> = self
            .models
            .iter()
            .filter(|reg| reg.count > reg.active_quota_count(self.ttl))
            .map(|reg| reg.info.clone())
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Available models rendered in the listing shape of `protocol`.
    pub fn available_models(&self, protocol: Protocol) -> Value {
        let models = self.available();
        match protocol {
            Protocol::Claude => {
                let data: Vec<Value> = models
                    .iter()
                    .map(|m| {
                        let created_at = DateTime::<Utc>::from_timestamp(m.created, 0)
                            .unwrap_or_default()
                            .to_rfc3339();
                        json!({
                            "type": "model",
                            "id": m.id,
                            "display_name": m.display_name,
                            "created_at": created_at,
                        })
                    })
                    .collect();
                json!({
                    "data": data,
                    "has_more": false,
                    "first_id": models.first().map(|m| m.id.as_str()),
                    "last_id": models.last().map(|m| m.id.as_str()),
                })
            }
            Protocol::Gemini | Protocol::GeminiCli => {
                let data: Vec<Value> = models
                    .iter()
                    .map(|m| {
                        json!({
                            "name": format!("models/{}", m.id),
                            "version": "001",
                            "displayName": m.display_name,
                            "description": m.display_name,
                            "inputTokenLimit": m.input_token_limit,
                            "outputTokenLimit": m.output_token_limit,
                            "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
                        })
                    })
                    .collect();
                json!({ "models": data })
            }
            Protocol::OpenAI | Protocol::OpenAIResponses | Protocol::Codex => {
                let data: Vec<Value> = models
                    .iter()
                    .map(|m| {
                        json!({
                            "id": m.id,
                            "object": "model",
                            "created": m.created,
                            "owned_by": m.owned_by,
                        })
                    })
                    .collect();
                json!({ "object": "list", "data": data })
            }
        }
    }

    /// Remove quota marks older than the TTL. Returns how many were removed.
    pub fn cleanup_expired_quotas(&self) -> usize {
        let mut removed = 0;
        for mut reg in self.models.iter_mut() {
            let before = reg.quota_exceeded.len();
            reg.quota_exceeded
                .retain(|_, flagged| flagged.elapsed() < self.ttl);
            removed += before - reg.quota_exceeded.len();
        }
        if removed > 0 {
            tracing::debug!(removed, "Swept expired quota marks");
        }
        removed
    }

    /// Run [`cleanup_expired_quotas`](Self::cleanup_expired_quotas) every `interval`
    /// until `shutdown` turns true.
    pub fn spawn_cleanup_task(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.cleanup_expired_quotas();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!("Quota cleanup task stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn models(ids: &[&str]) -> Vec<ModelInfo> {
        ids.iter().map(|id| ModelInfo::new(*id, "test")).collect()
    }

    #[test]
    fn test_refcount_and_unregister() {
        let registry = ModelRegistry::new();
        registry.register_client("a", &models(&["m1", "m2"]));
        registry.register_client("b", &models(&["m1"]));
        assert_eq!(registry.available_count("m1"), 2);

        registry.unregister_client("a");
        assert_eq!(registry.available_count("m1"), 1);
        assert_eq!(registry.available_count("m2"), 0);
        assert_eq!(registry.available().len(), 1);
    }

    #[test]
    fn test_reregister_does_not_double_count() {
        let registry = ModelRegistry::new();
        registry.register_client("a", &models(&["m1"]));
        registry.register_client("a", &models(&["m1"]));
        assert_eq!(registry.available_count("m1"), 1);
    }

    #[tokio::test]
    async fn test_quota_hides_model_until_cleared() {
        let registry = ModelRegistry::new();
        registry.register_client("a", &models(&["m1"]));
        registry.set_model_quota_exceeded("a", "m1");
        assert!(registry.is_model_quota_exceeded("a", "m1"));
        assert!(registry.available().is_empty());

        registry.clear_model_quota_exceeded("a", "m1");
        assert!(!registry.is_model_quota_exceeded("a", "m1"));
        assert_eq!(registry.available().len(), 1);
    }

    #[test]
    fn test_listing_shapes() {
        let registry = ModelRegistry::new();
        registry.register_client("a", &models(&["gemini-2.5-pro", "claude-sonnet-4"]));

        let openai = registry.available_models(Protocol::OpenAI);
        assert_eq!(openai["object"], "list");
        assert_eq!(openai["data"][0]["id"], "claude-sonnet-4");

        let claude = registry.available_models(Protocol::Claude);
        assert_eq!(claude["has_more"], false);
        assert_eq!(claude["first_id"], "claude-sonnet-4");
        assert_eq!(claude["last_id"], "gemini-2.5-pro");
        assert_eq!(claude["data"][0]["type"], "model");

        let gemini = registry.available_models(Protocol::Gemini);
        assert_eq!(gemini["models"][1]["name"], "models/gemini-2.5-pro");
    }
}
