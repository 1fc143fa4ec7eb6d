//! Caller authentication.
//!
//! Accepts the key in any of the places the supported protocols put it:
//! `x-api-key` (Claude), `x-goog-api-key` or `?key=` (Gemini) and
//! `Authorization: Bearer` (OpenAI and everyone else).

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::core::error::Result;
use crate::core::AppError;

/// Hash an API key using SHA-256.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extract Bearer token from Authorization header.
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

/// The caller's key, in priority order `x-api-key`, `x-goog-api-key`, bearer, query.
fn extract_api_key<'a>(headers: &'a HeaderMap, query_key: Option<&'a str>) -> Option<&'a str> {
    ["x-api-key", "x-goog-api-key"]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
        .or_else(|| extract_bearer(headers))
        .or(query_key)
}

/// Hashes of the keys callers may use. Empty means authentication is off.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    hashes: HashSet<String>,
}

impl KeyStore {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hashes: keys.into_iter().map(|k| hash_key(k.as_ref())).collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.hashes.is_empty()
    }

    pub fn verify(&self, headers: &HeaderMap, query_key: Option<&str>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let provided = extract_api_key(headers, query_key).ok_or(AppError::Unauthorized)?;
        if self.hashes.contains(&hash_key(provided)) {
            Ok(())
        } else {
            tracing::debug!("Rejected request with unknown API key");
            Err(AppError::Unauthorized)
        }
    }
}
