//! Bearer-token authentication with a short-TTL verification cache, plus
//! the scheduler shared-secret check for cron-invoked routes.

use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use dashmap::DashMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use sibyl_core::config::AuthConfig;
use sibyl_core::SibylError;

/// Resolves bearer tokens to profile ids against the configured auth
/// provider. Verified tokens are cached by hash for the configured TTL.
///
/// With no `auth.url` configured (development), the bearer token is taken
/// as the profile id directly.
pub struct AuthCache {
    config: AuthConfig,
    client: reqwest::Client,
    cache: DashMap<String, (String, Instant)>,
    ttl: Duration,
}

impl AuthCache {
    pub fn new(config: AuthConfig) -> Self {
        let ttl = Duration::from_secs(config.cache_ttl_secs);
        Self {
            config,
            client: reqwest::Client::new(),
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Resolve the Authorization header to a profile id.
    pub async fn verify(&self, headers: &HeaderMap) -> Result<String, SibylError> {
        let token = extract_bearer(headers)
            .ok_or_else(|| SibylError::AuthFailed("missing bearer token".into()))?;

        if self.config.url.is_empty() {
            // Dev mode: the token is the profile id.
            return Ok(token.to_string());
        }

        let key = token_hash(token);
        if let Some(entry) = self.cache.get(&key) {
            let (user_id, at) = entry.value();
            if at.elapsed() < self.ttl {
                return Ok(user_id.clone());
            }
        }

        let url = format!("{}/auth/v1/user", self.config.url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .header("apikey", &self.config.anon_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SibylError::UpstreamUnavailable {
                service: "auth".into(),
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(SibylError::AuthFailed(format!(
                "auth provider returned {}",
                resp.status()
            )));
        }
        let user: AuthUser = resp.json().await.map_err(|e| SibylError::UpstreamUnavailable {
            service: "auth".into(),
            reason: e.to_string(),
        })?;

        debug!(user_id = %user.id, "token verified");
        self.cache.insert(key, (user.id.clone(), Instant::now()));
        Ok(user.id)
    }

    /// Check the X-Scheduler-Key header against the shared secret. Routes
    /// guarded by this bypass user-space limits but honor the kill switch.
    pub fn verify_scheduler_key(&self, headers: &HeaderMap) -> Result<(), SibylError> {
        if self.config.scheduler_secret.is_empty() {
            return Err(SibylError::AuthFailed("scheduler key not configured".into()));
        }
        let provided = headers
            .get("x-scheduler-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if provided.as_bytes() == self.config.scheduler_secret.as_bytes() {
            Ok(())
        } else {
            Err(SibylError::AuthFailed("bad scheduler key".into()))
        }
    }

    /// Drop every cached verification. Called at shutdown.
    pub fn clear(&self) {
        self.cache.clear();
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn token_hash(token: &str) -> String {
    let mut h = Sha256::new();
    h.update(token.as_bytes());
    hex::encode(h.finalize())
}

#[derive(Deserialize)]
struct AuthUser {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn dev_mode_uses_token_as_profile_id() {
        let auth = AuthCache::new(AuthConfig::default());
        let user = auth.verify(&headers_with("profile-123")).await.unwrap();
        assert_eq!(user, "profile-123");
    }

    #[tokio::test]
    async fn missing_header_fails() {
        let auth = AuthCache::new(AuthConfig::default());
        assert!(auth.verify(&HeaderMap::new()).await.is_err());
    }

    #[test]
    fn scheduler_key_must_match() {
        let mut config = AuthConfig::default();
        config.scheduler_secret = "top-secret".into();
        let auth = AuthCache::new(config);

        let mut headers = HeaderMap::new();
        headers.insert("x-scheduler-key", HeaderValue::from_static("top-secret"));
        assert!(auth.verify_scheduler_key(&headers).is_ok());

        headers.insert("x-scheduler-key", HeaderValue::from_static("wrong"));
        assert!(auth.verify_scheduler_key(&headers).is_err());
    }

    #[test]
    fn unconfigured_scheduler_key_rejects_everything() {
        let auth = AuthCache::new(AuthConfig::default());
        let mut headers = HeaderMap::new();
        headers.insert("x-scheduler-key", HeaderValue::from_static(""));
        assert!(auth.verify_scheduler_key(&headers).is_err());
    }
}
