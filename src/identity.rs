//! Identity & Token Cache (spec §4.2) and process-local worker identity
//! (spec §3 "Worker identity").
//!
//! The cached installation token and the worker id are process-wide,
//! single-writer state reached through the one scheduler value that owns
//! them (spec §9 "Global mutable state") — no locks, no ambient globals.

use crate::config::{Config, PrivateKeySource};
use crate::error::IdentityError;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct AppAssertionClaims {
    iat: i64,
    exp: i64,
    iss: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: chrono::DateTime<Utc>,
}

struct CachedToken {
    token: String,
    /// Expiry already backed off by 60s from the server-reported value
    /// (spec §4.2).
    expires_at: chrono::DateTime<Utc>,
}

/// Derives and caches short-lived installation tokens from a long-lived
/// app id + installation id + RSA private key.
const DEFAULT_API_BASE: &str = "https://api.github.com";

pub struct TokenCache {
    app_id: u64,
    installation_id: u64,
    private_key_pem: Vec<u8>,
    http: reqwest::Client,
    cached: Option<CachedToken>,
    api_base: String,
}

impl TokenCache {
    pub fn new(config: &Config, http: reqwest::Client) -> Result<Self, IdentityError> {
        Self::with_base_url(config, http, DEFAULT_API_BASE.to_string())
    }

    /// Exposed so tests (and GitHub Enterprise deployments) can point the
    /// token exchange at something other than the public API host.
    pub fn with_base_url(
        config: &Config,
        http: reqwest::Client,
        api_base: String,
    ) -> Result<Self, IdentityError> {
        let private_key_pem = match &config.private_key {
            PrivateKeySource::Inline(b64) => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD.decode(b64)?
            }
            PrivateKeySource::Path(path) => std::fs::read(path).map_err(|e| {
                IdentityError::Request(format!("failed to read private key {path}: {e}"))
            })?,
        };

        Ok(Self {
            app_id: config.app_id,
            installation_id: config.app_installation_id,
            private_key_pem,
            http,
            cached: None,
            api_base,
        })
    }

    /// Return a valid token, minting a new one only if the cached token is
    /// absent or within its expiry window.
    pub async fn token(&mut self) -> Result<String, IdentityError> {
        if let Some(cached) = &self.cached {
            if cached.expires_at > Utc::now() {
                return Ok(cached.token.clone());
            }
        }

        debug!("installation token expired or absent, minting a new one");
        let assertion = self.sign_app_assertion()?;
        let response = self.exchange_for_installation_token(&assertion).await?;

        let expires_at = response.expires_at - chrono::Duration::seconds(60);
        self.cached = Some(CachedToken {
            token: response.token.clone(),
            expires_at,
        });
        info!(installation_id = self.installation_id, "minted installation token");
        Ok(response.token)
    }

    fn sign_app_assertion(&self) -> Result<String, IdentityError> {
        let now = Utc::now().timestamp();
        let claims = AppAssertionClaims {
            iat: now - 60,
            exp: now + 600,
            iss: self.app_id,
        };
        let key = EncodingKey::from_rsa_pem(&self.private_key_pem)?;
        let header = Header::new(Algorithm::RS256);
        Ok(encode(&header, &claims, &key)?)
    }

    async fn exchange_for_installation_token(
        &self,
        assertion: &str,
    ) -> Result<InstallationTokenResponse, IdentityError> {
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, self.installation_id
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(assertion)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| IdentityError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IdentityError::UnexpectedStatus(status.as_u16()));
        }

        response
            .json::<InstallationTokenResponse>()
            .await
            .map_err(|e| IdentityError::Request(e.to_string()))
    }
}

/// Cumulative per-process counters (spec §3).
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionCounters {
    pub items_processed: u64,
    pub change_sets_repaired: u64,
    pub conflicts_resolved: u64,
    pub stale_refreshed: u64,
}

impl SessionCounters {
    pub fn summary(&self) -> String {
        format!(
            "items_processed={} change_sets_repaired={} conflicts_resolved={} stale_refreshed={}",
            self.items_processed, self.change_sets_repaired, self.conflicts_resolved, self.stale_refreshed
        )
    }
}

/// Resolve this process's worker id: container hostname, else a random
/// 4-byte hex string (spec §3, §6 `WORKER_ID`).
pub fn resolve_worker_id(explicit: Option<String>) -> String {
    if let Some(id) = explicit {
        return id;
    }
    if let Ok(name) = hostname::get() {
        if let Ok(name) = name.into_string() {
            if !name.is_empty() {
                return name;
            }
        }
    }
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_worker_id_wins() {
        assert_eq!(
            resolve_worker_id(Some("worker-7".to_string())),
            "worker-7"
        );
    }

    #[test]
    fn fallback_worker_id_is_hex() {
        // Hostname may or may not resolve in CI; either branch must
        // produce a non-empty identifier.
        let id = resolve_worker_id(None);
        assert!(!id.is_empty());
    }
}
