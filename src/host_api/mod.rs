//! Host API Client (spec §4.1). Thin authenticated wrapper over the
//! hosting service's REST API: retries transient transport errors with
//! linear backoff, and classifies secondary rate limits into a
//! process-wide cooldown every other caller must honor.

pub mod types;

use crate::error::{is_retryable_transport, HostApiError};
use crate::identity::TokenCache;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use types::*;

const MAX_RETRIES: u32 = 3;
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(10 * 60);

const DEFAULT_API_BASE: &str = "https://api.github.com";

pub struct HostApiClient {
    http: reqwest::Client,
    owner: String,
    repo: String,
    tokens: TokenCache,
    rate_limit_deadline: Option<DateTime<Utc>>,
    api_base: String,
}

impl HostApiClient {
    pub fn new(http: reqwest::Client, owner: String, repo: String, tokens: TokenCache) -> Self {
        Self::with_base_url(http, owner, repo, tokens, DEFAULT_API_BASE.to_string())
    }

    /// Exposed so tests (and GitHub Enterprise deployments) can point the
    /// client at something other than the public API host.
    pub fn with_base_url(
        http: reqwest::Client,
        owner: String,
        repo: String,
        tokens: TokenCache,
        api_base: String,
    ) -> Self {
        Self {
            http,
            owner,
            repo,
            tokens,
            rate_limit_deadline: None,
            api_base,
        }
    }

    /// Every caller in the scheduler consults this before issuing a call
    /// (spec §4.1, §5 "Rate-limit policy").
    pub fn rate_limit_deadline(&self) -> Option<DateTime<Utc>> {
        self.rate_limit_deadline
    }

    /// The current installation token, minted or reused via the cache.
    /// Needed outside this module for the workspace manager's
    /// token-embedded clone/push URLs and the credential refresher.
    pub async fn current_token(&mut self) -> Result<String, HostApiError> {
        self.tokens
            .token()
            .await
            .map_err(|e| HostApiError::Transport(e.to_string()))
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}{}", self.api_base, self.owner, self.repo, path)
    }

    async fn call<B: Serialize + ?Sized, T: DeserializeOwned>(
        &mut self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<ApiOutcomeInner<T>, HostApiError> {
        let mut attempt = 0u32;
        loop {
            let token = self
                .tokens
                .token()
                .await
                .map_err(|e| HostApiError::Transport(e.to_string()))?;

            let mut request = self
                .http
                .request(method.clone(), url)
                .bearer_auth(token)
                .header("Accept", "application/vnd.github+json")
                .header("User-Agent", "claimd");
            if let Some(b) = body {
                request = request.json(b);
            }

            let result = request.send().await;
            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        if status == StatusCode::NO_CONTENT {
                            // Caller expects T = (); deserialize from "null".
                            return serde_json::from_str("null")
                                .map(ApiOutcomeInner::Ok)
                                .map_err(HostApiError::Decode);
                        }
                        let text = response.text().await.map_err(|e| {
                            HostApiError::Transport(e.to_string())
                        })?;
                        let parsed: T = serde_json::from_str(&text)?;
                        return Ok(ApiOutcomeInner::Ok(parsed));
                    }

                    if status == StatusCode::FORBIDDEN {
                        let text = response.text().await.unwrap_or_default();
                        if is_secondary_rate_limit(&text) {
                            self.rate_limit_deadline =
                                Some(Utc::now() + chrono::Duration::from_std(RATE_LIMIT_COOLDOWN).unwrap());
                            warn!("secondary rate limit hit, cooling down for 10 minutes");
                            return Ok(ApiOutcomeInner::RateLimited);
                        }
                        return Ok(ApiOutcomeInner::Other4xx(status.as_u16(), text));
                    }

                    if status == StatusCode::NOT_FOUND {
                        return Ok(ApiOutcomeInner::NotFound);
                    }

                    if status.is_client_error() {
                        let text = response.text().await.unwrap_or_default();
                        return Ok(ApiOutcomeInner::Other4xx(status.as_u16(), text));
                    }

                    // 5xx: treat like a transient failure and retry.
                    if attempt >= MAX_RETRIES {
                        let text = response.text().await.unwrap_or_default();
                        return Ok(ApiOutcomeInner::Server5xx(status.as_u16(), text));
                    }
                }
                Err(e) => {
                    if !is_retryable_transport(&e) || attempt >= MAX_RETRIES {
                        return Err(HostApiError::Transport(e.to_string()));
                    }
                    debug!(attempt, error = %e, "transient transport error, retrying");
                }
            }

            attempt += 1;
            tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
        }
    }

    pub async fn list_open_work_items_by_label(
        &mut self,
        label: &str,
    ) -> Result<Vec<WorkItem>, HostApiError> {
        let url = self.repo_url(&format!(
            "/issues?state=open&labels={}&sort=created&direction=asc",
            label
        ));
        self.call::<(), Vec<WorkItem>>(Method::GET, &url, None)
            .await?
            .into_result()
    }

    pub async fn get_work_item(&mut self, number: u64) -> Result<Option<WorkItem>, HostApiError> {
        let url = self.repo_url(&format!("/issues/{number}"));
        match self.call::<(), WorkItem>(Method::GET, &url, None).await? {
            ApiOutcomeInner::Ok(v) => Ok(Some(v)),
            ApiOutcomeInner::NotFound => Ok(None),
            other => other.into_result().map(Some),
        }
    }

    pub async fn list_comments(&mut self, number: u64) -> Result<Vec<Comment>, HostApiError> {
        let url = self.repo_url(&format!("/issues/{number}/comments"));
        self.call::<(), Vec<Comment>>(Method::GET, &url, None)
            .await?
            .into_result()
    }

    pub async fn get_comment(&mut self, id: u64) -> Result<Option<Comment>, HostApiError> {
        let url = self.repo_url(&format!("/issues/comments/{id}"));
        match self.call::<(), Comment>(Method::GET, &url, None).await? {
            ApiOutcomeInner::Ok(v) => Ok(Some(v)),
            ApiOutcomeInner::NotFound => Ok(None),
            other => other.into_result().map(Some),
        }
    }

    pub async fn post_comment(&mut self, number: u64, body: &str) -> Result<Comment, HostApiError> {
        let url = self.repo_url(&format!("/issues/{number}/comments"));
        let req = PostCommentRequest { body };
        self.call(Method::POST, &url, Some(&req)).await?.into_result()
    }

    pub async fn patch_comment(&mut self, id: u64, body: &str) -> Result<(), HostApiError> {
        let url = self.repo_url(&format!("/issues/comments/{id}"));
        let req = PatchCommentRequest { body };
        self.call::<_, Comment>(Method::PATCH, &url, Some(&req))
            .await?
            .into_result()
            .map(|_| ())
    }

    pub async fn delete_comment(&mut self, id: u64) -> Result<(), HostApiError> {
        let url = self.repo_url(&format!("/issues/comments/{id}"));
        self.call::<(), ()>(Method::DELETE, &url, None)
            .await?
            .into_result()
    }

    pub async fn add_label(&mut self, number: u64, label: &str) -> Result<(), HostApiError> {
        let url = self.repo_url(&format!("/issues/{number}/labels"));
        let req = serde_json::json!({ "labels": [label] });
        self.call::<_, serde_json::Value>(Method::POST, &url, Some(&req))
            .await?
            .into_result()
            .map(|_| ())
    }

    pub async fn remove_label(&mut self, number: u64, label: &str) -> Result<(), HostApiError> {
        let url = self.repo_url(&format!("/issues/{number}/labels/{label}"));
        match self.call::<(), serde_json::Value>(Method::DELETE, &url, None).await? {
            ApiOutcomeInner::NotFound => Ok(()),
            other => other.into_result().map(|_| ()),
        }
    }

    pub async fn list_open_change_sets(&mut self) -> Result<Vec<ChangeSet>, HostApiError> {
        let url = self.repo_url("/pulls?state=open&sort=created&direction=asc");
        self.call::<(), Vec<ChangeSet>>(Method::GET, &url, None)
            .await?
            .into_result()
    }

    pub async fn get_change_set(&mut self, number: u64) -> Result<Option<ChangeSet>, HostApiError> {
        let url = self.repo_url(&format!("/pulls/{number}"));
        match self.call::<(), ChangeSet>(Method::GET, &url, None).await? {
            ApiOutcomeInner::Ok(v) => Ok(Some(v)),
            ApiOutcomeInner::NotFound => Ok(None),
            other => other.into_result().map(Some),
        }
    }

    pub async fn list_check_runs_for_commit(
        &mut self,
        sha: &str,
    ) -> Result<Vec<CheckRun>, HostApiError> {
        let url = self.repo_url(&format!("/commits/{sha}/check-runs"));
        #[derive(serde::Deserialize)]
        struct Page {
            check_runs: Vec<CheckRun>,
        }
        let page: Page = self
            .call::<(), Page>(Method::GET, &url, None)
            .await?
            .into_result()?;
        Ok(page.check_runs)
    }

    pub async fn create_change_set(
        &mut self,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<ChangeSet, HostApiError> {
        let url = self.repo_url("/pulls");
        let req = CreateChangeSetRequest {
            title,
            head,
            base,
            body,
        };
        self.call(Method::POST, &url, Some(&req)).await?.into_result()
    }
}

/// Internal, non-generic-over-error-bucket outcome returned by `call`.
/// `into_result` collapses the non-Ok buckets into `HostApiError` for
/// callers that don't need to distinguish them; code that does (the claim
/// protocol's rate-limit handling) matches on it directly.
enum ApiOutcomeInner<T> {
    Ok(T),
    RateLimited,
    NotFound,
    Other4xx(u16, String),
    Server5xx(u16, String),
}

impl<T> ApiOutcomeInner<T> {
    fn into_result(self) -> Result<T, HostApiError> {
        match self {
            ApiOutcomeInner::Ok(v) => Ok(v),
            ApiOutcomeInner::RateLimited => Err(HostApiError::RateLimited),
            ApiOutcomeInner::NotFound => Err(HostApiError::Unexpected {
                status: 404,
                body: "not found".to_string(),
            }),
            ApiOutcomeInner::Other4xx(status, body) => Err(HostApiError::Unexpected { status, body }),
            ApiOutcomeInner::Server5xx(status, body) => Err(HostApiError::Unexpected { status, body }),
        }
    }
}

fn is_secondary_rate_limit(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("secondary rate limit") || lower.contains("abuse detection")
}
