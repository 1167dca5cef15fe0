//! API client
//!
//! Every outbound HTTP call in the application goes through [`ApiClient`]:
//! GraphQL user reads (single and ≤50-id batch), the REST block call, and
//! credential verification. The client owns rate-limit gating, the
//! empty-body-403 circuit, session recovery (reload the cookie jar and
//! retry the failing call exactly once), and the cache-driven resolve
//! batcher.
//!
//! Per-target failures never surface as errors here; they come back as
//! [`CallOutcome::Failed`] with structured failure info for the
//! classifier. Only a second authentication rejection (after recovery) or
//! run cancellation produce an `Err`.

use reqwest::header::HeaderMap;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::api::graphql;
use crate::api::headers::{self, HeaderOptions};
use crate::api::rate_limit::{EndpointFamily, RateLimitLedger, ThrottleCircuit};
use crate::api::session::SessionStore;
use crate::config::{ApiConfig, ThrottleConfig};
use crate::data::{
    Coverage, FailureInfo, Relationship, ResolveOutcome, ResolvedUser, TargetFormat, UserCache,
    UserProfile,
};
use crate::error::{AppError, Result};

/// Pause before retrying a call after a session reload.
const AUTH_RECOVERY_SLEEP: Duration = Duration::from_secs(2);

/// Outcome of one upstream call that completed at the HTTP layer.
#[derive(Debug)]
pub enum CallOutcome {
    /// 2xx; parsed JSON body (an empty body parses to `null`).
    Ok(Value),
    /// Non-fatal failure with everything the classifier needs.
    Failed(FailureInfo),
}

enum RequestSpec<'a> {
    GraphqlGet {
        path: &'a str,
        variables: String,
    },
    RestPost {
        path: &'a str,
        form: Vec<(&'a str, &'a str)>,
    },
    RestGet {
        path: &'a str,
    },
}

/// HTTP client for the upstream APIs, shared by the whole run
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    session: Mutex<SessionStore>,
    ledger: RateLimitLedger,
    circuit: Mutex<ThrottleCircuit>,
    cache: UserCache,
    header_options: HeaderOptions,
    cancel: CancellationToken,
}

impl ApiClient {
    pub fn new(
        api: &ApiConfig,
        throttle: &ThrottleConfig,
        session: SessionStore,
        cache: UserCache,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(api.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            session: Mutex::new(session),
            ledger: RateLimitLedger::new(),
            circuit: Mutex::new(ThrottleCircuit::new(
                throttle.consecutive_403s,
                Duration::from_secs(throttle.window_secs),
                Duration::from_secs(throttle.cooldown_secs),
            )),
            cache,
            header_options: HeaderOptions {
                transaction_id: api.enable_header_enhancement,
                forwarded_for: api.enable_forwarded_for,
            },
            cancel,
        })
    }

    pub fn cache(&self) -> &UserCache {
        &self.cache
    }

    // -------------------------------------------------------------------------
    // Endpoint surface
    // -------------------------------------------------------------------------

    /// Resolve a single handle to a full profile + relationship.
    pub async fn user_by_screen_name(&self, screen_name: &str) -> Result<ResolveOutcome> {
        let outcome = self
            .dispatch(
                EndpointFamily::UserRead,
                RequestSpec::GraphqlGet {
                    path: graphql::USER_BY_SCREEN_NAME_PATH,
                    variables: graphql::screen_name_variables(screen_name),
                },
            )
            .await?;

        Ok(match outcome {
            CallOutcome::Ok(body) => {
                let resolved = graphql::parse_single_response(&body, Some(screen_name), None);
                self.populate_cache(&resolved, Some(screen_name));
                resolved
            }
            CallOutcome::Failed(info) => ResolveOutcome::TransientFailure(info),
        })
    }

    /// Resolve a single numeric id.
    pub async fn user_by_rest_id(&self, user_id: &str) -> Result<ResolveOutcome> {
        let outcome = self
            .dispatch(
                EndpointFamily::UserRead,
                RequestSpec::GraphqlGet {
                    path: graphql::USER_BY_REST_ID_PATH,
                    variables: graphql::rest_id_variables(user_id),
                },
            )
            .await?;

        Ok(match outcome {
            CallOutcome::Ok(body) => {
                let resolved = graphql::parse_single_response(&body, None, Some(user_id));
                self.populate_cache(&resolved, None);
                resolved
            }
            CallOutcome::Failed(info) => ResolveOutcome::TransientFailure(info),
        })
    }

    /// Batch-resolve numeric ids, chunked to the upstream's 50-id limit.
    pub async fn users_by_rest_ids(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, ResolveOutcome>> {
        let mut outcomes = HashMap::with_capacity(user_ids.len());

        for chunk in user_ids.chunks(graphql::BATCH_LIMIT) {
            let outcome = self
                .dispatch(
                    EndpointFamily::UserRead,
                    RequestSpec::GraphqlGet {
                        path: graphql::USERS_BY_REST_IDS_PATH,
                        variables: graphql::rest_ids_variables(chunk),
                    },
                )
                .await?;

            match outcome {
                CallOutcome::Ok(body) => {
                    for (id, resolved) in
                        chunk.iter().zip(graphql::parse_batch_response(&body, chunk))
                    {
                        self.populate_cache(&resolved, None);
                        outcomes.insert(id.clone(), resolved);
                    }
                }
                CallOutcome::Failed(info) => {
                    // Whole chunk shares the transport/HTTP failure.
                    for id in chunk {
                        outcomes.insert(
                            id.clone(),
                            ResolveOutcome::TransientFailure(info.clone()),
                        );
                    }
                }
            }
        }

        Ok(outcomes)
    }

    /// Install a block on `user_id` via the legacy REST endpoint.
    pub async fn block_user(&self, user_id: &str) -> Result<CallOutcome> {
        self.dispatch(
            EndpointFamily::BlockCreate,
            RequestSpec::RestPost {
                path: graphql::BLOCKS_CREATE_PATH,
                form: vec![("user_id", user_id)],
            },
        )
        .await
    }

    /// Fetch (and remember) the caller's account id.
    pub async fn verify_credentials(&self) -> Result<CallOutcome> {
        let outcome = self
            .dispatch(
                EndpointFamily::VerifyCredentials,
                RequestSpec::RestGet {
                    path: graphql::VERIFY_CREDENTIALS_PATH,
                },
            )
            .await?;

        if let CallOutcome::Ok(body) = &outcome {
            if let Some(id) = body.get("id_str").and_then(Value::as_str) {
                self.session.lock().await.set_caller_id(id.to_string());
            }
        }
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Batched resolve with cache
    // -------------------------------------------------------------------------

    /// Resolve a batch of targets with the minimum necessary upstream
    /// calls: full cache hits are answered locally, ids (and handles with
    /// a cached lookup) go through the ≤50 batch endpoint, and handles
    /// without a lookup entry fall back to the per-handle call.
    pub async fn resolve_users(
        &self,
        identifiers: &[String],
        format: TargetFormat,
    ) -> Result<HashMap<String, ResolveOutcome>> {
        let mut outcomes = HashMap::with_capacity(identifiers.len());

        match format {
            TargetFormat::UserId => {
                let mut to_fetch = Vec::new();
                for (id, coverage) in self.cache.coverage_for_ids(identifiers) {
                    match coverage {
                        Coverage::Full => {
                            if let Some(resolved) = self.cached_user(&id) {
                                outcomes.insert(id, ResolveOutcome::Ok(resolved));
                                continue;
                            }
                            to_fetch.push(id);
                        }
                        Coverage::Partial | Coverage::Miss => to_fetch.push(id),
                    }
                }

                if !to_fetch.is_empty() {
                    outcomes.extend(self.users_by_rest_ids(&to_fetch).await?);
                }
            }
            TargetFormat::ScreenName => {
                let mut batch_ids: Vec<String> = Vec::new();
                let mut batch_handles: HashMap<String, String> = HashMap::new();
                let mut legacy_handles: Vec<String> = Vec::new();

                for (handle, coverage) in self.cache.coverage_for_handles(identifiers) {
                    match coverage {
                        Coverage::Full => {
                            let cached = self
                                .cache
                                .get_lookup(&handle)
                                .and_then(|id| self.cached_user(&id));
                            match cached {
                                Some(resolved) => {
                                    outcomes.insert(handle, ResolveOutcome::Ok(resolved));
                                }
                                None => legacy_handles.push(handle),
                            }
                        }
                        Coverage::Partial => {
                            // Lookup tier is warm: refresh the stale tiers
                            // through the batch endpoint.
                            match self.cache.get_lookup(&handle) {
                                Some(id) => {
                                    batch_handles.insert(id.clone(), handle);
                                    batch_ids.push(id);
                                }
                                None => legacy_handles.push(handle),
                            }
                        }
                        Coverage::Miss => legacy_handles.push(handle),
                    }
                }

                if !batch_ids.is_empty() {
                    for (id, resolved) in self.users_by_rest_ids(&batch_ids).await? {
                        if let Some(handle) = batch_handles.remove(&id) {
                            outcomes.insert(handle, resolved);
                        }
                    }
                }

                // No cached lookup: the per-handle endpoint is the only way
                // to learn the id. It returns the full profile, so these
                // targets skip the batch entirely.
                for handle in legacy_handles {
                    let resolved = self.user_by_screen_name(&handle).await?;
                    outcomes.insert(handle, resolved);
                }
            }
        }

        self.cache.evict_excess();
        Ok(outcomes)
    }

    fn cached_user(&self, id: &str) -> Option<ResolvedUser> {
        let profile: UserProfile = self.cache.get_profile(id)?;
        let relationship: Relationship = self.cache.get_relationship(id)?;
        Some(ResolvedUser {
            profile,
            relationship,
        })
    }

    fn populate_cache(&self, resolved: &ResolveOutcome, requested_handle: Option<&str>) {
        if let ResolveOutcome::Ok(user) = resolved {
            let id = &user.profile.id;
            if let Some(handle) = user.profile.screen_name.as_deref().or(requested_handle) {
                self.cache.put_lookup(handle, id);
            }
            self.cache.put_profile(id, &user.profile);
            self.cache.put_relationship(id, &user.relationship);
        }
    }

    // -------------------------------------------------------------------------
    // Dispatch core
    // -------------------------------------------------------------------------

    async fn dispatch(
        &self,
        family: EndpointFamily,
        spec: RequestSpec<'_>,
    ) -> Result<CallOutcome> {
        let mut auth_retried = false;

        loop {
            // Circuit first: an open circuit pauses all dispatch from this
            // caller session.
            let cooldown = self.circuit.lock().await.active_cooldown();
            if let Some(cooldown) = cooldown {
                tracing::warn!(
                    cooldown_secs = cooldown.as_secs(),
                    "throttle circuit open, pausing dispatch"
                );
                self.sleep_cancellable(cooldown).await?;
            }

            if let Some(wait) = self.ledger.wait_before_dispatch(family) {
                tracing::info!(
                    family = family.as_str(),
                    wait_secs = wait.as_secs(),
                    "rate-limit bucket empty, waiting for reset"
                );
                self.sleep_cancellable(wait).await?;
            }

            let request = self.build_request(&spec).await;
            let response = match request.send().await {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(%error, family = family.as_str(), "transport failure");
                    return Ok(CallOutcome::Failed(FailureInfo {
                        network: true,
                        api_error_message: Some(error.to_string()),
                        ..FailureInfo::default()
                    }));
                }
            };

            let status = response.status().as_u16();
            let response_headers = response.headers().clone();
            self.ledger.update_from_headers(family, &response_headers);

            let body_text = response.text().await.unwrap_or_default();

            if (200..300).contains(&status) {
                self.circuit.lock().await.record_success();
                let body: Value = serde_json::from_str(&body_text).unwrap_or(Value::Null);
                if let Some(flag) = graphql::missing_feature(&body) {
                    tracing::error!(
                        flag,
                        "upstream requires a feature flag missing from the table"
                    );
                }
                return Ok(CallOutcome::Ok(body));
            }

            match status {
                401 if !auth_retried => {
                    // Session likely stale: reload the jar from disk and
                    // retry this call exactly once.
                    tracing::warn!("upstream rejected session, reloading cookie jar");
                    {
                        let mut session = self.session.lock().await;
                        session.clear_caller_id();
                        session.reload()?;
                    }
                    self.sleep_cancellable(AUTH_RECOVERY_SLEEP).await?;
                    auth_retried = true;
                    continue;
                }
                401 => {
                    return Err(AppError::Auth(
                        "session rejected twice; refresh the cookie jar and re-run".to_string(),
                    ));
                }
                403 if body_text.trim().is_empty() => {
                    let tripped = self.circuit.lock().await.record_forbidden();
                    if let Some(cooldown) = tripped {
                        tracing::warn!(
                            cooldown_secs = cooldown.as_secs(),
                            "entering upstream-throttle cool-down"
                        );
                    }
                    return Ok(CallOutcome::Failed(FailureInfo::from_status(403)));
                }
                _ => {
                    return Ok(CallOutcome::Failed(Self::failure_from_response(
                        status,
                        &body_text,
                        &response_headers,
                    )));
                }
            }
        }
    }

    async fn build_request(&self, spec: &RequestSpec<'_>) -> reqwest::RequestBuilder {
        let mut session = self.session.lock().await;
        // Pick up an externally refreshed jar without waiting for an auth
        // failure. A bad on-disk jar keeps the current one.
        if let Err(error) = session.reload_if_changed() {
            tracing::warn!(%error, "cookie jar changed on disk but could not be reloaded");
        }
        match spec {
            RequestSpec::GraphqlGet { path, variables } => self
                .http
                .get(format!("{}{}", self.base_url, path))
                .headers(headers::graphql_headers(&session, self.header_options))
                .query(&[
                    ("variables", variables.as_str()),
                    ("features", graphql::features_json().as_str()),
                ]),
            RequestSpec::RestPost { path, form } => self
                .http
                .post(format!("{}{}", self.base_url, path))
                .headers(headers::rest_headers(
                    &session,
                    self.header_options,
                    &self.base_url,
                ))
                .form(form),
            RequestSpec::RestGet { path } => self
                .http
                .get(format!("{}{}", self.base_url, path))
                .headers(headers::rest_headers(
                    &session,
                    self.header_options,
                    &self.base_url,
                )),
        }
    }

    fn failure_from_response(status: u16, body_text: &str, headers: &HeaderMap) -> FailureInfo {
        let body: Option<Value> = serde_json::from_str(body_text).ok();
        let (message, code) = body
            .as_ref()
            .and_then(|b| b.get("errors"))
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
            .map(|error| {
                (
                    error
                        .get("message")
                        .and_then(Value::as_str)
                        .map(String::from),
                    error.get("code").and_then(Value::as_i64),
                )
            })
            .unwrap_or_else(|| {
                let trimmed = body_text.trim();
                (
                    (!trimmed.is_empty())
                        .then(|| crate::data::truncate_sample(trimmed, 200)),
                    None,
                )
            });

        let rate_limit_reset = headers
            .get("x-rate-limit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());

        FailureInfo {
            http_status: Some(status),
            api_error_message: message,
            api_error_code: code,
            network: false,
            rate_limit_reset,
        }
    }

    /// Cooperative sleep that a termination signal can cut short. A
    /// cancelled wait aborts the dispatch before any new upstream call.
    async fn sleep_cancellable(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(AppError::Upstream("run cancelled during wait".to_string()))
            }
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
