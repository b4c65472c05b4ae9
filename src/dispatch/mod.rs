pub mod health;
pub mod policy;
pub mod rate_limit;
pub mod sse;
pub mod telemetry;

use http_body_util::{BodyExt, Either, Full};
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::manager::{AUTH_COOLDOWN_MS, AccountManager, ManagedAccount};
use crate::auth::oauth::TokenResult;
use crate::auth::refresh::RefreshQueue;
use crate::auth::store::{CooldownReason, SwitchReason};
use crate::auth::{HttpClient, identity, now_ms};
use crate::config::{Config, SelectionStrategy};
use crate::error::{ApiError, AuthError, Error, Result};
use crate::models::model_family;

use policy::{DecisionInputs, RateLimitDecision, decide};
use rate_limit::{
    RateLimitTracker, RateLimitTrackerConfig, body_indicates_rate_limit, classify_reason,
    format_duration, parse_retry_after,
};
use sse::{ChannelBody, tap_sse_body};
use telemetry::TelemetrySink;

/// Response body: buffered for JSON, channel-backed for SSE passthrough.
pub type DispatchBody = Either<Full<Bytes>, ChannelBody>;

/// Vendor request markers overlaid on every upstream call
const ACCOUNT_ID_HEADER: &str = "chatgpt-account-id";
const ORIGINATOR_HEADER: &str = "originator";
const ORIGINATOR_VALUE: &str = "codexmux";
const BETA_HEADER: &str = "OpenAI-Beta";
const BETA_VALUE: &str = "responses=experimental";

/// Caller-supplied request parameters. Body rewriting for the vendor wire
/// format happens before this layer; the orchestrator only overlays
/// credentials and markers.
pub struct RequestInit {
    pub method: hyper::Method,
    pub headers: hyper::HeaderMap,
    pub body: Bytes,
    pub model: String,
    /// Stable opaque conversation id, used only for transition notices
    pub prompt_cache_key: Option<String>,
    pub cancel: Option<CancellationToken>,
}

/// Toast-like notification sink. The host injects its own; the default
/// writes structured log lines.
pub trait Notify: Send + Sync {
    fn toast(&self, message: &str);
}

pub struct LogNotifier;

impl Notify for LogNotifier {
    fn toast(&self, message: &str) {
        info!(message = %message, "notice");
    }
}

/// Token refresh seam; tests substitute fakes.
pub trait TokenRefresher: Send + Sync {
    fn refresh(&self, refresh_token: String) -> Pin<Box<dyn Future<Output = TokenResult> + Send>>;
}

pub struct OAuthRefresher {
    http_client: Arc<HttpClient>,
}

impl OAuthRefresher {
    pub fn new(http_client: Arc<HttpClient>) -> Self {
        Self { http_client }
    }
}

impl TokenRefresher for OAuthRefresher {
    fn refresh(
        &self,
        refresh_token: String,
    ) -> Pin<Box<dyn Future<Output = TokenResult> + Send>> {
        let http_client = self.http_client.clone();
        Box::pin(async move {
            crate::auth::oauth::refresh_access_token(&http_client, &refresh_token).await
        })
    }
}

struct SessionState {
    seen_session_keys: HashSet<String>,
    last_session_key: Option<String>,
    last_account_label: Option<String>,
}

/// Refund-on-drop guard for a hybrid token-bucket charge. Cancellation
/// drops the call future, which refunds the consumed credit automatically.
struct BucketCharge {
    buckets: Arc<health::TokenBucketTracker>,
    key: String,
    armed: bool,
}

impl BucketCharge {
    fn new(buckets: Arc<health::TokenBucketTracker>, key: String) -> Self {
        Self {
            buckets,
            key,
            armed: true,
        }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for BucketCharge {
    fn drop(&mut self) {
        if self.armed {
            self.buckets.refund(&self.key, 1.0);
        }
    }
}

enum CandidateOutcome {
    Done(Response<DispatchBody>),
    NextCandidate,
}

/// The dispatch core: select an account, ensure its token, send, classify,
/// and retry / rotate / wait under the rate-limit policy.
pub struct FetchOrchestrator {
    manager: Arc<AccountManager>,
    tracker: RateLimitTracker,
    sink: Arc<TelemetrySink>,
    refresher: Arc<dyn TokenRefresher>,
    refresh_queue: Option<Arc<RefreshQueue>>,
    notifier: Arc<dyn Notify>,
    config: Config,
    client: Client<
        hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
        Full<Bytes>,
    >,
    session: Mutex<SessionState>,
    toast_at: Mutex<HashMap<String, u64>>,
    repair_done: std::sync::atomic::AtomicBool,
}

impl FetchOrchestrator {
    pub fn new(
        manager: Arc<AccountManager>,
        sink: Arc<TelemetrySink>,
        refresher: Arc<dyn TokenRefresher>,
        refresh_queue: Option<Arc<RefreshQueue>>,
        notifier: Arc<dyn Notify>,
        config: Config,
    ) -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);

        let tracker = RateLimitTracker::new(RateLimitTrackerConfig {
            dedup_window_ms: config.rate_limit_dedup_window_ms,
            reset_window_ms: config.rate_limit_state_reset_ms,
            default_retry_after_ms: config.default_retry_after_ms,
            max_backoff_ms: config.max_backoff_ms,
            jitter_max_ms: config.request_jitter_max_ms,
        });

        Self {
            manager,
            tracker,
            sink,
            refresher,
            refresh_queue,
            notifier,
            config,
            client,
            session: Mutex::new(SessionState {
                seen_session_keys: HashSet::new(),
                last_session_key: None,
                last_account_label: None,
            }),
            toast_at: Mutex::new(HashMap::new()),
            repair_done: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn manager(&self) -> &Arc<AccountManager> {
        &self.manager
    }

    pub fn sink(&self) -> &Arc<TelemetrySink> {
        &self.sink
    }

    /// Dispatch one request. Returns the upstream response (SSE bodies
    /// stream through a telemetry tap) or a synthesized 429 when every
    /// account is unavailable.
    pub async fn execute(&self, url: &str, init: RequestInit) -> Result<Response<DispatchBody>> {
        let cancel = init.cancel.clone();
        let timeout = Duration::from_secs(self.config.server.request_timeout_secs);

        let inner = self.execute_inner(url, init);
        let timed = tokio::time::timeout(timeout, inner);

        match cancel {
            Some(cancel) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    result = timed => result.map_err(|_| Error::Timeout(timeout))?,
                }
            }
            None => timed.await.map_err(|_| Error::Timeout(timeout))?,
        }
    }

    async fn execute_inner(&self, url: &str, init: RequestInit) -> Result<Response<DispatchBody>> {
        self.note_session_transition(init.prompt_cache_key.as_deref());

        let family = model_family(&init.model).to_string();
        let model = init.model.clone();

        // Repair gate, first call only: hydrate or quarantine legacy records
        if !self.repair_done.swap(true, std::sync::atomic::Ordering::SeqCst)
            && self.manager.has_legacy_records()
        {
            let refresher = self.refresher.clone();
            let outcome = self
                .manager
                .repair_legacy(move |token| refresher.refresh(token))
                .await;
            if !outcome.quarantined.is_empty() {
                self.toast(&format!(
                    "Removed {} unrecoverable account(s); run 'codexmux login' to replace them",
                    outcome.quarantined.len()
                ));
            }
        }

        if self.manager.account_count() == 0 {
            return Ok(self.synthesize_unavailable(&family, Some(&model)));
        }

        let mut outer_attempts = 0u32;
        loop {
            let mut attempted: HashSet<usize> = HashSet::new();

            loop {
                let Some(account) = self.manager.current_or_next_for_family(
                    &family,
                    Some(&model),
                    self.config.account_selection_strategy,
                    self.config.pid_offset_enabled,
                ) else {
                    break;
                };
                if !attempted.insert(account.index) {
                    break;
                }

                self.note_account_transition(&account);

                match self.try_candidate(url, &init, account, &family, &model).await? {
                    CandidateOutcome::Done(response) => return Ok(response),
                    CandidateOutcome::NextCandidate => continue,
                }
            }

            // Every candidate tried. Either wait out the shortest limit or
            // synthesize the unavailable response.
            let refresher = self.refresher.clone();
            let min_wait = self
                .manager
                .min_wait_time_for_family_repairing(&family, Some(&model), move |token| {
                    refresher.refresh(token)
                })
                .await;

            let ceiling = self.config.retry_all_accounts_max_wait_ms;
            let can_retry = self.config.retry_all_accounts_rate_limited
                && outer_attempts < self.config.retry_all_accounts_max_retries
                && min_wait > 0
                && (ceiling == 0 || min_wait <= ceiling);

            if !can_retry {
                return Ok(self.synthesize_unavailable(&family, Some(&model)));
            }

            outer_attempts += 1;
            info!(
                wait_ms = min_wait,
                attempt = outer_attempts,
                "all accounts limited, waiting for earliest reset"
            );
            tokio::time::sleep(Duration::from_millis(min_wait)).await;
        }
    }

    /// Drive one account through token-ensure, send, and classification.
    async fn try_candidate(
        &self,
        url: &str,
        init: &RequestInit,
        mut account: ManagedAccount,
        family: &str,
        model: &str,
    ) -> Result<CandidateOutcome> {
        let mut tried_401_recovery = false;

        loop {
            match self.ensure_token_fresh(&account).await {
                Ok(updated) => account = updated,
                Err(e) => {
                    warn!(index = account.index, error = %e, "account cannot authenticate, cooling down");
                    self.manager.mark_cooling_down(
                        account.index,
                        AUTH_COOLDOWN_MS,
                        CooldownReason::AuthFailure,
                    );
                    return Ok(CandidateOutcome::NextCandidate);
                }
            }

            // Identity recheck: without an account id the vendor rejects us
            let account_id = account.record.account_id.clone().or_else(|| {
                account
                    .access
                    .as_deref()
                    .and_then(identity::extract_account_id)
            });
            let Some(account_id) = account_id else {
                warn!(
                    index = account.index,
                    error = %AuthError::IdentityMissing,
                    "cooling down"
                );
                self.manager.mark_cooling_down(
                    account.index,
                    AUTH_COOLDOWN_MS,
                    CooldownReason::AuthFailure,
                );
                return Ok(CandidateOutcome::NextCandidate);
            };

            let key = account.key();

            // Hybrid accounting: a charge that fails moves us along
            let charge = if self.config.account_selection_strategy == SelectionStrategy::Hybrid {
                if !self.manager.buckets().consume(&key, 1.0) {
                    debug!(index = account.index, "token bucket empty, next candidate");
                    return Ok(CandidateOutcome::NextCandidate);
                }
                Some(BucketCharge::new(self.manager.buckets().clone(), key.clone()))
            } else {
                None
            };

            let request = self.build_request(url, init, &account, &account_id)?;
            let response = match self.client.request(request).await {
                Ok(response) => response,
                Err(e) => {
                    // Transport error: refund, record, propagate
                    drop(charge);
                    self.manager.health().record_failure(&key);
                    return Err(Error::Http(e.to_string()));
                }
            };

            // Quota telemetry rides on every response
            self.sink.apply_headers(&key, response.headers());

            let status = response.status();
            if status.is_success() {
                if let Some(charge) = charge {
                    charge.commit();
                }
                self.manager.health().record_success(&key);
                self.manager.mark_used(account.index);
                self.tracker.clear(&tracker_key(family, model));
                return Ok(CandidateOutcome::Done(
                    self.forward_response(response, &key).await?,
                ));
            }

            // Error paths need the body text for classification
            let (parts, body) = response.into_parts();
            let body_bytes = body
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            let body_text = String::from_utf8_lossy(&body_bytes).into_owned();

            if status == StatusCode::UNAUTHORIZED {
                drop(charge);
                if !tried_401_recovery {
                    tried_401_recovery = true;
                    debug!(index = account.index, "401 from upstream, refreshing once");
                    let refresher = self.refresher.clone();
                    let result = self
                        .manager
                        .refresh_with_fallback(account.index, self.config.token_refresh_skew_ms, {
                            move |token| refresher.refresh(token)
                        })
                        .await;
                    if result.is_success() {
                        if let Some(updated) = self.manager.account_at(account.index) {
                            account = updated;
                        }
                        continue;
                    }
                }
                warn!(index = account.index, "persistent 401, cooling down");
                self.manager.health().record_failure(&key);
                self.manager.mark_cooling_down(
                    account.index,
                    AUTH_COOLDOWN_MS,
                    CooldownReason::AuthFailure,
                );
                return Ok(CandidateOutcome::NextCandidate);
            }

            let is_rate_limited = status == StatusCode::TOO_MANY_REQUESTS
                || body_indicates_rate_limit(status.as_u16(), &body_text);

            if is_rate_limited {
                drop(charge);
                self.manager.health().record_rate_limited(&key);

                let reason = classify_reason(status.as_u16(), &body_text);
                let retry_after = parse_retry_after(&parts.headers);
                let backoff =
                    self.tracker
                        .get_backoff(&tracker_key(family, model), reason, retry_after);

                // One store write per observation; duplicates skip it
                if !backoff.is_duplicate {
                    self.manager
                        .mark_rate_limited(account.index, backoff.delay_ms, family, Some(model));
                    if let Err(e) = self.manager.save_to_disk() {
                        warn!(error = %e, "failed to persist rate limit state");
                    }
                    self.toast_rate_limited(&account, backoff.delay_ms, reason.as_str());
                }

                let inputs = DecisionInputs {
                    scheduling_mode: self.config.scheduling_mode,
                    account_count: self.manager.account_count(),
                    max_cache_first_wait_ms: self.config.max_cache_first_wait_seconds * 1000,
                    switch_on_first_rate_limit: self.config.switch_on_first_rate_limit,
                };

                match decide(&inputs, &backoff) {
                    RateLimitDecision::Wait { delay_ms } => {
                        info!(
                            index = account.index,
                            delay_ms = delay_ms,
                            attempt = backoff.attempt,
                            reason = reason.as_str(),
                            "rate limited, waiting on the same account"
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        continue;
                    }
                    RateLimitDecision::Switch => {
                        info!(
                            index = account.index,
                            attempt = backoff.attempt,
                            reason = reason.as_str(),
                            "rate limited, switching account"
                        );
                        self.manager
                            .mark_switched(account.index, SwitchReason::RateLimit, family);
                        return Ok(CandidateOutcome::NextCandidate);
                    }
                }
            }

            // Any other non-2xx goes back to the caller unchanged
            if let Some(charge) = charge {
                charge.commit();
            }
            self.manager.health().record_failure(&key);
            debug!(status = status.as_u16(), "upstream error returned to caller");
            return Ok(CandidateOutcome::Done(Response::from_parts(
                parts,
                Either::Left(Full::new(body_bytes)),
            )));
        }
    }

    /// Make sure the account's access token is usable. Stale-but-alive
    /// tokens ride along while a background refresh queues; expired tokens
    /// block on a synchronous single-flight refresh.
    async fn ensure_token_fresh(
        &self,
        account: &ManagedAccount,
    ) -> std::result::Result<ManagedAccount, AuthError> {
        let now = now_ms();
        let skew = self.config.token_refresh_skew_ms;

        if account.is_token_fresh(skew, now) {
            return Ok(account.clone());
        }

        if !account.is_token_expired(now)
            && let Some(queue) = &self.refresh_queue
        {
            // Not yet expired: refresh in the background, use what we have
            let manager = self.manager.clone();
            let refresher = self.refresher.clone();
            let index = account.index;
            queue.enqueue(&account.key(), account.expires.unwrap_or(0), move || {
                Box::pin(async move {
                    manager
                        .refresh_with_fallback(index, skew, move |token| refresher.refresh(token))
                        .await
                })
            });
            return Ok(account.clone());
        }

        let refresher = self.refresher.clone();
        let result = self
            .manager
            .refresh_with_fallback(account.index, skew, move |token| refresher.refresh(token))
            .await;

        match result {
            TokenResult::Success { .. } => self
                .manager
                .account_at(account.index)
                .ok_or_else(|| AuthError::RefreshFailed("account disappeared".to_string())),
            TokenResult::Failed { reason } => Err(AuthError::RefreshFailed(reason)),
        }
    }

    /// Overlay vendor credentials and markers on the caller's request.
    fn build_request(
        &self,
        url: &str,
        init: &RequestInit,
        account: &ManagedAccount,
        account_id: &str,
    ) -> Result<Request<Full<Bytes>>> {
        let mut builder = Request::builder().method(init.method.clone()).uri(url);

        for (name, value) in &init.headers {
            match name.as_str() {
                // Ours to set
                "host" | "content-length" | "authorization" | ACCOUNT_ID_HEADER => {}
                _ => {
                    builder = builder.header(name, value);
                }
            }
        }

        let access = account.access.clone().unwrap_or_default();
        builder = builder
            .header("Authorization", format!("Bearer {access}"))
            .header(ACCOUNT_ID_HEADER, account_id)
            .header(ORIGINATOR_HEADER, ORIGINATOR_VALUE)
            .header(BETA_HEADER, BETA_VALUE);

        if !init.headers.contains_key("content-type") {
            builder = builder.header("Content-Type", "application/json");
        }
        if let Some(session_key) = &init.prompt_cache_key {
            builder = builder.header("prompt_cache_key", session_key);
        }

        builder
            .body(Full::new(init.body.clone()))
            .map_err(|e| Error::Http(e.to_string()))
    }

    /// Forward a successful response, tapping SSE bodies for telemetry.
    async fn forward_response(
        &self,
        response: Response<hyper::body::Incoming>,
        key: &str,
    ) -> Result<Response<DispatchBody>> {
        let is_sse = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("event-stream"));

        let (parts, body) = response.into_parts();

        if is_sse {
            let sink = self.sink.clone();
            let key = key.to_string();
            let tapped = tap_sse_body(body, move |rate_limits| {
                sink.apply_rate_limits(&key, rate_limits);
            });
            return Ok(Response::from_parts(parts, Either::Right(tapped)));
        }

        let bytes = body
            .collect()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .to_bytes();
        Ok(Response::from_parts(parts, Either::Left(Full::new(bytes))))
    }

    /// The synthesized all-accounts-unavailable response: HTTP 429 with a
    /// per-account status body.
    fn synthesize_unavailable(&self, family: &str, model: Option<&str>) -> Response<DispatchBody> {
        let accounts = self.manager.accounts_snapshot();
        let now = now_ms();
        let count = self.manager.account_count();
        let min_wait = self.manager.min_wait_time_for_family(family, model);

        let (base, specific) = crate::models::quota_keys(family, model);
        let mut keys: Vec<&str> = vec![&base];
        if let Some(specific) = &specific {
            keys.push(specific);
        }

        let details: Vec<serde_json::Value> = accounts
            .iter()
            .filter(|a| a.record.is_hydrated() && a.record.is_enabled())
            .map(|a| {
                let status = if a.record.is_cooling_down(now) {
                    "cooldown"
                } else if a.record.is_rate_limited_for(&keys, now) {
                    "rate-limited"
                } else {
                    "ok"
                };
                serde_json::json!({
                    "account": a.label(),
                    "status": status,
                    "quota": self.sink.quota_lines(&a.key()),
                })
            })
            .collect();

        let message = if count == 0 {
            "No accounts configured. Run 'codexmux login' to add one.".to_string()
        } else {
            let unavailable = ApiError::AllAccountsUnavailable {
                count,
                next_reset: format_duration(min_wait),
            };
            format!("{unavailable}. Add more accounts or wait for the limit to reset.")
        };

        let body = serde_json::json!({
            "error": {
                "message": message,
                "type": "rate_limit_error",
                "accounts": details,
            }
        });

        Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("content-type", "application/json; charset=utf-8")
            .body(Either::Left(Full::new(Bytes::from(body.to_string()))))
            .expect("static response")
    }

    /// Emit one transition notice per session switch or new chat.
    fn note_session_transition(&self, session_key: Option<&str>) {
        let Some(session_key) = session_key else {
            return;
        };
        let mut session = self.session.lock();
        if session.last_session_key.as_deref() == Some(session_key) {
            return;
        }
        let known = session.seen_session_keys.contains(session_key);
        if !known {
            session.seen_session_keys.insert(session_key.to_string());
        }
        session.last_session_key = Some(session_key.to_string());
        drop(session);

        if known {
            self.toast("Resumed a previous session");
        } else {
            self.toast("Started a new chat");
        }
    }

    fn note_account_transition(&self, account: &ManagedAccount) {
        let label = account.label();
        let mut session = self.session.lock();
        if session.last_account_label.as_deref() == Some(&label) {
            return;
        }
        let first = session.last_account_label.is_none();
        session.last_account_label = Some(label.clone());
        drop(session);

        if !first {
            self.toast(&format!("Switched to {label}"));
        }
    }

    /// Rate-limit toasts are debounced per account.
    fn toast_rate_limited(&self, account: &ManagedAccount, delay_ms: u64, reason: &str) {
        let now = now_ms();
        {
            let mut toast_at = self.toast_at.lock();
            let last = toast_at.entry(account.key()).or_insert(0);
            if now.saturating_sub(*last) < self.config.rate_limit_toast_debounce_ms {
                return;
            }
            *last = now;
        }
        self.toast(&format!(
            "{} rate limited ({reason}), retrying in {}",
            account.label(),
            format_duration(delay_ms)
        ));
    }

    fn toast(&self, message: &str) {
        if self.config.quiet_mode {
            return;
        }
        self.notifier.toast(message);
    }
}

fn tracker_key(family: &str, model: &str) -> String {
    if model != family {
        format!("{family}:{model}")
    } else {
        family.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::{AccountRecord, AccountStore, StoreFile};
    use crate::dispatch::health::{
        HealthConfig, HealthTracker, TokenBucketConfig, TokenBucketTracker,
    };
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn identity_jwt(n: u32) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let payload = serde_json::json!({
            crate::auth::identity::AUTH_CLAIM_NAMESPACE: {
                "chatgpt_account_id": format!("acc-{n}"),
                "email": format!("user{n}@example.com"),
                "chatgpt_plan_type": "plus",
            }
        });
        let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        format!("{header}.{body}.sig")
    }

    fn hydrated_record(n: u32) -> AccountRecord {
        let mut record = AccountRecord::new(format!("rt-{n}"));
        record.account_id = Some(format!("acc-{n}"));
        record.email = Some(format!("user{n}@example.com"));
        record.plan = Some("Plus".to_string());
        record
    }

    struct FakeRefresher {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl FakeRefresher {
        fn new(fail: bool) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                fail,
            }
        }
    }

    impl TokenRefresher for FakeRefresher {
        fn refresh(
            &self,
            refresh_token: String,
        ) -> Pin<Box<dyn Future<Output = TokenResult> + Send>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    TokenResult::Failed {
                        reason: "invalid_grant".into(),
                    }
                } else {
                    TokenResult::Success {
                        access: identity_jwt(1),
                        refresh: refresh_token,
                        id_token: None,
                        expires: now_ms() + 3_600_000,
                    }
                }
            })
        }
    }

    struct RecordingNotifier {
        messages: parking_lot::Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            Self {
                messages: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    impl Notify for RecordingNotifier {
        fn toast(&self, message: &str) {
            self.messages.lock().push(message.to_string());
        }
    }

    struct Fixture {
        orchestrator: FetchOrchestrator,
        notifier: Arc<RecordingNotifier>,
        refresh_calls: Arc<AtomicUsize>,
        _dir: TempDir,
    }

    fn fixture(records: Vec<AccountRecord>, config: Config, fail_refresh: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = AccountStore::new(dir.path().join("accounts.json"), None);
        let file = StoreFile {
            version: crate::auth::store::STORE_VERSION,
            accounts: records,
            active_index: 0,
            active_index_by_family: HashMap::new(),
        };
        store.save(&file).unwrap();

        let manager = Arc::new(
            AccountManager::load_from_disk(
                store,
                None,
                Arc::new(HealthTracker::new(HealthConfig::default())),
                Arc::new(TokenBucketTracker::new(TokenBucketConfig::default())),
            )
            .unwrap(),
        );
        let sink = Arc::new(TelemetrySink::new(dir.path().join("snapshots.json")));
        let notifier = Arc::new(RecordingNotifier::new());
        let refresher = FakeRefresher::new(fail_refresh);
        let refresh_calls = refresher.calls.clone();

        let orchestrator = FetchOrchestrator::new(
            manager,
            sink,
            Arc::new(refresher),
            None,
            notifier.clone(),
            config,
        );
        Fixture {
            orchestrator,
            notifier,
            refresh_calls,
            _dir: dir,
        }
    }

    fn init_for(model: &str) -> RequestInit {
        RequestInit {
            method: hyper::Method::POST,
            headers: hyper::HeaderMap::new(),
            body: Bytes::from_static(b"{}"),
            model: model.to_string(),
            prompt_cache_key: None,
            cancel: None,
        }
    }

    async fn body_json(response: Response<DispatchBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_all_accounts_limited_synthesizes_429() {
        let fx = fixture(
            vec![hydrated_record(1), hydrated_record(2)],
            Config::default(),
            false,
        );
        fx.orchestrator.manager().mark_rate_limited(0, 60_000, "codex", None);
        fx.orchestrator.manager().mark_rate_limited(1, 60_000, "codex", None);

        let response = fx
            .orchestrator
            .execute("https://upstream.invalid/responses", init_for("gpt-5.1-codex"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers()["content-type"],
            "application/json; charset=utf-8"
        );

        let body = body_json(response).await;
        let message = body["error"]["message"].as_str().unwrap();
        assert!(
            message.starts_with("All 2 account(s) unavailable. Next reset in approximately"),
            "unexpected message: {message}"
        );

        let accounts = body["error"]["accounts"].as_array().unwrap();
        assert_eq!(accounts.len(), 2);
        for account in accounts {
            assert_eq!(account["status"], "rate-limited");
        }
    }

    #[tokio::test]
    async fn test_no_accounts_synthesizes_429() {
        let fx = fixture(vec![], Config::default(), false);
        let response = fx
            .orchestrator
            .execute("https://upstream.invalid/responses", init_for("gpt-5.1-codex"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert!(
            body["error"]["message"]
                .as_str()
                .unwrap()
                .contains("No accounts configured")
        );
    }

    #[tokio::test]
    async fn test_cooldown_account_reported_in_body() {
        let fx = fixture(vec![hydrated_record(1)], Config::default(), false);
        fx.orchestrator
            .manager()
            .mark_cooling_down(0, 60_000, CooldownReason::AuthFailure);

        let response = fx
            .orchestrator
            .execute("https://upstream.invalid/responses", init_for("gpt-5.1-codex"))
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["error"]["accounts"][0]["status"], "cooldown");
    }

    #[tokio::test]
    async fn test_failed_refresh_cools_down_and_exhausts() {
        // Accounts have no access token, so the candidate path refreshes
        // synchronously; the failing refresher forces cooldown on each
        let fx = fixture(
            vec![hydrated_record(1), hydrated_record(2)],
            Config::default(),
            true,
        );

        let response = fx
            .orchestrator
            .execute("https://upstream.invalid/responses", init_for("gpt-5.1-codex"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(fx.refresh_calls.load(Ordering::SeqCst) >= 2);
        let snapshot = fx.orchestrator.manager().accounts_snapshot();
        assert!(snapshot.iter().all(|a| a.record.cooling_down_until.is_some()));
    }

    #[tokio::test]
    async fn test_session_transitions_emit_one_toast_each() {
        let fx = fixture(vec![], Config::default(), false);

        let mut init = init_for("gpt-5.1-codex");
        init.prompt_cache_key = Some("session-a".into());
        let _ = fx
            .orchestrator
            .execute("https://upstream.invalid/responses", init)
            .await;

        // Same session again: no new toast
        let mut init = init_for("gpt-5.1-codex");
        init.prompt_cache_key = Some("session-a".into());
        let _ = fx
            .orchestrator
            .execute("https://upstream.invalid/responses", init)
            .await;

        // Switch to a new session, then back
        let mut init = init_for("gpt-5.1-codex");
        init.prompt_cache_key = Some("session-b".into());
        let _ = fx
            .orchestrator
            .execute("https://upstream.invalid/responses", init)
            .await;

        let mut init = init_for("gpt-5.1-codex");
        init.prompt_cache_key = Some("session-a".into());
        let _ = fx
            .orchestrator
            .execute("https://upstream.invalid/responses", init)
            .await;

        let messages = fx.notifier.messages.lock().clone();
        let news = messages.iter().filter(|m| m.contains("new chat")).count();
        let resumes = messages.iter().filter(|m| m.contains("Resumed")).count();
        assert_eq!(news, 2, "messages: {messages:?}");
        assert_eq!(resumes, 1, "messages: {messages:?}");
    }

    #[tokio::test]
    async fn test_quiet_mode_suppresses_toasts() {
        let config = Config {
            quiet_mode: true,
            ..Config::default()
        };
        let fx = fixture(vec![], config, false);

        let mut init = init_for("gpt-5.1-codex");
        init.prompt_cache_key = Some("session-a".into());
        let _ = fx
            .orchestrator
            .execute("https://upstream.invalid/responses", init)
            .await;

        assert!(fx.notifier.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_returns_cancelled() {
        let fx = fixture(vec![hydrated_record(1)], Config::default(), false);
        fx.orchestrator.manager().mark_rate_limited(0, 60_000, "codex", None);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut init = init_for("gpt-5.1-codex");
        init.cancel = Some(cancel);

        // A pre-cancelled token wins the race against the (immediate)
        // synthesized response path often enough that both outcomes are
        // legal; assert it never hangs and maps to the right variant
        let result = fx
            .orchestrator
            .execute("https://upstream.invalid/responses", init)
            .await;
        match result {
            Err(Error::Cancelled) => {}
            Ok(response) => assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_tracker_key_shapes() {
        assert_eq!(tracker_key("codex", "gpt-5.1-codex"), "codex:gpt-5.1-codex");
        assert_eq!(tracker_key("codex", "codex"), "codex");
    }
}
