use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use crate::config::SelectionStrategy;
use crate::dispatch::health::{HealthTracker, TokenBucketTracker};
use crate::error::Result;
use crate::models::quota_keys;

use super::identity::{
    account_key, extract_account_email, extract_account_id, extract_account_plan,
};
use super::oauth::TokenResult;
use super::store::{
    AccountRecord, AccountStore, CooldownReason, StoreFile, SwitchReason, merge_stores,
};
use super::now_ms;

/// Accounts enter a penalty box this long on auth failure.
pub const AUTH_COOLDOWN_MS: u64 = 60_000;

/// Pool size ceiling; new accounts past this are rejected.
pub const MAX_ACCOUNTS: usize = 10;

/// Legacy repair runs at most this often from the wait-time path.
const REPAIR_MIN_INTERVAL_MS: u64 = 60_000;

/// Hybrid selection constants
const HYBRID_STICKINESS_BONUS: f64 = 150.0;
const HYBRID_SWITCH_THRESHOLD: f64 = 100.0;

/// Caller-facing snapshot of one pooled account.
#[derive(Debug, Clone)]
pub struct ManagedAccount {
    pub index: usize,
    pub record: AccountRecord,
    pub access: Option<String>,
    pub expires: Option<u64>,
}

impl ManagedAccount {
    /// Stable key for the health / bucket / telemetry maps
    pub fn key(&self) -> String {
        account_key(
            self.record.account_id.as_deref(),
            self.record.email.as_deref(),
            self.record.plan.as_deref(),
            Some(&self.record.refresh_token),
            Some(self.index),
        )
    }

    pub fn label(&self) -> String {
        self.record.label(self.index)
    }

    /// Fresh means present and not inside the skew window before expiry
    pub fn is_token_fresh(&self, skew_ms: u64, now: u64) -> bool {
        self.access.is_some() && self.expires.is_some_and(|exp| exp > now + skew_ms)
    }

    pub fn is_token_expired(&self, now: u64) -> bool {
        match self.expires {
            Some(exp) => exp <= now,
            None => true,
        }
    }
}

struct PoolEntry {
    record: AccountRecord,
    access: Option<String>,
    expires: Option<u64>,
}

impl PoolEntry {
    fn snapshot(&self, index: usize) -> ManagedAccount {
        ManagedAccount {
            index,
            record: self.record.clone(),
            access: self.access.clone(),
            expires: self.expires,
        }
    }
}

struct PoolState {
    accounts: Vec<PoolEntry>,
    active_index: i64,
    active_index_by_family: HashMap<String, i64>,
    /// Shared advancing cursor for sticky fallback and round-robin
    cursor: usize,
    pid_offset_applied: HashSet<String>,
    last_repair_attempt: u64,
}

impl PoolState {
    fn eligible(&self, index: usize, family: &str, model: Option<&str>, now: u64) -> bool {
        let Some(entry) = self.accounts.get(index) else {
            return false;
        };
        let record = &entry.record;
        if !record.is_hydrated() || !record.is_enabled() {
            return false;
        }
        let (base, specific) = quota_keys(family, model);
        let mut keys: Vec<&str> = vec![&base];
        if let Some(specific) = &specific {
            keys.push(specific);
        }
        !record.is_rate_limited_for(&keys, now) && !record.is_cooling_down(now)
    }

    fn family_active(&self, family: &str) -> i64 {
        self.active_index_by_family
            .get(family)
            .copied()
            .unwrap_or(self.active_index)
    }

    fn to_store_file(&self) -> StoreFile {
        StoreFile {
            version: super::store::STORE_VERSION,
            accounts: self.accounts.iter().map(|e| e.record.clone()).collect(),
            active_index: self.active_index,
            active_index_by_family: self.active_index_by_family.clone(),
        }
    }
}

/// In-memory authority over the account pool. All mutation funnels through
/// these methods; persistence goes through the store's locked merge.
pub struct AccountManager {
    store: AccountStore,
    state: Mutex<PoolState>,
    /// Per-account-index single-flight guards for refresh
    refresh_flights: Mutex<HashMap<usize, Arc<tokio::sync::Mutex<()>>>>,
    health: Arc<HealthTracker>,
    buckets: Arc<TokenBucketTracker>,
}

impl AccountManager {
    /// Read the store; when a fallback OAuth result carries a hydrated
    /// identity not present on disk, append it and persist.
    pub fn load_from_disk(
        store: AccountStore,
        fallback_auth: Option<&TokenResult>,
        health: Arc<HealthTracker>,
        buckets: Arc<TokenBucketTracker>,
    ) -> Result<Self> {
        let file = store.load()?.unwrap_or_default();

        let mut accounts: Vec<PoolEntry> = file
            .accounts
            .into_iter()
            .map(|record| PoolEntry {
                record,
                access: None,
                expires: None,
            })
            .collect();
        let mut active_index = file.active_index;
        let active_index_by_family = file.active_index_by_family;

        let mut appended = false;
        if let Some(TokenResult::Success {
            access,
            refresh,
            id_token,
            expires,
        }) = fallback_auth
        {
            let record = record_from_tokens(refresh, access, id_token.as_deref());
            let known = accounts.iter().any(|e| {
                e.record.identity_matches(&record) || e.record.refresh_token == record.refresh_token
            });
            if record.is_hydrated() && !known {
                if accounts.len() >= MAX_ACCOUNTS {
                    tracing::warn!(
                        max = MAX_ACCOUNTS,
                        "account pool is full, not adding another"
                    );
                } else {
                    tracing::info!(email = record.email.as_deref().unwrap_or("?"), "appending fallback account");
                    accounts.push(PoolEntry {
                        record,
                        access: Some(access.clone()),
                        expires: Some(*expires),
                    });
                    if active_index < 0 {
                        active_index = (accounts.len() - 1) as i64;
                    }
                    appended = true;
                }
            }
        }

        let manager = Self {
            store,
            state: Mutex::new(PoolState {
                accounts,
                active_index,
                active_index_by_family,
                cursor: active_index.max(0) as usize,
                pid_offset_applied: HashSet::new(),
                last_repair_attempt: 0,
            }),
            refresh_flights: Mutex::new(HashMap::new()),
            health,
            buckets,
        };

        if appended {
            manager.save_to_disk()?;
        }
        Ok(manager)
    }

    /// Hydrated AND enabled records only
    pub fn account_count(&self) -> usize {
        let state = self.state.lock();
        state
            .accounts
            .iter()
            .filter(|e| e.record.is_hydrated() && e.record.is_enabled())
            .count()
    }

    pub fn total_records(&self) -> usize {
        self.state.lock().accounts.len()
    }

    pub fn has_legacy_records(&self) -> bool {
        let state = self.state.lock();
        state
            .accounts
            .iter()
            .any(|e| !e.record.is_hydrated() && e.record.is_enabled())
    }

    pub fn accounts_snapshot(&self) -> Vec<ManagedAccount> {
        let state = self.state.lock();
        state
            .accounts
            .iter()
            .enumerate()
            .map(|(i, e)| e.snapshot(i))
            .collect()
    }

    pub fn account_at(&self, index: usize) -> Option<ManagedAccount> {
        let state = self.state.lock();
        state.accounts.get(index).map(|e| e.snapshot(index))
    }

    /// Selection entry point. See the strategy docs on `SelectionStrategy`.
    pub fn current_or_next_for_family(
        &self,
        family: &str,
        model: Option<&str>,
        strategy: SelectionStrategy,
        pid_offset_enabled: bool,
    ) -> Option<ManagedAccount> {
        let mut state = self.state.lock();
        let now = now_ms();
        let n = state.accounts.len();
        if n == 0 {
            return None;
        }

        // Decorrelate parallel workers started by the same user: rotate the
        // family's starting index by pid once per family per process
        if pid_offset_enabled
            && strategy != SelectionStrategy::Hybrid
            && n > 1
            && !state.pid_offset_applied.contains(family)
        {
            state.pid_offset_applied.insert(family.to_string());
            let offset = (std::process::id() as usize) % n;
            if offset > 0 {
                let base = state.family_active(family).max(0) as usize;
                let rotated = ((base + offset) % n) as i64;
                state
                    .active_index_by_family
                    .insert(family.to_string(), rotated);
                tracing::debug!(family = %family, offset = offset, "applied pid offset");
            }
        }

        if strategy == SelectionStrategy::Hybrid
            && let Some(account) = self.select_hybrid(&mut state, family, model, now)
        {
            return Some(account);
        }

        match strategy {
            SelectionStrategy::RoundRobin => self.select_round_robin(&mut state, family, model, now),
            // Hybrid falls through to sticky when no candidate qualifies
            _ => self.select_sticky(&mut state, family, model, now),
        }
    }

    fn select_sticky(
        &self,
        state: &mut PoolState,
        family: &str,
        model: Option<&str>,
        now: u64,
    ) -> Option<ManagedAccount> {
        let current = state.family_active(family);
        if current >= 0 && state.eligible(current as usize, family, model, now) {
            let idx = current as usize;
            return Some(state.accounts[idx].snapshot(idx));
        }

        self.advance_cursor(state, family, model, now)
    }

    fn select_round_robin(
        &self,
        state: &mut PoolState,
        family: &str,
        model: Option<&str>,
        now: u64,
    ) -> Option<ManagedAccount> {
        self.advance_cursor(state, family, model, now)
    }

    /// Advance the shared cursor to the next eligible account.
    fn advance_cursor(
        &self,
        state: &mut PoolState,
        family: &str,
        model: Option<&str>,
        now: u64,
    ) -> Option<ManagedAccount> {
        let n = state.accounts.len();
        for step in 1..=n {
            let idx = (state.cursor + step) % n;
            if state.eligible(idx, family, model, now) {
                state.cursor = idx;
                state
                    .active_index_by_family
                    .insert(family.to_string(), idx as i64);
                return Some(state.accounts[idx].snapshot(idx));
            }
        }
        None
    }

    /// Score-based selection. Falls back to sticky by returning None.
    fn select_hybrid(
        &self,
        state: &mut PoolState,
        family: &str,
        model: Option<&str>,
        now: u64,
    ) -> Option<ManagedAccount> {
        let current = state.family_active(family);

        struct Candidate {
            index: usize,
            base_score: f64,
        }

        let mut candidates: Vec<Candidate> = Vec::new();
        for (index, entry) in state.accounts.iter().enumerate() {
            let record = &entry.record;
            if !record.is_hydrated() || !record.is_enabled() {
                continue;
            }
            if !state.eligible(index, family, model, now) {
                continue;
            }

            let key = entry.snapshot(index).key();
            if !self.health.is_usable(&key) || !self.buckets.has_tokens(&key) {
                continue;
            }
            let health = self.health.score(&key);

            let tokens_ratio = self.buckets.ratio(&key);
            let seconds_since_used = if record.last_used == 0 {
                3600.0
            } else {
                ((now.saturating_sub(record.last_used)) as f64 / 1000.0).min(3600.0)
            };
            let base_score = health * 2.0 + tokens_ratio * 500.0 + seconds_since_used * 0.1;
            candidates.push(Candidate { index, base_score });
        }

        if candidates.is_empty() {
            return None;
        }

        let current_candidate = candidates
            .iter()
            .find(|c| current >= 0 && c.index == current as usize);
        let best_other = candidates
            .iter()
            .filter(|c| current < 0 || c.index != current as usize)
            .max_by(|a, b| {
                a.base_score
                    .partial_cmp(&b.base_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

        let chosen = match (current_candidate, best_other) {
            // The current account carries a stickiness bonus, and a
            // challenger must also clear the switch threshold on base
            // score; near-ties stay on the cache-warm account
            (Some(cur), Some(other)) => {
                let current_total = cur.base_score + HYBRID_STICKINESS_BONUS;
                if other.base_score > current_total
                    && other.base_score - cur.base_score >= HYBRID_SWITCH_THRESHOLD
                {
                    other.index
                } else {
                    cur.index
                }
            }
            (Some(cur), None) => cur.index,
            (None, Some(other)) => other.index,
            (None, None) => return None,
        };

        state
            .active_index_by_family
            .insert(family.to_string(), chosen as i64);
        Some(state.accounts[chosen].snapshot(chosen))
    }

    pub fn mark_used(&self, index: usize) {
        let mut state = self.state.lock();
        if let Some(entry) = state.accounts.get_mut(index) {
            entry.record.last_used = now_ms();
        }
    }

    /// Record a switch onto `index` for this family.
    pub fn mark_switched(&self, index: usize, reason: SwitchReason, family: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.accounts.get_mut(index) {
            entry.record.last_switch_reason = Some(reason);
        }
        state
            .active_index_by_family
            .insert(family.to_string(), index as i64);
        state.active_index = index as i64;
        state.cursor = index;
    }

    /// Record a rate limit on both the family key and, when the model is
    /// more specific, the family:model key.
    pub fn mark_rate_limited(&self, index: usize, delay_ms: u64, family: &str, model: Option<&str>) {
        let until = now_ms() + delay_ms;
        let (base, specific) = quota_keys(family, model);
        let mut state = self.state.lock();
        if let Some(entry) = state.accounts.get_mut(index) {
            let resets = &mut entry.record.rate_limit_reset_times;
            let slot = resets.entry(base).or_insert(0);
            *slot = (*slot).max(until);
            if let Some(specific) = specific {
                let slot = resets.entry(specific).or_insert(0);
                *slot = (*slot).max(until);
            }
        }
    }

    pub fn mark_cooling_down(&self, index: usize, ms: u64, reason: CooldownReason) {
        let until = now_ms() + ms;
        let mut state = self.state.lock();
        if let Some(entry) = state.accounts.get_mut(index) {
            entry.record.cooling_down_until = Some(until);
            entry.record.cooldown_reason = Some(reason);
            tracing::debug!(index = index, ms = ms, "account cooling down");
        }
    }

    /// Single-flight token refresh for one account. Concurrent callers
    /// block on the same flight and observe its outcome. On failure the
    /// store is re-read and the refresh retried with the latest on-disk
    /// token, which defeats races with sibling processes that rotated it.
    pub async fn refresh_with_fallback<F, Fut>(
        &self,
        index: usize,
        skew_ms: u64,
        refresh_fn: F,
    ) -> TokenResult
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = TokenResult>,
    {
        let flight = {
            let mut flights = self.refresh_flights.lock();
            flights
                .entry(index)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = flight.lock().await;

        // A concurrent flight may have refreshed while we waited
        let now = now_ms();
        let (refresh_token, fresh) = {
            let state = self.state.lock();
            let Some(entry) = state.accounts.get(index) else {
                return TokenResult::Failed {
                    reason: format!("account index {index} no longer exists"),
                };
            };
            let snapshot = entry.snapshot(index);
            if snapshot.is_token_fresh(skew_ms, now) {
                (
                    entry.record.refresh_token.clone(),
                    Some(TokenResult::Success {
                        access: snapshot.access.clone().unwrap_or_default(),
                        refresh: entry.record.refresh_token.clone(),
                        id_token: None,
                        expires: snapshot.expires.unwrap_or(0),
                    }),
                )
            } else {
                (entry.record.refresh_token.clone(), None)
            }
        };
        if let Some(cached) = fresh {
            return cached;
        }

        let result = refresh_fn(refresh_token.clone()).await;
        if let TokenResult::Success { .. } = &result {
            self.adopt_refresh(index, &result);
            let _ = self.save_to_disk();
            return result;
        }

        // Reload and retry with whatever token a sibling process persisted
        let disk_token = self
            .store
            .load()
            .ok()
            .flatten()
            .and_then(|file| {
                let state = self.state.lock();
                let entry = state.accounts.get(index)?;
                file.accounts
                    .iter()
                    .find(|r| {
                        r.identity_matches(&entry.record)
                            || r.refresh_token == entry.record.original_refresh_token
                    })
                    .map(|r| r.refresh_token.clone())
            })
            .filter(|token| *token != refresh_token);

        if let Some(disk_token) = disk_token {
            tracing::info!(index = index, "retrying refresh with newer on-disk token");
            let retry = refresh_fn(disk_token).await;
            if let TokenResult::Success { .. } = &retry {
                self.adopt_refresh(index, &retry);
                let _ = self.save_to_disk();
                return retry;
            }
        }

        result
    }

    /// Fold a successful refresh into the pool entry, filling identity
    /// fields the claims now provide.
    fn adopt_refresh(&self, index: usize, result: &TokenResult) {
        let TokenResult::Success {
            access,
            refresh,
            id_token,
            expires,
        } = result
        else {
            return;
        };

        let mut state = self.state.lock();
        let Some(entry) = state.accounts.get_mut(index) else {
            return;
        };
        entry.access = Some(access.clone());
        entry.expires = Some(*expires);
        entry.record.refresh_token = refresh.clone();

        let identity_source = id_token.as_deref().unwrap_or(access);
        if entry.record.account_id.is_none() {
            entry.record.account_id = extract_account_id(identity_source)
                .or_else(|| extract_account_id(access));
        }
        if entry.record.email.is_none() {
            entry.record.email = extract_account_email(identity_source)
                .or_else(|| extract_account_email(access));
        }
        if entry.record.plan.is_none() {
            entry.record.plan = extract_account_plan(identity_source)
                .or_else(|| extract_account_plan(access));
        }
        // Refresh succeeded: the cooldown no longer applies
        entry.record.cooling_down_until = None;
        entry.record.cooldown_reason = None;
    }

    /// Attempt to hydrate every enabled legacy record via refresh;
    /// quarantine the unrepairable. Persists only when something changed.
    pub async fn repair_legacy<F, Fut>(&self, refresh_fn: F) -> RepairOutcome
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = TokenResult>,
    {
        let legacy: Vec<(usize, String)> = {
            let state = self.state.lock();
            state
                .accounts
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.record.is_hydrated() && e.record.is_enabled())
                .map(|(i, e)| (i, e.record.refresh_token.clone()))
                .collect()
        };

        let mut outcome = RepairOutcome::default();
        if legacy.is_empty() {
            return outcome;
        }

        for (index, refresh_token) in legacy {
            let result = refresh_fn(refresh_token).await;
            let repaired = match &result {
                TokenResult::Success {
                    access, id_token, ..
                } => {
                    let source = id_token.as_deref().unwrap_or(access);
                    let account_id =
                        extract_account_id(source).or_else(|| extract_account_id(access));
                    let email =
                        extract_account_email(source).or_else(|| extract_account_email(access));
                    let plan =
                        extract_account_plan(source).or_else(|| extract_account_plan(access));

                    let id_consistent = {
                        let state = self.state.lock();
                        match (
                            state.accounts.get(index).and_then(|e| e.record.account_id.as_ref()),
                            account_id.as_ref(),
                        ) {
                            (Some(existing), Some(derived)) => existing == derived,
                            _ => true,
                        }
                    };

                    if account_id.is_some() && email.is_some() && plan.is_some() && id_consistent {
                        self.adopt_refresh(index, &result);
                        let mut state = self.state.lock();
                        if let Some(entry) = state.accounts.get_mut(index) {
                            entry.record.account_id = account_id;
                            entry.record.email = email;
                            entry.record.plan = plan;
                        }
                        true
                    } else {
                        false
                    }
                }
                TokenResult::Failed { .. } => false,
            };

            if repaired {
                outcome.repaired.push(index);
            } else {
                outcome.quarantined.push(index);
            }
        }

        // Quarantine the failures and drop them from the pool, highest
        // index first so earlier removals do not shift later ones
        let mut doomed_tokens: HashSet<String> = HashSet::new();
        if !outcome.quarantined.is_empty() {
            let mut doomed = outcome.quarantined.clone();
            doomed.sort_unstable_by(|a, b| b.cmp(a));
            let mut records = Vec::new();
            {
                let mut state = self.state.lock();
                for index in doomed {
                    if index < state.accounts.len() {
                        records.push(state.accounts.remove(index).record);
                        let len = state.accounts.len() as i64;
                        if state.active_index >= len {
                            state.active_index = len - 1;
                        }
                        for idx in state.active_index_by_family.values_mut() {
                            if *idx >= len {
                                *idx = len - 1;
                            }
                        }
                        if state.cursor >= state.accounts.len() && !state.accounts.is_empty() {
                            state.cursor = state.accounts.len() - 1;
                        }
                    }
                }
            }
            doomed_tokens = records.iter().map(|r| r.refresh_token.clone()).collect();
            if let Err(e) = self.store.quarantine(&records, "unrepairable-legacy") {
                tracing::warn!(error = %e, "failed to quarantine unrepairable records");
            }
        }

        if !outcome.repaired.is_empty() || !outcome.quarantined.is_empty() {
            tracing::info!(
                repaired = outcome.repaired.len(),
                quarantined = outcome.quarantined.len(),
                "legacy repair finished"
            );
            // A merge-based save would resurrect the quarantined records
            // from disk; strip them from the disk state first
            let snapshot = {
                let state = self.state.lock();
                state.to_store_file()
            };
            let save_result = self.save_to_disk_with(move |latest| {
                let mut base = latest.unwrap_or_default();
                base.accounts
                    .retain(|r| !doomed_tokens.contains(&r.refresh_token));
                merge_stores(base, &snapshot)
            });
            if let Err(e) = save_result {
                tracing::warn!(error = %e, "failed to persist post-repair state");
            }
        }
        outcome
    }

    /// Remove an account by pool index. The deletion goes through a locked
    /// transform so the merge path cannot resurrect the record.
    pub fn remove_account(&self, index: usize) -> Result<AccountRecord> {
        let (removed, snapshot) = {
            let mut state = self.state.lock();
            let max = state.accounts.len();
            if index >= max {
                return Err(crate::error::StoreError::IndexOutOfRange {
                    index: index + 1,
                    max,
                }
                .into());
            }
            let removed = state.accounts.remove(index).record;
            let len = state.accounts.len() as i64;
            if state.active_index >= len {
                state.active_index = len - 1;
            }
            for idx in state.active_index_by_family.values_mut() {
                if *idx >= len {
                    *idx = len - 1;
                }
            }
            if state.cursor >= state.accounts.len() && !state.accounts.is_empty() {
                state.cursor = state.accounts.len() - 1;
            }
            (removed, state.to_store_file())
        };

        let doomed = removed.refresh_token.clone();
        self.save_to_disk_with(move |latest| {
            let mut base = latest.unwrap_or_default();
            base.accounts.retain(|r| r.refresh_token != doomed);
            merge_stores(base, &snapshot)
        })?;
        Ok(removed)
    }

    /// Make `index` the active account everywhere: the default index and
    /// every family override. Persists the change.
    pub fn set_active(&self, index: usize) -> Result<ManagedAccount> {
        let snapshot = {
            let mut state = self.state.lock();
            let max = state.accounts.len();
            if index >= max {
                return Err(crate::error::StoreError::IndexOutOfRange {
                    index: index + 1,
                    max,
                }
                .into());
            }
            state.active_index = index as i64;
            state.cursor = index;
            let families: Vec<String> = state.active_index_by_family.keys().cloned().collect();
            for family in families {
                state.active_index_by_family.insert(family, index as i64);
            }
            if let Some(entry) = state.accounts.get_mut(index) {
                entry.record.last_switch_reason = Some(SwitchReason::Rotation);
            }
            state.accounts[index].snapshot(index)
        };
        self.save_to_disk()?;
        Ok(snapshot)
    }

    /// Flip an account's enabled flag; returns the new state.
    pub fn toggle_enabled(&self, index: usize) -> Result<bool> {
        let next = {
            let mut state = self.state.lock();
            let max = state.accounts.len();
            let entry = state.accounts.get_mut(index).ok_or(
                crate::error::StoreError::IndexOutOfRange {
                    index: index + 1,
                    max,
                },
            )?;
            let next = !entry.record.is_enabled();
            entry.record.enabled = Some(next);
            next
        };

        let snapshot = {
            let state = self.state.lock();
            state.to_store_file()
        };
        self.save_to_disk_with(move |latest| {
            let mut base = latest.unwrap_or_default();
            // The toggle must win over the disk state even when the disk
            // side already recorded a value
            if let Some(cand) = snapshot.accounts.get(index) {
                if let Some(disk) = base
                    .accounts
                    .iter_mut()
                    .find(|r| r.identity_matches(cand) || r.refresh_token == cand.refresh_token)
                {
                    disk.enabled = cand.enabled;
                }
            }
            merge_stores(base, &snapshot)
        })?;
        Ok(next)
    }

    /// 0 when any hydrated, enabled account is eligible for this family;
    /// otherwise the minimum remaining reset/cooldown across the pool.
    pub fn min_wait_time_for_family(&self, family: &str, model: Option<&str>) -> u64 {
        let state = self.state.lock();
        let now = now_ms();
        let (base, specific) = quota_keys(family, model);
        let mut keys: Vec<&str> = vec![&base];
        if let Some(specific) = &specific {
            keys.push(specific);
        }

        let mut min_wait: Option<u64> = None;
        for entry in &state.accounts {
            let record = &entry.record;
            if !record.is_hydrated() || !record.is_enabled() {
                continue;
            }
            let limit_ms = record.rate_limit_remaining_ms(&keys, now);
            let cooldown_ms = record
                .cooling_down_until
                .filter(|until| *until > now)
                .map(|until| until - now)
                .unwrap_or(0);
            let wait = limit_ms.max(cooldown_ms);
            if wait == 0 {
                return 0;
            }
            min_wait = Some(min_wait.map_or(wait, |m| m.min(wait)));
        }
        min_wait.unwrap_or(0)
    }

    /// Wait-time variant that first runs a legacy repair, rate-limited to
    /// once per minute, so a pool of un-hydrated records can recover.
    pub async fn min_wait_time_for_family_repairing<F, Fut>(
        &self,
        family: &str,
        model: Option<&str>,
        refresh_fn: F,
    ) -> u64
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = TokenResult>,
    {
        let should_repair = {
            let mut state = self.state.lock();
            let now = now_ms();
            let has_legacy = state
                .accounts
                .iter()
                .any(|e| !e.record.is_hydrated() && e.record.is_enabled());
            if has_legacy && now.saturating_sub(state.last_repair_attempt) >= REPAIR_MIN_INTERVAL_MS
            {
                state.last_repair_attempt = now;
                true
            } else {
                false
            }
        };

        if should_repair {
            let _ = self.repair_legacy(refresh_fn).await;
        }
        self.min_wait_time_for_family(family, model)
    }

    /// Persist the in-memory snapshot through the store's locked merge,
    /// then adopt the merged result (a sibling process may have added or
    /// reordered accounts).
    pub fn save_to_disk(&self) -> Result<()> {
        let snapshot = {
            let state = self.state.lock();
            state.to_store_file()
        };
        let merged = self.store.save(&snapshot)?;
        self.adopt_merged(merged);
        Ok(())
    }

    /// Run a transform over the latest on-disk state under the lock.
    pub fn save_to_disk_with<F>(&self, transform: F) -> Result<()>
    where
        F: FnOnce(Option<StoreFile>) -> StoreFile,
    {
        let merged = self.store.save_with_lock(transform)?;
        self.adopt_merged(merged);
        Ok(())
    }

    fn adopt_merged(&self, merged: StoreFile) {
        let mut state = self.state.lock();

        // Carry live access tokens across by refresh token or identity
        let mut entries: Vec<PoolEntry> = Vec::with_capacity(merged.accounts.len());
        for record in merged.accounts {
            let live = state.accounts.iter().find(|e| {
                e.record.refresh_token == record.refresh_token
                    || e.record.identity_matches(&record)
            });
            entries.push(PoolEntry {
                access: live.and_then(|e| e.access.clone()),
                expires: live.and_then(|e| e.expires),
                record,
            });
        }
        state.accounts = entries;
        state.active_index = merged.active_index;
        state.active_index_by_family = merged.active_index_by_family;
        if state.cursor >= state.accounts.len() {
            state.cursor = state.accounts.len().saturating_sub(1);
        }
    }

    pub fn store(&self) -> &AccountStore {
        &self.store
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn buckets(&self) -> &Arc<TokenBucketTracker> {
        &self.buckets
    }
}

#[derive(Debug, Default)]
pub struct RepairOutcome {
    pub repaired: Vec<usize>,
    pub quarantined: Vec<usize>,
}

/// Build an account record from a token response, hydrating identity from
/// the id token first, then the access token.
pub fn record_from_tokens(refresh: &str, access: &str, id_token: Option<&str>) -> AccountRecord {
    let mut record = AccountRecord::new(refresh.to_string());
    let source = id_token.unwrap_or(access);
    record.account_id = extract_account_id(source).or_else(|| extract_account_id(access));
    record.email = extract_account_email(source).or_else(|| extract_account_email(access));
    record.plan = extract_account_plan(source).or_else(|| extract_account_plan(access));
    record.last_switch_reason = Some(SwitchReason::Initial);
    record
}
