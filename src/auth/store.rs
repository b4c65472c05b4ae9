use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;
use crate::error::{Result, StoreError};

use super::now_ms;

pub const STORE_VERSION: u32 = 3;

/// Advisory-lock acquisition gives up after this long.
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Newest quarantine files kept alongside the store.
const QUARANTINE_RETENTION: usize = 20;

/// Why the dispatcher last moved off an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SwitchReason {
    RateLimit,
    Initial,
    Rotation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CooldownReason {
    AuthFailure,
}

/// A single persisted account. The refresh token is the only field that
/// identifies a newly-received account before its claims are decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    /// None means "never recorded", which reads as enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub added_at: u64,
    #[serde(default)]
    pub last_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_switch_reason: Option<SwitchReason>,
    /// Quota key (family or family:model) -> epoch-ms reset time
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub rate_limit_reset_times: HashMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooling_down_until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_reason: Option<CooldownReason>,

    /// Refresh token as last read from disk; detects whether a rotated
    /// token needs writing back. Never persisted.
    #[serde(skip)]
    pub original_refresh_token: String,
}

impl AccountRecord {
    pub fn new(refresh_token: String) -> Self {
        Self {
            original_refresh_token: refresh_token.clone(),
            refresh_token,
            account_id: None,
            email: None,
            plan: None,
            enabled: None,
            added_at: now_ms(),
            last_used: 0,
            last_switch_reason: None,
            rate_limit_reset_times: HashMap::new(),
            cooling_down_until: None,
            cooldown_reason: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// All three identity fields known
    pub fn is_hydrated(&self) -> bool {
        self.account_id.is_some() && self.email.is_some() && self.plan.is_some()
    }

    pub fn identity_matches(&self, other: &AccountRecord) -> bool {
        self.is_hydrated()
            && other.is_hydrated()
            && self.account_id == other.account_id
            && self.email.as_deref().map(str::to_lowercase)
                == other.email.as_deref().map(str::to_lowercase)
            && self.plan == other.plan
    }

    pub fn clear_expired_rate_limits(&mut self, now: u64) {
        self.rate_limit_reset_times.retain(|_, reset| *reset > now);
    }

    pub fn is_cooling_down(&self, now: u64) -> bool {
        self.cooling_down_until.is_some_and(|until| until > now)
    }

    /// Longest remaining reset across the given quota keys, 0 if none apply
    pub fn rate_limit_remaining_ms(&self, keys: &[&str], now: u64) -> u64 {
        keys.iter()
            .filter_map(|k| self.rate_limit_reset_times.get(*k))
            .filter(|reset| **reset > now)
            .map(|reset| reset - now)
            .max()
            .unwrap_or(0)
    }

    pub fn is_rate_limited_for(&self, keys: &[&str], now: u64) -> bool {
        self.rate_limit_remaining_ms(keys, now) > 0
    }

    /// Display label for status output: email, or a positional fallback
    pub fn label(&self, index: usize) -> String {
        self.email
            .clone()
            .unwrap_or_else(|| format!("account {}", index + 1))
    }
}

fn default_version() -> u32 {
    STORE_VERSION
}

fn default_active_index() -> i64 {
    -1
}

/// The persisted pool. Insertion order is the user-visible 1-based index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub accounts: Vec<AccountRecord>,
    #[serde(default = "default_active_index")]
    pub active_index: i64,
    #[serde(default)]
    pub active_index_by_family: HashMap<String, i64>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            accounts: Vec::new(),
            active_index: -1,
            active_index_by_family: HashMap::new(),
        }
    }
}

impl StoreFile {
    fn valid_index(&self, index: i64) -> bool {
        index >= 0 && (index as usize) < self.accounts.len()
    }

    /// Clamp both active indices into range (or -1 when empty)
    fn clamp_indices(&mut self) {
        let len = self.accounts.len() as i64;
        let clamp = |idx: i64| -> i64 {
            if len == 0 {
                -1
            } else if idx < 0 {
                idx.max(-1)
            } else {
                idx.min(len - 1)
            }
        };
        self.active_index = clamp(self.active_index);
        for idx in self.active_index_by_family.values_mut() {
            *idx = clamp(*idx);
        }
    }

}

/// Parse-and-classify result, no mutation
#[derive(Debug, PartialEq, Eq)]
pub enum InspectReport {
    Ok,
    CorruptFile,
    NeedsRepair {
        /// Indices of records missing part of the identity triple
        legacy: Vec<usize>,
        corrupt_entries: usize,
    },
}

/// Durable, locked, merge-safe persistence of the account pool.
pub struct AccountStore {
    path: PathBuf,
    legacy_path: Option<PathBuf>,
}

impl AccountStore {
    pub fn new(path: PathBuf, legacy_path: Option<PathBuf>) -> Self {
        Self { path, legacy_path }
    }

    pub fn at_default_location() -> Self {
        Self::new(
            Config::accounts_path(),
            Some(Config::legacy_accounts_path()),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current state: dedup'd, index-remapped, past reset times
    /// cleared. Returns None when no store exists yet. A file that cannot
    /// be parsed at all is quarantined and reset.
    pub fn load(&self) -> Result<Option<StoreFile>> {
        self.migrate_legacy()?;

        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() || content.trim() == "[]" {
            return Ok(None);
        }

        let value: serde_json::Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "account store unparseable, quarantining");
                self.auto_quarantine_corrupt().map_err(|q| {
                    StoreError::Corrupt(format!("{e}; quarantine also failed: {q}"))
                })?;
                return Ok(None);
            }
        };

        let (mut store, corrupt) = coerce_store(value);
        if !corrupt.is_empty() {
            tracing::warn!(count = corrupt.len(), "quarantining corrupt account entries");
            let _ = self.quarantine_values(&corrupt, "corrupt-entry");
        }

        normalize_store(&mut store);
        tracing::info!(
            count = store.accounts.len(),
            "loaded account store from {}",
            self.path.display()
        );
        Ok(Some(store))
    }

    /// Parse and classify the on-disk state without mutating it.
    pub fn inspect(&self) -> InspectReport {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return InspectReport::Ok,
        };
        if content.trim().is_empty() || content.trim() == "[]" {
            return InspectReport::Ok;
        }

        let value: serde_json::Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(_) => return InspectReport::CorruptFile,
        };

        let (store, corrupt) = coerce_store(value);
        let legacy: Vec<usize> = store
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.is_hydrated())
            .map(|(i, _)| i)
            .collect();

        if legacy.is_empty() && corrupt.is_empty() {
            InspectReport::Ok
        } else {
            InspectReport::NeedsRepair {
                legacy,
                corrupt_entries: corrupt.len(),
            }
        }
    }

    /// Merge-aware save: the canonical "write my snapshot" path.
    pub fn save(&self, store: &StoreFile) -> Result<StoreFile> {
        let candidate = store.clone();
        self.save_with_lock(move |latest| match latest {
            Some(disk) => merge_stores(disk, &candidate),
            None => candidate,
        })
    }

    /// Run a caller-supplied transform on the latest on-disk state while
    /// the file is exclusively locked, then write the result atomically.
    /// The canonical primitive for partial updates.
    pub fn save_with_lock<F>(&self, transform: F) -> Result<StoreFile>
    where
        F: FnOnce(Option<StoreFile>) -> StoreFile,
    {
        let lock = self.acquire_lock()?;

        let latest = self.read_unlocked();
        let mut result = transform(latest);
        result.version = STORE_VERSION;
        normalize_store(&mut result);

        self.write_snapshot(&result)?;
        drop(lock);
        Ok(result)
    }

    /// Copy the selected records into a timestamped sibling file.
    pub fn quarantine(&self, records: &[AccountRecord], reason: &str) -> Result<PathBuf> {
        let values: Vec<serde_json::Value> = records
            .iter()
            .map(|r| serde_json::to_value(r).unwrap_or(serde_json::Value::Null))
            .collect();
        self.quarantine_values(&values, reason)
    }

    fn quarantine_values(&self, values: &[serde_json::Value], reason: &str) -> Result<PathBuf> {
        let path = self.quarantine_path();
        let payload = serde_json::json!({
            "reason": reason,
            "quarantinedAt": now_ms(),
            "records": values,
        });
        write_private(&path, serde_json::to_string_pretty(&payload)?.as_bytes())?;
        self.prune_quarantine_files();
        tracing::warn!(path = %path.display(), reason = %reason, "quarantined account records");
        Ok(path)
    }

    /// On load failure: shunt the raw bytes aside and reset storage.
    pub fn auto_quarantine_corrupt(&self) -> Result<PathBuf> {
        let quarantine = self.quarantine_path();
        let bytes = std::fs::read(&self.path).unwrap_or_default();
        write_private(&quarantine, &bytes)?;
        self.prune_quarantine_files();
        write_private(&self.path, b"[]")?;
        Ok(quarantine)
    }

    fn quarantine_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "accounts.json".to_string());
        self.path
            .with_file_name(format!("{name}.quarantine-{}.json", now_ms()))
    }

    fn prune_quarantine_files(&self) {
        let Some(dir) = self.path.parent() else { return };
        let Some(name) = self.path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return;
        };
        let prefix = format!("{name}.quarantine-");

        let Ok(entries) = std::fs::read_dir(dir) else { return };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();

        if files.len() <= QUARANTINE_RETENTION {
            return;
        }
        // Timestamped names sort chronologically; oldest first
        files.sort();
        let excess = files.len() - QUARANTINE_RETENTION;
        for stale in files.into_iter().take(excess) {
            let _ = std::fs::remove_file(stale);
        }
    }

    /// One-shot move of the pre-XDG store into the current location,
    /// merge-on-conflict, inside the same lock scope as the write.
    fn migrate_legacy(&self) -> Result<()> {
        let Some(legacy) = &self.legacy_path else {
            return Ok(());
        };
        if !legacy.exists() {
            return Ok(());
        }

        let lock = self.acquire_lock()?;

        // Re-check under the lock: a sibling process may have migrated
        if !legacy.exists() {
            return Ok(());
        }

        let legacy_content = std::fs::read_to_string(legacy)?;
        let migrated = match serde_json::from_str::<serde_json::Value>(&legacy_content) {
            Ok(value) => {
                let (mut legacy_store, _corrupt) = coerce_store(value);
                normalize_store(&mut legacy_store);
                let mut merged = match self.read_unlocked() {
                    Some(disk) => merge_stores(disk, &legacy_store),
                    None => legacy_store,
                };
                normalize_store(&mut merged);
                self.write_snapshot(&merged)?;
                true
            }
            Err(e) => {
                tracing::warn!(path = %legacy.display(), error = %e, "legacy store unparseable, skipping migration");
                false
            }
        };

        if migrated {
            tracing::info!(from = %legacy.display(), to = %self.path.display(), "migrated legacy account store");
        }
        // Rename regardless so a broken legacy file is not re-parsed forever
        let _ = std::fs::rename(legacy, legacy.with_extension("json.migrated"));
        drop(lock);
        Ok(())
    }

    /// Raw read without locking or normalization side effects; callers
    /// holding the lock use this for the read half of read-modify-write.
    fn read_unlocked(&self) -> Option<StoreFile> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        if content.trim().is_empty() || content.trim() == "[]" {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(&content).ok()?;
        let (mut store, _corrupt) = coerce_store(value);
        normalize_store(&mut store);
        Some(store)
    }

    /// Acquire the advisory lock, creating the target with `[]` first when
    /// absent. Bounded retry; gives up after LOCK_TIMEOUT.
    fn acquire_lock(&self) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !self.path.exists() {
            write_private(&self.path, b"[]")?;
        }

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;

        let deadline = std::time::Instant::now() + LOCK_TIMEOUT;
        loop {
            if file.try_lock_exclusive().is_ok() {
                return Ok(LockGuard { file });
            }
            if std::time::Instant::now() >= deadline {
                return Err(StoreError::LockTimeout(LOCK_TIMEOUT).into());
            }
            std::thread::sleep(LOCK_RETRY_INTERVAL);
        }
    }

    /// Atomic temp-file + rename write, best-effort 0600.
    fn write_snapshot(&self, store: &StoreFile) -> Result<()> {
        let json = serde_json::to_string_pretty(store)?;
        let tmp = self.path.with_extension("json.tmp");

        let write_result = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            restrict_permissions(&tmp);
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        restrict_permissions(&self.path);
        Ok(())
    }
}

/// Held while the store file is exclusively locked
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    restrict_permissions(path);
    Ok(())
}

/// Coerce any of the three accepted on-disk shapes to v3. Returns the
/// store plus any entries that did not parse as accounts.
fn coerce_store(value: serde_json::Value) -> (StoreFile, Vec<serde_json::Value>) {
    let mut corrupt = Vec::new();

    let parse_accounts = |entries: Vec<serde_json::Value>, corrupt: &mut Vec<serde_json::Value>| {
        let mut accounts = Vec::new();
        for entry in entries {
            match serde_json::from_value::<AccountRecord>(entry.clone()) {
                Ok(record) if !record.refresh_token.is_empty() => accounts.push(record),
                _ => corrupt.push(entry),
            }
        }
        accounts
    };

    let store = match value {
        // Bare array of accounts
        serde_json::Value::Array(entries) => {
            let accounts = parse_accounts(entries, &mut corrupt);
            let active_index = if accounts.is_empty() { -1 } else { 0 };
            StoreFile {
                version: STORE_VERSION,
                accounts,
                active_index,
                active_index_by_family: HashMap::new(),
            }
        }
        // Versioned or versionless object with an accounts list
        serde_json::Value::Object(mut map) => {
            let entries = match map.remove("accounts") {
                Some(serde_json::Value::Array(entries)) => entries,
                _ => Vec::new(),
            };
            let accounts = parse_accounts(entries, &mut corrupt);

            let active_index = map
                .get("activeIndex")
                .and_then(|v| v.as_i64())
                .unwrap_or(if accounts.is_empty() { -1 } else { 0 });
            let active_index_by_family = map
                .get("activeIndexByFamily")
                .and_then(|v| v.as_object())
                .map(|obj| {
                    obj.iter()
                        .filter_map(|(k, v)| v.as_i64().map(|i| (k.clone(), i)))
                        .collect()
                })
                .unwrap_or_default();

            StoreFile {
                version: STORE_VERSION,
                accounts,
                active_index,
                active_index_by_family,
            }
        }
        other => {
            corrupt.push(other);
            StoreFile::default()
        }
    };

    (store, corrupt)
}

/// Load-time normalization: dedup, expired-reset clearing, index remap,
/// original-token capture.
fn normalize_store(store: &mut StoreFile) {
    let now = now_ms();

    // Snapshot the accounts the active indices refer to, pre-dedup
    let active_ref = snapshot_referent(store, store.active_index);
    let family_refs: Vec<(String, Option<RefSnapshot>, i64)> = store
        .active_index_by_family
        .iter()
        .map(|(family, idx)| (family.clone(), snapshot_referent(store, *idx), *idx))
        .collect();

    let mut kept: Vec<AccountRecord> = Vec::with_capacity(store.accounts.len());
    for mut record in store.accounts.drain(..) {
        record.original_refresh_token = record.refresh_token.clone();
        record.clear_expired_rate_limits(now);

        // Identity-triple dedup: merge duplicates into the kept record
        if let Some(existing) = kept.iter_mut().find(|k| k.identity_matches(&record)) {
            merge_record_into(existing, &record);
            continue;
        }

        // Refresh-token dedup: older last_used loses
        if let Some(pos) = kept
            .iter()
            .position(|k| k.refresh_token == record.refresh_token)
        {
            if kept[pos].last_used < record.last_used {
                kept[pos] = record;
            }
            continue;
        }

        kept.push(record);
    }
    store.accounts = kept;

    store.active_index = relocate_referent(store, active_ref, store.active_index);
    let mut remapped = HashMap::new();
    for (family, referent, old_idx) in family_refs {
        remapped.insert(family, relocate_referent(store, referent, old_idx));
    }
    store.active_index_by_family = remapped;
    store.clamp_indices();
}

#[derive(Clone)]
struct RefSnapshot {
    account_id: Option<String>,
    email: Option<String>,
    plan: Option<String>,
    refresh_token: String,
}

fn snapshot_referent(store: &StoreFile, index: i64) -> Option<RefSnapshot> {
    if !store.valid_index(index) {
        return None;
    }
    let record = &store.accounts[index as usize];
    Some(RefSnapshot {
        account_id: record.account_id.clone(),
        email: record.email.clone(),
        plan: record.plan.clone(),
        refresh_token: record.refresh_token.clone(),
    })
}

/// Find the snapshotted account in the (merged or dedup'd) list; clamp to
/// `min(old_index, len-1)` when the referent is gone.
fn relocate_referent(store: &StoreFile, referent: Option<RefSnapshot>, old_index: i64) -> i64 {
    if store.accounts.is_empty() {
        return -1;
    }
    if old_index < 0 {
        return -1;
    }

    if let Some(snapshot) = referent {
        let by_identity = store.accounts.iter().position(|a| {
            snapshot.account_id.is_some()
                && a.account_id == snapshot.account_id
                && a.email.as_deref().map(str::to_lowercase)
                    == snapshot.email.as_deref().map(str::to_lowercase)
                && a.plan == snapshot.plan
        });
        if let Some(pos) = by_identity {
            return pos as i64;
        }
        if let Some(pos) = store
            .accounts
            .iter()
            .position(|a| a.refresh_token == snapshot.refresh_token)
        {
            return pos as i64;
        }
    }

    old_index.min(store.accounts.len() as i64 - 1)
}

/// Merge a candidate record into the record already on disk.
fn merge_record_into(disk: &mut AccountRecord, candidate: &AccountRecord) {
    // A rotated token (differs from what the candidate read off disk)
    // replaces the disk token only when the candidate is fresher
    if candidate.refresh_token != candidate.original_refresh_token
        && candidate.last_used >= disk.last_used
    {
        disk.refresh_token = candidate.refresh_token.clone();
    }

    if disk.account_id.is_none() {
        disk.account_id = candidate.account_id.clone();
    }
    if disk.email.is_none() {
        disk.email = candidate.email.clone();
    }
    if disk.plan.is_none() {
        disk.plan = candidate.plan.clone();
    }
    if disk.enabled.is_none() {
        disk.enabled = candidate.enabled;
    }

    disk.added_at = match (disk.added_at, candidate.added_at) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    };
    disk.last_used = disk.last_used.max(candidate.last_used);

    if candidate.last_used >= disk.last_used
        && let Some(reason) = candidate.last_switch_reason
    {
        disk.last_switch_reason = Some(reason);
    }

    for (key, reset) in &candidate.rate_limit_reset_times {
        let entry = disk.rate_limit_reset_times.entry(key.clone()).or_insert(0);
        *entry = (*entry).max(*reset);
    }

    match (disk.cooling_down_until, candidate.cooling_down_until) {
        (Some(a), Some(b)) if b > a => {
            disk.cooling_down_until = Some(b);
            disk.cooldown_reason = candidate.cooldown_reason;
        }
        (None, Some(b)) => {
            disk.cooling_down_until = Some(b);
            disk.cooldown_reason = candidate.cooldown_reason;
        }
        _ => {}
    }
}

/// Merge a candidate snapshot over a newer disk state. Identity-triple
/// match wins, then refresh-token match; unmatched candidates append.
pub fn merge_stores(mut disk: StoreFile, candidate: &StoreFile) -> StoreFile {
    for record in &candidate.accounts {
        let pos = disk
            .accounts
            .iter()
            .position(|d| d.identity_matches(record))
            .or_else(|| {
                disk.accounts.iter().position(|d| {
                    d.refresh_token == record.refresh_token
                        || (!record.original_refresh_token.is_empty()
                            && d.refresh_token == record.original_refresh_token)
                })
            });

        match pos {
            Some(i) => merge_record_into(&mut disk.accounts[i], record),
            None => disk.accounts.push(record.clone()),
        }
    }

    // Remap the candidate's active indices onto the merged space
    disk.active_index = relocate_candidate_index(&disk, candidate, candidate.active_index);
    let mut by_family = HashMap::new();
    for (family, idx) in &candidate.active_index_by_family {
        by_family.insert(
            family.clone(),
            relocate_candidate_index(&disk, candidate, *idx),
        );
    }
    // Families only the disk state knows about survive the merge
    for (family, idx) in &disk.active_index_by_family.clone() {
        by_family.entry(family.clone()).or_insert(*idx);
    }
    disk.active_index_by_family = by_family;
    disk.clamp_indices();
    disk
}

fn relocate_candidate_index(merged: &StoreFile, candidate: &StoreFile, index: i64) -> i64 {
    let referent = snapshot_referent(candidate, index);
    relocate_referent(merged, referent, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(token: &str, id: Option<&str>, email: Option<&str>, plan: Option<&str>) -> AccountRecord {
        let mut r = AccountRecord::new(token.to_string());
        r.account_id = id.map(String::from);
        r.email = email.map(String::from);
        r.plan = plan.map(String::from);
        r
    }

    fn hydrated(token: &str, n: u32) -> AccountRecord {
        record(
            token,
            Some(&format!("acc-{n}")),
            Some(&format!("user{n}@example.com")),
            Some("Plus"),
        )
    }

    fn store_in(dir: &TempDir) -> AccountStore {
        AccountStore::new(dir.path().join("accounts.json"), None)
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_load_round_trip_preserves_identities() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut file = StoreFile::default();
        file.accounts.push(hydrated("rt-1", 1));
        file.accounts.push(hydrated("rt-2", 2));
        file.active_index = 1;
        file.active_index_by_family.insert("codex".into(), 0);

        store.save(&file).unwrap();
        let loaded = store.load().unwrap().unwrap();

        assert_eq!(loaded.version, STORE_VERSION);
        assert_eq!(loaded.accounts.len(), 2);
        assert_eq!(loaded.accounts[0].account_id.as_deref(), Some("acc-1"));
        assert_eq!(loaded.accounts[1].account_id.as_deref(), Some("acc-2"));
        assert_eq!(loaded.active_index, 1);
        assert_eq!(loaded.active_index_by_family["codex"], 0);
    }

    #[test]
    fn test_load_accepts_bare_array_shape() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("accounts.json");
        std::fs::write(
            &path,
            r#"[{"refreshToken":"rt-1","accountId":"a","email":"a@b.c","plan":"Plus"}]"#,
        )
        .unwrap();

        let store = AccountStore::new(path, None);
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.version, STORE_VERSION);
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.active_index, 0);
    }

    #[test]
    fn test_load_accepts_versionless_object_shape() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("accounts.json");
        std::fs::write(
            &path,
            r#"{"accounts":[{"refreshToken":"rt-1"}],"activeIndex":0}"#,
        )
        .unwrap();

        let store = AccountStore::new(path, None);
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.version, STORE_VERSION);
        assert_eq!(loaded.accounts.len(), 1);
        assert!(!loaded.accounts[0].is_hydrated());
    }

    #[test]
    fn test_corrupt_file_quarantined_and_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("accounts.json");
        std::fs::write(&path, "{not json at all").unwrap();

        let store = AccountStore::new(path.clone(), None);
        assert_eq!(store.inspect(), InspectReport::CorruptFile);
        assert!(store.load().unwrap().is_none());

        // The bytes were shunted aside and the file reset
        let quarantines: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains("quarantine"))
            .collect();
        assert_eq!(quarantines.len(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
    }

    #[test]
    fn test_identity_dedup_keeps_one() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut file = StoreFile::default();
        let mut a = hydrated("rt-1", 1);
        a.last_used = 100;
        let mut b = hydrated("rt-other", 1);
        b.last_used = 200;
        file.accounts.push(a);
        file.accounts.push(b);

        store.save(&file).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.accounts[0].last_used, 200);
    }

    #[test]
    fn test_token_dedup_older_last_used_loses() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("accounts.json");
        std::fs::write(
            &path,
            r#"{"version":3,"accounts":[
                {"refreshToken":"same","accountId":"a1","email":"a@x.y","plan":"Plus","lastUsed":100},
                {"refreshToken":"same","accountId":"a2","email":"b@x.y","plan":"Pro","lastUsed":500}
            ],"activeIndex":0}"#,
        )
        .unwrap();

        let store = AccountStore::new(path, None);
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.accounts[0].account_id.as_deref(), Some("a2"));
    }

    #[test]
    fn test_expired_rate_limits_cleared_on_load() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut file = StoreFile::default();
        let mut a = hydrated("rt-1", 1);
        a.rate_limit_reset_times.insert("codex".into(), 1); // long past
        a.rate_limit_reset_times
            .insert("codex:gpt-5.1-codex".into(), now_ms() + 60_000);
        file.accounts.push(a);

        store.save(&file).unwrap();
        let loaded = store.load().unwrap().unwrap();
        let resets = &loaded.accounts[0].rate_limit_reset_times;
        assert!(!resets.contains_key("codex"));
        assert!(resets.contains_key("codex:gpt-5.1-codex"));
    }

    #[test]
    fn test_merge_rate_limit_takes_max_and_cooldown_later() {
        let mut disk_acct = hydrated("rt-1", 1);
        disk_acct.rate_limit_reset_times.insert("codex".into(), 100);
        disk_acct.cooling_down_until = Some(500);
        let mut disk = StoreFile::default();
        disk.accounts.push(disk_acct);

        let mut cand_acct = hydrated("rt-1", 1);
        cand_acct.rate_limit_reset_times.insert("codex".into(), 50);
        cand_acct
            .rate_limit_reset_times
            .insert("codex:m".into(), 900);
        cand_acct.cooling_down_until = Some(800);
        cand_acct.cooldown_reason = Some(CooldownReason::AuthFailure);
        let mut candidate = StoreFile::default();
        candidate.accounts.push(cand_acct);

        let merged = merge_stores(disk, &candidate);
        let account = &merged.accounts[0];
        assert_eq!(account.rate_limit_reset_times["codex"], 100);
        assert_eq!(account.rate_limit_reset_times["codex:m"], 900);
        assert_eq!(account.cooling_down_until, Some(800));
        assert_eq!(account.cooldown_reason, Some(CooldownReason::AuthFailure));
    }

    #[test]
    fn test_merge_added_at_min_last_used_max() {
        let mut disk_acct = hydrated("rt-1", 1);
        disk_acct.added_at = 1000;
        disk_acct.last_used = 300;
        let mut disk = StoreFile::default();
        disk.accounts.push(disk_acct);

        let mut cand_acct = hydrated("rt-1", 1);
        cand_acct.added_at = 400;
        cand_acct.last_used = 200;
        let mut candidate = StoreFile::default();
        candidate.accounts.push(cand_acct);

        let merged = merge_stores(disk, &candidate);
        assert_eq!(merged.accounts[0].added_at, 400);
        assert_eq!(merged.accounts[0].last_used, 300);
    }

    #[test]
    fn test_merge_rotated_token_needs_newer_last_used() {
        let mut disk_acct = hydrated("rt-old", 1);
        disk_acct.last_used = 500;
        let mut disk = StoreFile::default();
        disk.accounts.push(disk_acct);

        // Candidate rotated its token but is staler than disk
        let mut stale = hydrated("rt-rotated", 1);
        stale.original_refresh_token = "rt-old".into();
        stale.last_used = 100;
        let mut candidate = StoreFile::default();
        candidate.accounts.push(stale);

        let merged = merge_stores(disk, &candidate);
        assert_eq!(merged.accounts[0].refresh_token, "rt-old");

        // Fresher candidate wins
        let mut disk = StoreFile::default();
        let mut disk_acct = hydrated("rt-old", 1);
        disk_acct.last_used = 100;
        disk.accounts.push(disk_acct);
        let mut fresh = hydrated("rt-rotated", 1);
        fresh.original_refresh_token = "rt-old".into();
        fresh.last_used = 900;
        let mut candidate = StoreFile::default();
        candidate.accounts.push(fresh);

        let merged = merge_stores(disk, &candidate);
        assert_eq!(merged.accounts[0].refresh_token, "rt-rotated");
    }

    #[test]
    fn test_merge_appends_unknown_accounts() {
        let mut disk = StoreFile::default();
        disk.accounts.push(hydrated("rt-1", 1));

        let mut candidate = StoreFile::default();
        candidate.accounts.push(hydrated("rt-2", 2));
        candidate.active_index = 0;

        let merged = merge_stores(disk, &candidate);
        assert_eq!(merged.accounts.len(), 2);
        // The candidate's active referent (acc-2) relocated to position 1
        assert_eq!(merged.active_index, 1);
    }

    #[test]
    fn test_merge_missing_referent_clamps() {
        let disk = StoreFile::default();

        let mut candidate = StoreFile::default();
        candidate.accounts.push(hydrated("rt-1", 1));
        candidate.active_index = 5; // points past the end

        let merged = merge_stores(disk, &candidate);
        assert_eq!(merged.active_index, 0); // min(5, len-1)
    }

    #[test]
    fn test_quarantine_retention_cap() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        for _ in 0..(QUARANTINE_RETENTION + 5) {
            store
                .quarantine(&[AccountRecord::new("rt".into())], "test")
                .unwrap();
            // Distinct epoch-ms filenames
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let count = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains("quarantine"))
            .count();
        assert_eq!(count, QUARANTINE_RETENTION);
    }

    #[test]
    fn test_legacy_migration_merges_and_renames() {
        let dir = TempDir::new().unwrap();
        let legacy = dir.path().join("legacy-accounts.json");
        std::fs::write(
            &legacy,
            r#"{"version":3,"accounts":[{"refreshToken":"rt-legacy","accountId":"l","email":"l@x.y","plan":"Pro"}],"activeIndex":0}"#,
        )
        .unwrap();

        let store = AccountStore::new(dir.path().join("accounts.json"), Some(legacy.clone()));
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.accounts[0].account_id.as_deref(), Some("l"));
        assert!(!legacy.exists());

        // One-shot: a second load does not resurrect the legacy file
        let again = store.load().unwrap().unwrap();
        assert_eq!(again.accounts.len(), 1);
    }

    #[test]
    fn test_inspect_reports_legacy_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("accounts.json");
        std::fs::write(
            &path,
            r#"{"version":3,"accounts":[
                {"refreshToken":"rt-ok","accountId":"a","email":"a@x.y","plan":"Plus"},
                {"refreshToken":"rt-legacy"}
            ],"activeIndex":0}"#,
        )
        .unwrap();

        let store = AccountStore::new(path, None);
        match store.inspect() {
            InspectReport::NeedsRepair {
                legacy,
                corrupt_entries,
            } => {
                assert_eq!(legacy, vec![1]);
                assert_eq!(corrupt_entries, 0);
            }
            other => panic!("expected NeedsRepair, got {other:?}"),
        }
    }

    #[test]
    fn test_save_with_lock_transform_sees_latest() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut file = StoreFile::default();
        file.accounts.push(hydrated("rt-1", 1));
        store.save(&file).unwrap();

        let result = store
            .save_with_lock(|latest| {
                let mut latest = latest.unwrap();
                latest.accounts.push(hydrated("rt-2", 2));
                latest
            })
            .unwrap();

        assert_eq!(result.accounts.len(), 2);
        assert_eq!(store.load().unwrap().unwrap().accounts.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_store_file_mode_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut file = StoreFile::default();
        file.accounts.push(hydrated("rt-1", 1));
        store.save(&file).unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
