use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::auth::now_ms;

use super::rate_limit::format_duration;

/// Snapshots older than this are dropped from memory and disk.
const RETENTION_MS: u64 = 7 * 24 * 3600 * 1000;

/// A snapshot no longer reflects live usage after this long.
const STALE_MS: u64 = 15 * 60 * 1000;

/// Reset timestamps below this are seconds, not milliseconds.
const SECONDS_CUTOFF: f64 = 2_000_000_000.0;

/// Vendor quota telemetry header prefix
pub const TELEMETRY_HEADER_PREFIX: &str = "x-codex-";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindow {
    /// 0..100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_minutes: Option<u64>,
    /// Epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<u64>,
}

impl RateLimitWindow {
    fn merge_from(&mut self, other: &RateLimitWindow) {
        if other.used_percent.is_some() {
            self.used_percent = other.used_percent.map(|p| p.clamp(0.0, 100.0));
        }
        if other.window_minutes.is_some() {
            self.window_minutes = other.window_minutes;
        }
        if other.reset_at.is_some() {
            self.reset_at = other.reset_at;
        }
    }

    fn is_empty(&self) -> bool {
        self.used_percent.is_none() && self.window_minutes.is_none() && self.reset_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreditsInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_credits: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlimited: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
}

impl CreditsInfo {
    fn merge_from(&mut self, other: &CreditsInfo) {
        if other.has_credits.is_some() {
            self.has_credits = other.has_credits;
        }
        if other.unlimited.is_some() {
            self.unlimited = other.unlimited;
        }
        if other.balance.is_some() {
            self.balance = other.balance;
        }
    }

    fn is_empty(&self) -> bool {
        self.has_credits.is_none() && self.unlimited.is_none() && self.balance.is_none()
    }
}

/// Last-known usage window and credit state for one account.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<RateLimitWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<RateLimitWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<CreditsInfo>,
    #[serde(default)]
    pub updated_at: u64,
}

impl RateLimitSnapshot {
    pub fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.updated_at) > STALE_MS
    }

    fn merge_from(&mut self, update: &SnapshotUpdate) {
        if let Some(window) = &update.primary {
            self.primary
                .get_or_insert_with(RateLimitWindow::default)
                .merge_from(window);
        }
        if let Some(window) = &update.secondary {
            self.secondary
                .get_or_insert_with(RateLimitWindow::default)
                .merge_from(window);
        }
        if let Some(credits) = &update.credits {
            self.credits
                .get_or_insert_with(CreditsInfo::default)
                .merge_from(credits);
        }
    }
}

/// A partial update parsed from headers or an SSE event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotUpdate {
    pub primary: Option<RateLimitWindow>,
    pub secondary: Option<RateLimitWindow>,
    pub credits: Option<CreditsInfo>,
}

impl SnapshotUpdate {
    pub fn is_empty(&self) -> bool {
        self.primary.as_ref().is_none_or(|w| w.is_empty())
            && self.secondary.as_ref().is_none_or(|w| w.is_empty())
            && self.credits.as_ref().is_none_or(|c| c.is_empty())
    }
}

/// Timestamps under the cutoff are seconds; convert to ms.
fn normalize_reset(value: f64) -> u64 {
    if value < SECONDS_CUTOFF {
        (value * 1000.0) as u64
    } else {
        value as u64
    }
}

/// Parse `x-codex-*` response headers into a partial update. Returns None
/// when no telemetry headers are present.
pub fn parse_telemetry_headers(headers: &hyper::HeaderMap) -> Option<SnapshotUpdate> {
    fn window(update: &mut SnapshotUpdate, primary: bool) -> &mut RateLimitWindow {
        let slot = if primary {
            &mut update.primary
        } else {
            &mut update.secondary
        };
        slot.get_or_insert_with(RateLimitWindow::default)
    }

    let mut update = SnapshotUpdate::default();
    let mut saw_any = false;

    for (name, value) in headers {
        let name = name.as_str().to_lowercase();
        let Some(suffix) = name.strip_prefix(TELEMETRY_HEADER_PREFIX) else {
            continue;
        };
        let Ok(value) = value.to_str() else { continue };
        saw_any = true;

        match suffix {
            "primary-used-percent" => {
                window(&mut update, true).used_percent =
                    value.trim().parse::<f64>().ok().map(|p| p.clamp(0.0, 100.0));
            }
            "secondary-used-percent" => {
                window(&mut update, false).used_percent =
                    value.trim().parse::<f64>().ok().map(|p| p.clamp(0.0, 100.0));
            }
            "primary-window-minutes" => {
                window(&mut update, true).window_minutes = value.trim().parse().ok();
            }
            "secondary-window-minutes" => {
                window(&mut update, false).window_minutes = value.trim().parse().ok();
            }
            "primary-reset-at" => {
                window(&mut update, true).reset_at =
                    value.trim().parse::<f64>().ok().map(normalize_reset);
            }
            "secondary-reset-at" => {
                window(&mut update, false).reset_at =
                    value.trim().parse::<f64>().ok().map(normalize_reset);
            }
            "credits-has-credits" => {
                update.credits.get_or_insert_with(CreditsInfo::default).has_credits =
                    parse_bool(value);
            }
            "credits-unlimited" => {
                update.credits.get_or_insert_with(CreditsInfo::default).unlimited =
                    parse_bool(value);
            }
            "credits-balance" => {
                update.credits.get_or_insert_with(CreditsInfo::default).balance =
                    value.trim().parse().ok();
            }
            _ => {}
        }
    }

    if saw_any && !update.is_empty() {
        Some(update)
    } else {
        None
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Normalize a `rate_limits` object from an SSE `token_count` event.
pub fn parse_rate_limits_json(value: &serde_json::Value) -> Option<SnapshotUpdate> {
    let parse_window = |v: &serde_json::Value| -> Option<RateLimitWindow> {
        let obj = v.as_object()?;
        let window = RateLimitWindow {
            used_percent: obj
                .get("used_percent")
                .and_then(|p| p.as_f64())
                .map(|p| p.clamp(0.0, 100.0)),
            window_minutes: obj.get("window_minutes").and_then(|m| m.as_u64()),
            reset_at: obj
                .get("resets_at")
                .and_then(|r| r.as_f64())
                .map(normalize_reset),
        };
        if window.is_empty() { None } else { Some(window) }
    };

    let update = SnapshotUpdate {
        primary: value.get("primary").and_then(parse_window),
        secondary: value.get("secondary").and_then(parse_window),
        credits: value.get("credits").and_then(|v| {
            let obj = v.as_object()?;
            let credits = CreditsInfo {
                has_credits: obj.get("has_credits").and_then(|b| b.as_bool()),
                unlimited: obj.get("unlimited").and_then(|b| b.as_bool()),
                balance: obj.get("balance").and_then(|b| b.as_f64()),
            };
            if credits.is_empty() { None } else { Some(credits) }
        }),
    };

    if update.is_empty() { None } else { Some(update) }
}

/// Per-account quota snapshots, in memory and on disk. Disk writes use the
/// same advisory-lock + temp-rename discipline as the account store.
pub struct TelemetrySink {
    path: PathBuf,
    snapshots: RwLock<HashMap<String, RateLimitSnapshot>>,
}

impl TelemetrySink {
    pub fn new(path: PathBuf) -> Self {
        let snapshots = load_snapshots(&path).unwrap_or_default();
        Self {
            path,
            snapshots: RwLock::new(snapshots),
        }
    }

    /// Apply header telemetry for the account key. Returns true when the
    /// snapshot changed.
    pub fn apply_headers(&self, key: &str, headers: &hyper::HeaderMap) -> bool {
        match parse_telemetry_headers(headers) {
            Some(update) => self.apply_update(key, &update),
            None => false,
        }
    }

    /// Apply a `rate_limits` payload from an SSE `token_count` event.
    pub fn apply_rate_limits(&self, key: &str, rate_limits: &serde_json::Value) -> bool {
        match parse_rate_limits_json(rate_limits) {
            Some(update) => self.apply_update(key, &update),
            None => false,
        }
    }

    fn apply_update(&self, key: &str, update: &SnapshotUpdate) -> bool {
        let changed = {
            let mut snapshots = self.snapshots.write();
            let snapshot = snapshots.entry(key.to_string()).or_default();
            let before = snapshot.clone();
            snapshot.merge_from(update);
            let changed = before.primary != snapshot.primary
                || before.secondary != snapshot.secondary
                || before.credits != snapshot.credits;
            snapshot.updated_at = now_ms();
            changed
        };

        if changed && let Err(e) = self.persist() {
            tracing::debug!(error = %e, "failed to persist quota snapshots");
        }
        changed
    }

    pub fn snapshot(&self, key: &str) -> Option<RateLimitSnapshot> {
        self.snapshots.read().get(key).cloned()
    }

    /// Human-readable quota lines for status output and the synthesized
    /// all-accounts-unavailable body. Empty for stale or missing snapshots.
    pub fn quota_lines(&self, key: &str) -> Vec<String> {
        let now = now_ms();
        let Some(snapshot) = self.snapshot(key) else {
            return Vec::new();
        };
        if snapshot.is_stale(now) {
            return Vec::new();
        }

        let mut lines = Vec::new();
        let mut describe = |name: &str, window: &RateLimitWindow| {
            let Some(used) = window.used_percent else {
                return;
            };
            let mut line = format!("{name}: {used:.0}% used");
            if let Some(minutes) = window.window_minutes {
                line.push_str(&format!(" of {}m window", minutes));
            }
            if let Some(reset_at) = window.reset_at
                && reset_at > now
            {
                line.push_str(&format!(", resets in {}", format_duration(reset_at - now)));
            }
            lines.push(line);
        };

        if let Some(primary) = &snapshot.primary {
            describe("primary", primary);
        }
        if let Some(secondary) = &snapshot.secondary {
            describe("secondary", secondary);
        }
        if let Some(credits) = &snapshot.credits {
            if credits.unlimited == Some(true) {
                lines.push("credits: unlimited".to_string());
            } else if let Some(balance) = credits.balance {
                lines.push(format!("credits: {balance}"));
            }
        }
        lines
    }

    /// Write all live snapshots under the file lock, merging with any
    /// sibling-process state and applying retention.
    fn persist(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !self.path.exists() {
            std::fs::write(&self.path, b"[]")?;
            restrict_permissions(&self.path);
        }

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.lock_exclusive()?;

        let result = (|| -> std::io::Result<()> {
            let mut merged = load_snapshots(&self.path).unwrap_or_default();
            {
                let snapshots = self.snapshots.read();
                for (key, snapshot) in snapshots.iter() {
                    match merged.get(key) {
                        Some(existing) if existing.updated_at > snapshot.updated_at => {}
                        _ => {
                            merged.insert(key.clone(), snapshot.clone());
                        }
                    }
                }
            }

            let cutoff = now_ms().saturating_sub(RETENTION_MS);
            merged.retain(|_, s| s.updated_at >= cutoff);

            let pairs: Vec<(&String, &RateLimitSnapshot)> = merged.iter().collect();
            let json = serde_json::to_string_pretty(&pairs)
                .map_err(|e| std::io::Error::other(e.to_string()))?;

            let tmp = self.path.with_extension("json.tmp");
            let mut tmp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            restrict_permissions(&tmp);
            tmp_file.write_all(json.as_bytes())?;
            tmp_file.sync_all()?;
            if let Err(e) = std::fs::rename(&tmp, &self.path) {
                let _ = std::fs::remove_file(&tmp);
                return Err(e);
            }
            restrict_permissions(&self.path);
            Ok(())
        })();

        let _ = fs2::FileExt::unlock(&file);
        result
    }
}

fn load_snapshots(path: &Path) -> Option<HashMap<String, RateLimitSnapshot>> {
    let content = std::fs::read_to_string(path).ok()?;
    let pairs: Vec<(String, RateLimitSnapshot)> = serde_json::from_str(&content).ok()?;
    let cutoff = now_ms().saturating_sub(RETENTION_MS);
    Some(
        pairs
            .into_iter()
            .filter(|(_, s)| s.updated_at >= cutoff)
            .collect(),
    )
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
