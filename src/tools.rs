use std::sync::Arc;

use crate::auth::manager::AccountManager;
use crate::auth::now_ms;
use crate::dispatch::rate_limit::format_duration;
use crate::dispatch::telemetry::TelemetrySink;
use crate::error::{Error, StoreError};

/// Deterministic error text for an out-of-range 1-based index.
fn index_error(index: usize, max: usize) -> String {
    if max == 0 {
        return "No accounts configured. Run 'codexmux login' to add one.".to_string();
    }
    format!("Invalid account index {index}. Valid range: 1-{max}.")
}

fn resolve_index(manager: &AccountManager, one_based: usize) -> Result<usize, String> {
    let max = manager.total_records();
    if one_based == 0 || one_based > max {
        return Err(index_error(one_based, max));
    }
    Ok(one_based - 1)
}

fn map_store_error(e: Error, one_based: usize, manager: &AccountManager) -> String {
    match e {
        Error::Store(StoreError::IndexOutOfRange { .. }) => {
            index_error(one_based, manager.total_records())
        }
        other => format!("Operation failed: {other}"),
    }
}

/// Detailed account listing for the host.
pub fn list_accounts(manager: &Arc<AccountManager>) -> String {
    let accounts = manager.accounts_snapshot();
    if accounts.is_empty() {
        return "No accounts configured. Run 'codexmux login' to add one.".to_string();
    }

    let now = now_ms();
    let mut out = format!("{} account(s):\n", accounts.len());
    for account in &accounts {
        let record = &account.record;
        let mut flags = Vec::new();
        if !record.is_enabled() {
            flags.push("disabled".to_string());
        }
        if !record.is_hydrated() {
            flags.push("needs repair".to_string());
        }
        if record.is_cooling_down(now) {
            flags.push("cooldown".to_string());
        }
        let limited: Vec<String> = record
            .rate_limit_reset_times
            .iter()
            .filter(|(_, reset)| **reset > now)
            .map(|(key, reset)| format!("{key} resets in {}", format_duration(reset - now)))
            .collect();
        if !limited.is_empty() {
            flags.push(format!("rate-limited: {}", limited.join(", ")));
        }

        let plan = record.plan.as_deref().unwrap_or("?");
        let status = if flags.is_empty() {
            "ok".to_string()
        } else {
            flags.join("; ")
        };
        out.push_str(&format!(
            "  {}. {} ({plan}) - {status}\n",
            account.index + 1,
            account.label(),
        ));
    }
    out
}

/// One-line-per-account status with quota telemetry where known.
pub fn compact_status(manager: &Arc<AccountManager>, sink: &Arc<TelemetrySink>) -> String {
    let accounts = manager.accounts_snapshot();
    if accounts.is_empty() {
        return "No accounts configured.".to_string();
    }

    let now = now_ms();
    let mut out = String::new();
    for account in &accounts {
        let record = &account.record;
        let state = if !record.is_enabled() {
            "off"
        } else if record.is_cooling_down(now) {
            "cooldown"
        } else if record
            .rate_limit_reset_times
            .values()
            .any(|reset| *reset > now)
        {
            "limited"
        } else {
            "ok"
        };
        out.push_str(&format!("{}. {} [{state}]", account.index + 1, account.label()));

        let quota = sink.quota_lines(&account.key());
        if !quota.is_empty() {
            out.push_str(&format!(" ({})", quota.join("; ")));
        }
        out.push('\n');
    }
    out
}

/// Switch the active account (1-based index).
pub fn switch_account(manager: &Arc<AccountManager>, one_based: usize) -> String {
    let index = match resolve_index(manager, one_based) {
        Ok(index) => index,
        Err(message) => return message,
    };
    match manager.set_active(index) {
        Ok(account) => format!("Switched active account to {} ({})", one_based, account.label()),
        Err(e) => map_store_error(e, one_based, manager),
    }
}

/// Toggle enabled/disabled (1-based index).
pub fn toggle_account(manager: &Arc<AccountManager>, one_based: usize) -> String {
    let index = match resolve_index(manager, one_based) {
        Ok(index) => index,
        Err(message) => return message,
    };
    let label = manager
        .account_at(index)
        .map(|a| a.label())
        .unwrap_or_else(|| format!("account {one_based}"));
    match manager.toggle_enabled(index) {
        Ok(true) => format!("Enabled {label}"),
        Ok(false) => format!("Disabled {label}"),
        Err(e) => map_store_error(e, one_based, manager),
    }
}

/// Remove an account (1-based index).
pub fn remove_account(manager: &Arc<AccountManager>, one_based: usize) -> String {
    let index = match resolve_index(manager, one_based) {
        Ok(index) => index,
        Err(message) => return message,
    };
    match manager.remove_account(index) {
        Ok(record) => format!("Removed {}", record.label(index)),
        Err(e) => map_store_error(e, one_based, manager),
    }
}
