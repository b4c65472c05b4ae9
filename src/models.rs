/// Coarse model grouping. Selection state and rate-limit quota keys are
/// maintained per family; "gpt-5.1-codex-max" and "codex-mini-latest" both
/// land in the "codex" family.
pub fn model_family(model: &str) -> &str {
    if model.contains("codex") {
        return "codex";
    }

    const PREFIXES: &[&str] = &["gpt-5.1", "gpt-5", "gpt-4.1", "o4", "o3"];
    for prefix in PREFIXES {
        if model.starts_with(prefix) {
            return prefix;
        }
    }

    model.split('-').next().unwrap_or(model)
}

/// Quota keys for a (family, model) pair: the base family key, plus
/// `family:model` when the model is more specific than the family.
pub fn quota_keys<'a>(family: &'a str, model: Option<&'a str>) -> (String, Option<String>) {
    let base = family.to_string();
    let specific = match model {
        Some(m) if m != family => Some(format!("{family}:{m}")),
        _ => None,
    };
    (base, specific)
}
