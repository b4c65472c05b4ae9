use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// Claim namespace the vendor nests subscription identity under.
pub const AUTH_CLAIM_NAMESPACE: &str = "https://api.openai.com/auth";

/// Decode a JWT payload without verifying the signature. Tokens are treated
/// as opaque on any failure.
pub fn decode_jwt(token: &str) -> Option<serde_json::Value> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.as_bytes()).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn auth_claims(claims: &serde_json::Value) -> Option<&serde_json::Value> {
    claims.get(AUTH_CLAIM_NAMESPACE)
}

pub fn extract_account_id(token: &str) -> Option<String> {
    let claims = decode_jwt(token)?;
    auth_claims(&claims)?
        .get("chatgpt_account_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Pull the email claim. Fallback order: nested `email`, nested
/// `chatgpt_user_email`, top-level `email`, top-level `preferred_username`.
/// A value without `@` is not an email.
pub fn extract_account_email(token: &str) -> Option<String> {
    let claims = decode_jwt(token)?;

    let candidates = [
        auth_claims(&claims).and_then(|a| a.get("email")),
        auth_claims(&claims).and_then(|a| a.get("chatgpt_user_email")),
        claims.get("email"),
        claims.get("preferred_username"),
    ];

    candidates
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str())
        .find(|s| s.contains('@'))
        .map(String::from)
}

pub fn extract_account_plan(token: &str) -> Option<String> {
    let claims = decode_jwt(token)?;
    let auth = auth_claims(&claims)?;
    auth.get("chatgpt_plan_type")
        .or_else(|| auth.get("plan"))
        .and_then(|v| v.as_str())
        .map(normalize_plan)
}

/// Normalize vendor plan names to their display form. Unknown values pass
/// through trimmed.
pub fn normalize_plan(raw: &str) -> String {
    match raw.trim().to_lowercase().as_str() {
        "plus" => "Plus".to_string(),
        "team" => "Team".to_string(),
        "pro" => "Pro".to_string(),
        "free" => "Free".to_string(),
        "business" => "Business".to_string(),
        "enterprise" => "Enterprise".to_string(),
        "edu" => "Edu".to_string(),
        _ => raw.trim().to_string(),
    }
}

/// Stable string key for tracker maps. Hydrated accounts key on the
/// identity triple; otherwise the refresh-token hash, the index, or
/// "unknown" as a last resort.
pub fn account_key(
    account_id: Option<&str>,
    email: Option<&str>,
    plan: Option<&str>,
    refresh_token: Option<&str>,
    index: Option<usize>,
) -> String {
    if let (Some(id), Some(email), Some(plan)) = (account_id, email, plan) {
        return format!("{}|{}|{}", id, email.to_lowercase(), plan);
    }

    if let Some(token) = refresh_token
        && !token.is_empty()
    {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        return hex;
    }

    if let Some(index) = index {
        return format!("idx:{index}");
    }

    "unknown".to_string()
}
