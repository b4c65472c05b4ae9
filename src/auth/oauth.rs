use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{HttpClient, now_ms};

// This OAuth client id is **intentionally public**. The vendor uses the
// native-application flow, where the client cannot hold a confidential
// secret; security rests on the PKCE challenge and the localhost redirect.
// A valid refresh token is still required for any access.
pub const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
pub const AUTHORIZE_URL: &str = "https://auth.openai.com/oauth/authorize";
pub const TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
pub const REDIRECT_URI: &str = "http://localhost:1455/auth/callback";
pub const SCOPES: &str = "openid profile email offline_access";

/// Outcome of a token operation. The dispatch core never branches on
/// transport details, only on this shape.
#[derive(Debug, Clone)]
pub enum TokenResult {
    Success {
        access: String,
        refresh: String,
        id_token: Option<String>,
        /// Epoch-ms expiry of the access token
        expires: u64,
    },
    Failed {
        reason: String,
    },
}

impl TokenResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TokenResult::Success { .. })
    }
}

/// Everything the host needs to drive the browser leg of the flow.
#[derive(Debug, Clone)]
pub struct AuthorizationFlow {
    pub pkce_verifier: String,
    pub state: String,
    pub url: String,
}

/// Build the authorization URL with a fresh PKCE verifier and state.
pub fn create_authorization_flow() -> AuthorizationFlow {
    let mut verifier_bytes = [0u8; 64];
    // getrandom only fails on broken platforms; an all-zero verifier would
    // still complete the flow, just without entropy
    let _ = getrandom::fill(&mut verifier_bytes);
    let pkce_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let challenge = {
        let mut hasher = Sha256::new();
        hasher.update(pkce_verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    };

    let state = uuid::Uuid::new_v4().to_string();

    let url = format!(
        "{AUTHORIZE_URL}?response_type=code&client_id={CLIENT_ID}\
         &redirect_uri={redirect}&scope={scope}\
         &code_challenge={challenge}&code_challenge_method=S256\
         &state={state}&id_token_add_organizations=true",
        redirect = url_encode(REDIRECT_URI),
        scope = url_encode(SCOPES),
    );

    AuthorizationFlow {
        pkce_verifier,
        state,
        url,
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    id_token: Option<String>,
    expires_in: u64,
}

/// Exchange an authorization code for tokens.
pub async fn exchange_authorization_code(
    http_client: &HttpClient,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> TokenResult {
    let body = format!(
        "grant_type=authorization_code&client_id={CLIENT_ID}&code={}&code_verifier={}&redirect_uri={}",
        url_encode(code),
        url_encode(verifier),
        url_encode(redirect_uri),
    );
    token_request(http_client, &body, None).await
}

/// Redeem a refresh token for a fresh access token. The vendor may rotate
/// the refresh token; the previous one is echoed back when it does not.
pub async fn refresh_access_token(http_client: &HttpClient, refresh_token: &str) -> TokenResult {
    let body = format!(
        "grant_type=refresh_token&client_id={CLIENT_ID}&refresh_token={}&scope={}",
        url_encode(refresh_token),
        url_encode(SCOPES),
    );
    token_request(http_client, &body, Some(refresh_token)).await
}

async fn token_request(
    http_client: &HttpClient,
    body: &str,
    fallback_refresh: Option<&str>,
) -> TokenResult {
    let response = match http_client
        .post(TOKEN_URL, "application/x-www-form-urlencoded", body.as_bytes())
        .await
    {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(error = %e, "token endpoint request failed");
            return TokenResult::Failed { reason: e };
        }
    };

    let tokens: TokenResponse = match serde_json::from_slice(&response) {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!(error = %e, "token endpoint returned unparseable body");
            return TokenResult::Failed {
                reason: format!("invalid token response: {e}"),
            };
        }
    };

    let refresh = tokens
        .refresh_token
        .or_else(|| fallback_refresh.map(String::from))
        .unwrap_or_default();

    if refresh.is_empty() {
        return TokenResult::Failed {
            reason: "token response carried no refresh token".to_string(),
        };
    }

    TokenResult::Success {
        access: tokens.access_token,
        refresh,
        id_token: tokens.id_token,
        expires: now_ms() + tokens.expires_in * 1000,
    }
}

fn url_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
