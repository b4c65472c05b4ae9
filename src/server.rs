use http_body_util::{BodyExt, Either, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchBody, FetchOrchestrator, RequestInit};
use crate::error::Error;
use crate::tools;

/// Vendor chat-completions endpoint the proxy fronts.
pub const UPSTREAM_URL: &str = "https://chatgpt.com/backend-api/codex/responses";

/// Maximum request body size (10 MB).
const MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

const FALLBACK_MODEL: &str = "gpt-5.1-codex";

pub struct ServerState {
    pub orchestrator: Arc<FetchOrchestrator>,
}

fn full_body(bytes: Bytes) -> DispatchBody {
    Either::Left(Full::new(bytes))
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<DispatchBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json; charset=utf-8")
        .body(full_body(Bytes::from(body.to_string())))
        .expect("static response")
}

fn text_response(body: String) -> Response<DispatchBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(Bytes::from(body)))
        .expect("static response")
}

fn error_response(error: &Error) -> Response<DispatchBody> {
    let status = match error {
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::Cancelled => StatusCode::BAD_REQUEST,
        Error::Api(crate::error::ApiError::InvalidRequest { .. }) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    let mut payload = serde_json::json!({
        "error": {"message": error.to_string(), "type": "proxy_error"}
    });
    if let Some(suggestion) = error.suggestion() {
        payload["error"]["suggestion"] = serde_json::Value::String(suggestion.to_string());
    }
    json_response(status, payload)
}

/// Accept loop. Runs until the listener errors or the task is aborted.
pub async fn run(state: Arc<ServerState>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "codexmux listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle(state, req).await }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(peer = %peer, error = %e, "connection ended");
            }
        });
    }
}

async fn handle(
    state: Arc<ServerState>,
    request: Request<Incoming>,
) -> Result<Response<DispatchBody>, std::convert::Infallible> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = match (method, path.as_str()) {
        (Method::POST, "/responses" | "/v1/responses" | "/backend-api/codex/responses") => {
            proxy(state, request).await
        }
        (Method::GET, "/health") => json_response(StatusCode::OK, serde_json::json!({"ok": true})),
        (Method::GET, "/accounts") => {
            text_response(tools::list_accounts(state.orchestrator.manager()))
        }
        (Method::GET, "/status") => text_response(tools::compact_status(
            state.orchestrator.manager(),
            state.orchestrator.sink(),
        )),
        _ => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({"error": {"message": format!("no route for {path}")}}),
        ),
    };

    Ok(response)
}

/// Forward a chat-completions request through the dispatch core. The body
/// passes through untouched; the host-side transformer has already shaped
/// it for the vendor.
async fn proxy(state: Arc<ServerState>, request: Request<Incoming>) -> Response<DispatchBody> {
    let (parts, body) = request.into_parts();

    let body_bytes = match read_capped(body).await {
        Ok(bytes) => bytes,
        Err(e) => return error_response(&e),
    };

    let parsed: Option<serde_json::Value> = serde_json::from_slice(&body_bytes).ok();
    let model = parsed
        .as_ref()
        .and_then(|v| v.get("model"))
        .and_then(|m| m.as_str())
        .unwrap_or(FALLBACK_MODEL)
        .to_string();
    let prompt_cache_key = parsed
        .as_ref()
        .and_then(|v| v.get("prompt_cache_key"))
        .and_then(|k| k.as_str())
        .map(String::from)
        .or_else(|| {
            parts
                .headers
                .get("prompt_cache_key")
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        });

    if crate::config::get_config().logging.log_requests {
        debug!(model = %model, bytes = body_bytes.len(), "proxying chat-completions request");
    }

    let init = RequestInit {
        method: Method::POST,
        headers: parts.headers,
        body: body_bytes,
        model,
        prompt_cache_key,
        cancel: None,
    };

    match state.orchestrator.execute(UPSTREAM_URL, init).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "dispatch failed");
            error_response(&e)
        }
    }
}

async fn read_capped(body: Incoming) -> Result<Bytes, Error> {
    use hyper::body::Body;

    let too_large = || {
        Error::Api(crate::error::ApiError::InvalidRequest {
            message: format!("request body exceeds {MAX_REQUEST_SIZE} bytes"),
        })
    };

    if body.size_hint().lower() > MAX_REQUEST_SIZE as u64 {
        return Err(too_large());
    }

    let bytes = body
        .collect()
        .await
        .map_err(|e| {
            Error::Api(crate::error::ApiError::InvalidRequest {
                message: format!("failed to read body: {e}"),
            })
        })?
        .to_bytes();

    if bytes.len() > MAX_REQUEST_SIZE {
        return Err(too_large());
    }
    Ok(bytes)
}
