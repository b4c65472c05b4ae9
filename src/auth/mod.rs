pub mod identity;
pub mod manager;
pub mod oauth;
pub mod refresh;
pub mod store;

pub use manager::{AccountManager, ManagedAccount};
pub use oauth::TokenResult;
pub use store::{AccountRecord, AccountStore};

use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

/// Buffered HTTPS client shared by the OAuth endpoints. The dispatch path
/// keeps its own client because it needs the raw streaming response body.
pub struct HttpClient {
    full_client: Client<
        hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
        Full<Bytes>,
    >,
}

impl HttpClient {
    pub fn new() -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_only()
            .enable_http1()
            .build();

        let full_client = Client::builder(TokioExecutor::new()).build(connector);

        Self { full_client }
    }

    pub async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, String> {
        let req = Request::builder()
            .method("POST")
            .uri(url)
            .header("Content-Type", content_type)
            .body(Full::new(Bytes::from(body.to_vec())))
            .map_err(|e| e.to_string())?;

        let response = self
            .full_client
            .request(req)
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
                .unwrap_or_default();
            let preview: String = body.chars().take(300).collect();
            return Err(format!("HTTP {status}: {preview}"));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| e.to_string())?;
        Ok(body.to_bytes().to_vec())
    }

}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since the Unix epoch. Every persisted timestamp in the
/// account store and telemetry snapshots uses this clock.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
