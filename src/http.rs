//! Shared HTTP client for provider, registrar, and resolver APIs.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::StatusCode;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("selfhosted/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Status and raw body of a completed request.
pub(crate) struct RawResponse {
    pub(crate) status: StatusCode,
    pub(crate) body: Vec<u8>,
}

impl RawResponse {
    pub(crate) fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends `request` and buffers the body, mapping transport errors to text.
pub(crate) async fn send(request: reqwest::RequestBuilder) -> Result<RawResponse, String> {
    let response = request.send().await.map_err(|err| err.to_string())?;
    let status = response.status();
    let body = response.bytes().await.map_err(|err| err.to_string())?;
    Ok(RawResponse {
        status,
        body: body.to_vec(),
    })
}
