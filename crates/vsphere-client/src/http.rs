//! Shared HTTP transport for the management and REST endpoints

use std::time::Duration;

use reqwest::Url;
use serde_json::Value;

use crate::error::{Error, Result};

/// User agent reported to vCenter
pub const USER_AGENT: &str = "machineAPIvSphereProvider";

/// Connect and login deadline
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Header carrying the session token on both APIs
pub const SESSION_HEADER: &str = "vmware-api-session-id";

/// Build the HTTP client used for one vCenter session
pub fn build_http_client(insecure: bool) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .danger_accept_invalid_certs(insecure)
        .build()
        .map_err(|e| Error::http(None, format!("failed to build http client: {e}")))
}

/// Normalise a server name or URL into an `https://host[:port]` base
pub fn server_url(server: &str) -> Result<Url> {
    let candidate = if server.contains("://") {
        server.to_string()
    } else {
        format!("https://{server}")
    };
    let mut url = Url::parse(&candidate)
        .map_err(|e| Error::invalid_argument(format!("invalid vCenter server '{server}': {e}")))?;
    url.set_path("");
    url.set_query(None);
    Ok(url)
}

/// Read a response body as JSON, mapping failures through `on_error`
pub(crate) async fn read_json(
    response: reqwest::Response,
    on_error: impl FnOnce(u16, &Value) -> Error,
) -> Result<Value> {
    let status = response.status();
    let bytes = response.bytes().await?;
    let body: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    if status.is_success() {
        Ok(body)
    } else {
        Err(on_error(status.as_u16(), &body))
    }
}
