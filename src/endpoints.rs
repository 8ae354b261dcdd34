//! Streaming endpoint derivation.
//!
//! Both channels live on the same host as the HTTP API. The scheme is
//! upgraded (`http` -> `ws`, `https` -> `wss`) and the base path is replaced
//! by a fixed per-channel path.

use url::Url;

use crate::error::EndpointError;

const QUEUE_STATUS_PATH: &str = "/queue/status/ws";

/// `{ws|wss}://{host}/queue/status/ws`
pub fn queue_status_url(base_url: &str) -> Result<Url, EndpointError> {
    let mut url = streaming_base(base_url)?;
    url.set_path(QUEUE_STATUS_PATH);
    Ok(url)
}

/// `{ws|wss}://{host}/progress/{task_id}/ws`
///
/// The task id is percent-encoded as a single path segment.
pub fn task_progress_url(base_url: &str, task_id: &str) -> Result<Url, EndpointError> {
    let mut url = streaming_base(base_url)?;
    url.set_path("");
    url.path_segments_mut()
        .map_err(|()| EndpointError::MissingHost(base_url.to_string()))?
        .pop_if_empty()
        .push("progress")
        .push(task_id)
        .push("ws");
    Ok(url)
}

/// Normalize an HTTP base URL for use as a map key. Only the origin
/// (scheme, host, port) is kept, since the streaming paths ignore the base
/// path.
pub fn normalize_base(base_url: &str) -> Result<String, EndpointError> {
    let url = parse_http(base_url)?;
    Ok(url.origin().ascii_serialization())
}

fn parse_http(base_url: &str) -> Result<Url, EndpointError> {
    let url = Url::parse(base_url.trim()).map_err(|source| EndpointError::InvalidBaseUrl {
        url: base_url.to_string(),
        source,
    })?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
    }
    if !matches!(url.host_str(), Some(host) if !host.is_empty()) {
        return Err(EndpointError::MissingHost(base_url.to_string()));
    }
    Ok(url)
}

fn streaming_base(base_url: &str) -> Result<Url, EndpointError> {
    let mut url = parse_http(base_url)?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    // http(s) -> ws(s) is an allowed special-to-special scheme change.
    url.set_scheme(scheme)
        .map_err(|()| EndpointError::UnsupportedScheme(url.scheme().to_string()))?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
