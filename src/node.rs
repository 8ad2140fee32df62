use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// A probe node: a remote (or local) endpoint that runs diagnostic tools and
/// exposes a streaming session plus a command endpoint.
///
/// Immutable once fetched, except for `config`, which is lazily attached
/// after a session handshake so the UI can display the node's capabilities
/// without a second round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Origin URL, e.g. `https://fra.example.net` (trailing slash tolerated).
    pub url: String,
    #[serde(default)]
    pub location: String,
    /// Node configuration captured from the session handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,
}

impl Node {
    /// Identity key: name concatenated with a sanitized form of the URL.
    /// Two nodes with identical name + origin collapse to one cache slot.
    pub fn key(&self) -> String {
        let sanitized: String = self
            .url
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{}_{}", self.name, sanitized)
    }
}

/// Normalize an origin string to `scheme://host[:port]` with default ports
/// (80/443) elided and no trailing slash. Returns `None` for unparseable
/// input.
pub fn normalize_origin(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim_end_matches('/')).ok()?;
    let host = url.host_str()?;
    // Url::port() already reports None for the scheme's default port.
    match url.port() {
        Some(port) => Some(format!("{}://{}:{}", url.scheme(), host, port)),
        None => Some(format!("{}://{}", url.scheme(), host)),
    }
}

/// Origin equality after trailing-slash and default-port normalization.
pub fn same_origin(a: &str, b: &str) -> bool {
    match (normalize_origin(a), normalize_origin(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
