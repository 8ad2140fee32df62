//! Command dispatch against the selected node.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::channel::EventChannel;
use crate::error::{Error, Result};
use crate::local::LocalSessionService;
use crate::session::SessionManager;
use crate::wire;

/// Per-request deadline. Diagnostic tools (MTR, speed tests) can legitimately
/// run for minutes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Routes command invocations to the selected node's command endpoint.
///
/// Refuses to issue anything without a ready session. Requests against the
/// local node go through the local service so request semantics exist in
/// exactly one place for that case.
#[derive(Clone)]
pub struct Dispatcher {
    sessions: Arc<SessionManager>,
    local: Arc<LocalSessionService>,
    http: reqwest::Client,
}

impl Dispatcher {
    pub fn new(
        http: reqwest::Client,
        sessions: Arc<SessionManager>,
        local: Arc<LocalSessionService>,
    ) -> Self {
        Self {
            sessions,
            local,
            http,
        }
    }

    /// Invoke `method` with query `params` on the selected node.
    ///
    /// The request is raced against both the caller's token and the active
    /// session's epoch token, so stopping a tool or switching nodes cancels
    /// it transport-side rather than abandoning it.
    pub async fn invoke(
        &self,
        method: &str,
        params: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let ready = self.sessions.ready_session()?;
        let epoch = ready.epoch.clone();

        let request = async {
            if ready.local {
                self.local.request(method, params, cancel).await
            } else {
                send_method_request(
                    &self.http,
                    &ready.node.url,
                    &ready.session_id,
                    method,
                    params,
                    cancel,
                )
                .await
            }
        };

        tokio::select! {
            _ = epoch.cancelled() => Err(Error::Canceled),
            result = request => result,
        }
    }

    /// The selected node's channel handle, for event subscriptions.
    pub fn event_source(&self) -> Result<EventChannel> {
        self.sessions.event_source()
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}

/// One GET-with-query-params command invocation: `{base}/method/{method}`
/// with the session id as a header. Resolves only on an explicit
/// `success: true` payload.
pub(crate) async fn send_method_request(
    http: &reqwest::Client,
    base: &str,
    session_id: &str,
    method: &str,
    params: &[(String, String)],
    cancel: &CancellationToken,
) -> Result<Value> {
    let url = format!("{}/method/{}", base.trim_end_matches('/'), method);
    let request = http
        .get(&url)
        .query(params)
        .header("session", session_id)
        .timeout(REQUEST_TIMEOUT);

    let resp = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Canceled),
        resp = request.send() => resp.map_err(|e| failure(method, e.to_string()))?,
    };
    let status = resp.status();
    let body = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Canceled),
        body = resp.text() => body.map_err(|e| failure(method, e.to_string()))?,
    };

    if status == StatusCode::BAD_REQUEST {
        return Err(Error::InvalidInput(validation_message(&body)));
    }
    if !status.is_success() {
        return Err(failure(method, format!("server returned status {}", status)));
    }

    let payload: Value = serde_json::from_str(&body)
        .map_err(|e| failure(method, format!("invalid response payload: {}", e)))?;
    if wire::is_success(&payload) {
        Ok(payload)
    } else {
        Err(Error::RequestFailure {
            method: method.to_string(),
            detail: "server reported failure".to_string(),
            body: Some(payload),
        })
    }
}

fn failure(method: &str, detail: String) -> Error {
    Error::RequestFailure {
        method: method.to_string(),
        detail,
        body: None,
    }
}

/// Prefer the server's own message for validation failures; fall back to the
/// raw body, or a generic line when the body is empty.
fn validation_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(message) = value.get("message").and_then(Value::as_str) {
            return message.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "request parameters were rejected".to_string()
    } else {
        trimmed.to_string()
    }
}
