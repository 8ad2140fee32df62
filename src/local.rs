//! Process-wide local session bootstrap.
//!
//! The control surface is itself one of the selectable nodes, so it keeps a
//! single long-lived session to its own `/session` endpoint. A single
//! maintenance task owns the connect/handshake/reconnect cycle and publishes
//! the session through a watch channel; concurrent callers awaiting
//! [`LocalSessionService::ready`] all observe the same attempt rather than
//! spawning independent reconnect loops.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelStatus, EventChannel};
use crate::dispatch::send_method_request;
use crate::error::{Error, Result};
use crate::session::{establish_session, HANDSHAKE_TIMEOUT};
use crate::wire::EVENT_MEMORY_USAGE;

/// Fixed delay before re-arming the connection after a channel error.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// The established local session. The channel here has an independent
/// lifetime: node-selection logic must never close it.
pub struct LocalSession {
    pub session_id: String,
    pub channel: EventChannel,
    pub config: Map<String, Value>,
}

pub struct LocalSessionService {
    origin: String,
    http: reqwest::Client,
    state_rx: watch::Receiver<Option<Arc<LocalSession>>>,
    memory_rx: watch::Receiver<Option<u64>>,
    shutdown: CancellationToken,
}

impl LocalSessionService {
    /// Spawn the maintenance task and return the service handle.
    pub fn spawn(http: reqwest::Client, origin: impl Into<String>) -> Arc<Self> {
        let origin = origin.into();
        let (state_tx, state_rx) = watch::channel(None);
        let (memory_tx, memory_rx) = watch::channel(None);
        let shutdown = CancellationToken::new();

        tokio::spawn(maintenance_loop(
            http.clone(),
            origin.clone(),
            state_tx,
            memory_tx,
            shutdown.clone(),
        ));

        Arc::new(Self {
            origin,
            http,
            state_rx,
            memory_rx,
            shutdown,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Wait until the local session is established. Returns `None` only if
    /// the service has been shut down.
    pub async fn ready(&self) -> Option<Arc<LocalSession>> {
        let mut rx = self.state_rx.clone();
        loop {
            let current = rx.borrow().clone();
            if let Some(session) = current {
                return Some(session);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Current session without waiting.
    pub fn current(&self) -> Option<Arc<LocalSession>> {
        self.state_rx.borrow().clone()
    }

    /// Watch the session state; flips to `None` while reconnecting.
    pub fn session_state(&self) -> watch::Receiver<Option<Arc<LocalSession>>> {
        self.state_rx.clone()
    }

    /// Latest memory-usage report from the local node, in bytes.
    pub fn memory_usage(&self) -> watch::Receiver<Option<u64>> {
        self.memory_rx.clone()
    }

    /// The local command-invocation path. Shared by the dispatcher so there
    /// is exactly one implementation of request semantics for the local case.
    pub async fn request(
        &self,
        method: &str,
        params: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let session = self.current().ok_or(Error::NoSession)?;
        send_method_request(
            &self.http,
            &self.origin,
            &session.session_id,
            method,
            params,
            cancel,
        )
        .await
    }

    /// Stop the maintenance task and close the local channel.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(session) = self.current() {
            session.channel.close();
        }
    }
}

async fn maintenance_loop(
    http: reqwest::Client,
    origin: String,
    state_tx: watch::Sender<Option<Arc<LocalSession>>>,
    memory_tx: watch::Sender<Option<u64>>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match establish_session(&http, &origin, HANDSHAKE_TIMEOUT).await {
            Ok(est) => {
                let memory = memory_tx.clone();
                let sub = est.channel.subscribe(EVENT_MEMORY_USAGE, move |data| {
                    if let Ok(bytes) = data.trim().parse::<u64>() {
                        memory.send_replace(Some(bytes));
                    }
                });
                tracing::info!(session = %est.session_id, "local session established");

                let channel = est.channel.clone();
                let session = Arc::new(LocalSession {
                    session_id: est.session_id,
                    channel: est.channel,
                    config: est.config,
                });
                state_tx.send_replace(Some(session));

                // Hold until the channel dies or we are shut down.
                let mut status = channel.status();
                loop {
                    if *status.borrow() == ChannelStatus::Closed {
                        break;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            channel.close();
                            state_tx.send_replace(None);
                            return;
                        }
                        changed = status.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }

                channel.unsubscribe(EVENT_MEMORY_USAGE, sub);
                state_tx.send_replace(None);
                tracing::warn!("local session channel closed, reconnecting");
            }
            Err(e) => {
                tracing::warn!(error = %e, "local session bootstrap failed, retrying");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}
