//! Long-lived streaming channel to a node's `/session` endpoint.
//!
//! An [`EventChannel`] owns a spawned reader task that consumes the HTTP
//! byte stream, runs it through the SSE parser, and fans each named event
//! out to subscribed handlers. The handle is cheap to clone; the reader task
//! lives until the stream ends, errors, or [`EventChannel::close`] is called.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::sse::{SseEvent, SseParser};

/// Callback invoked with the raw data of each matching event.
pub type EventHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Open,
    Closed,
}

/// Opaque subscription handle. Unsubscribing removes exactly the handler
/// this id was issued for, leaving co-subscribers on the same event intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Clone)]
pub struct EventChannel {
    shared: Arc<Shared>,
}

struct Shared {
    url: String,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, EventHandler)>>>,
    next_id: AtomicU64,
    status_tx: watch::Sender<ChannelStatus>,
    cancel: CancellationToken,
}

impl EventChannel {
    /// Open the stream and spawn the reader task.
    ///
    /// Fails if the endpoint cannot be reached or answers with a
    /// non-success status. A successful return means events may start
    /// arriving at any moment, so subscribe before awaiting anything else.
    pub async fn connect(http: &reqwest::Client, url: &str) -> Result<Self> {
        let resp = http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::Channel(format!("{}: {}", url, e)))?;

        if !resp.status().is_success() {
            return Err(Error::Channel(format!(
                "{} returned status {}",
                url,
                resp.status()
            )));
        }

        let (status_tx, _) = watch::channel(ChannelStatus::Open);
        let shared = Arc::new(Shared {
            url: url.to_string(),
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            status_tx,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(reader_loop(resp, shared.clone()));

        Ok(Self { shared })
    }

    /// Subscribe a handler to a named event.
    pub fn subscribe<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = HandlerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, event: &str, id: HandlerId) -> bool {
        let mut handlers = self.shared.handlers.write();
        if let Some(list) = handlers.get_mut(event) {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            let removed = list.len() < before;
            if list.is_empty() {
                handlers.remove(event);
            }
            return removed;
        }
        false
    }

    /// Close the channel. Idempotent; the reader task exits promptly.
    pub fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.status_tx.send_replace(ChannelStatus::Closed);
    }

    /// Watch the channel's transport status. Flips to `Closed` exactly once,
    /// on stream end, stream error, or explicit close.
    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn is_open(&self) -> bool {
        *self.shared.status_tx.borrow() == ChannelStatus::Open
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }
}

async fn reader_loop(resp: reqwest::Response, shared: Arc<Shared>) {
    let mut stream = resp.bytes_stream();
    let mut parser = SseParser::new();

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    for event in parser.feed(&bytes) {
                        dispatch(&shared, &event);
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(url = %shared.url, error = %e, "channel stream error");
                    break;
                }
                None => {
                    tracing::debug!(url = %shared.url, "channel stream ended");
                    break;
                }
            }
        }
    }

    shared.status_tx.send_replace(ChannelStatus::Closed);
}

fn dispatch(shared: &Shared, event: &SseEvent) {
    // Snapshot under the read lock so handlers run without holding it.
    let handlers: Vec<EventHandler> = shared
        .handlers
        .read()
        .get(&event.event)
        .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
        .unwrap_or_default();

    for handler in handlers {
        handler(&event.data);
    }
}
