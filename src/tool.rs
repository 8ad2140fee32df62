//! Tool execution state machine: Idle -> Running -> Idle.
//!
//! One controller exists per UI surface; several may share the session
//! manager and the node's channel. The controller tracks exactly the
//! subscriptions it added, so teardown never disturbs handlers owned by
//! other controllers on the same channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::alert::AlertHub;
use crate::channel::{EventHandler, HandlerId};
use crate::dispatch::Dispatcher;
use crate::error::Error;

pub struct ToolController {
    dispatcher: Dispatcher,
    alerts: AlertHub,
    working: AtomicBool,
    cancel: Mutex<CancellationToken>,
    subscriptions: Mutex<HashMap<String, HashSet<HandlerId>>>,
}

impl ToolController {
    pub fn new(dispatcher: Dispatcher, alerts: AlertHub) -> Self {
        Self {
            dispatcher,
            alerts,
            working: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a tool run, or stop the current one.
    ///
    /// Calling `start` while a run is active is a stop request (toggle
    /// semantics): the active run is unwound and `false` is returned without
    /// issuing a second dispatch. With no ready session, a user-visible
    /// alert is raised and `false` is returned. Otherwise the dispatch is
    /// awaited; the controller always returns to idle with every
    /// subscription it added removed. `true` only on a successful dispatch.
    pub async fn start(
        &self,
        method: &str,
        params: &[(String, String)],
        subscription: Option<(&str, EventHandler)>,
    ) -> bool {
        if self.working.load(Ordering::SeqCst) {
            self.stop();
            return false;
        }
        if self.dispatcher.sessions().ready_session().is_err() {
            self.alerts.error("Please select a node first");
            return false;
        }

        // Fresh token per run; the previous one may already be canceled.
        let cancel = {
            let mut guard = self.cancel.lock();
            *guard = CancellationToken::new();
            guard.clone()
        };
        self.working.store(true, Ordering::SeqCst);

        if let Some((event, handler)) = subscription {
            self.add_listener(event, handler);
        }

        let result = self.dispatcher.invoke(method, params, &cancel).await;
        // A completed run unwinds exactly like a stopped one.
        self.stop();

        match result {
            Ok(_) => true,
            Err(Error::Canceled) => false,
            Err(Error::RequestFailure { detail, .. }) => {
                self.alerts.error(format!("{} failed: {}", method, detail));
                false
            }
            Err(e) => {
                self.alerts.error(format!("{} failed: {}", method, e));
                false
            }
        }
    }

    /// Stop the current run. Idempotent and safe while idle: clears the
    /// working flag, removes every subscription this controller added, and
    /// cancels the in-flight request.
    pub fn stop(&self) {
        self.working.store(false, Ordering::SeqCst);
        self.remove_all_listeners();
        self.cancel.lock().cancel();
    }

    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    /// Number of subscriptions currently held by this controller.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().values().map(HashSet::len).sum()
    }

    fn add_listener(&self, event: &str, handler: EventHandler) {
        match self.dispatcher.event_source() {
            Ok(channel) => {
                let id = channel.subscribe(event, move |data| handler(data));
                self.subscriptions
                    .lock()
                    .entry(event.to_string())
                    .or_default()
                    .insert(id);
            }
            Err(_) => {
                tracing::warn!(event, "cannot add event listener, no node session");
            }
        }
    }

    fn remove_all_listeners(&self) {
        let taken: HashMap<String, HashSet<HandlerId>> =
            std::mem::take(&mut *self.subscriptions.lock());
        if taken.is_empty() {
            return;
        }
        if let Ok(channel) = self.dispatcher.event_source() {
            for (event, ids) in &taken {
                for id in ids {
                    channel.unsubscribe(event, *id);
                }
            }
        }
        // With no session the channel is already gone, along with its
        // handler table; dropping the ledger is enough.
    }
}

/// Owning UI teardown must never orphan subscriptions or in-flight requests.
impl Drop for ToolController {
    fn drop(&mut self) {
        self.stop();
    }
}
