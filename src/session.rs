//! Session establishment and the selected-node state machine.
//!
//! Selecting a node opens a streaming channel to its `/session` endpoint and
//! waits for two server-pushed events (the session id and the node config)
//! before the session counts as ready. The local node never gets a second
//! channel: selection short-circuits to the process-wide local session.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelStatus, EventChannel};
use crate::error::{Error, Result};
use crate::local::LocalSessionService;
use crate::node::Node;
use crate::registry::NodeRegistry;
use crate::wire::{EVENT_CONFIG, EVENT_SESSION_ID};

/// Deadline for the two-event session handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A successfully established session, before it is installed as active.
pub(crate) struct Established {
    pub session_id: String,
    pub channel: EventChannel,
    pub config: Map<String, Value>,
}

enum HandshakeEvent {
    SessionId(String),
    Config(String),
}

/// Open a channel to `{origin}/session` and wait for both handshake events.
///
/// The server may push `SessionId` and `Config` in either order; whichever
/// arrives first is buffered. On timeout or transport error the channel is
/// closed before the error is returned.
pub(crate) async fn establish_session(
    http: &reqwest::Client,
    origin: &str,
    timeout: Duration,
) -> Result<Established> {
    let url = format!("{}/session", origin.trim_end_matches('/'));
    let channel = EventChannel::connect(http, &url)
        .await
        .map_err(|e| Error::HandshakeError(e.to_string()))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sid_sub = channel.subscribe(EVENT_SESSION_ID, {
        let tx = tx.clone();
        move |data| {
            let _ = tx.send(HandshakeEvent::SessionId(data.to_string()));
        }
    });
    let cfg_sub = channel.subscribe(EVENT_CONFIG, move |data| {
        let _ = tx.send(HandshakeEvent::Config(data.to_string()));
    });

    let mut status = channel.status();
    let deadline = tokio::time::Instant::now() + timeout;
    let mut session_id: Option<String> = None;
    let mut config: Option<Map<String, Value>> = None;

    let outcome = loop {
        if session_id.is_some() && config.is_some() {
            break Ok(());
        }
        if !channel.is_open() {
            break Err(Error::HandshakeError(
                "channel closed during handshake".into(),
            ));
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break Err(Error::HandshakeTimeout),
            changed = status.changed() => {
                if changed.is_err() || *status.borrow() == ChannelStatus::Closed {
                    break Err(Error::HandshakeError("channel closed during handshake".into()));
                }
            }
            event = rx.recv() => match event {
                Some(HandshakeEvent::SessionId(id)) => session_id = Some(id),
                Some(HandshakeEvent::Config(raw)) => match serde_json::from_str(&raw) {
                    Ok(map) => config = Some(map),
                    Err(e) => break Err(Error::HandshakeError(format!("invalid config payload: {}", e))),
                },
                None => break Err(Error::HandshakeError("handshake events dropped".into())),
            },
        }
    };

    channel.unsubscribe(EVENT_SESSION_ID, sid_sub);
    channel.unsubscribe(EVENT_CONFIG, cfg_sub);

    match (outcome, session_id, config) {
        (Ok(()), Some(session_id), Some(config)) => Ok(Established {
            session_id,
            channel,
            config,
        }),
        (Err(e), _, _) => {
            channel.close();
            Err(e)
        }
        _ => {
            channel.close();
            Err(Error::HandshakeError("handshake incomplete".into()))
        }
    }
}

/// Atomic snapshot of the ready state handed to the dispatcher.
#[derive(Clone)]
pub struct ReadySession {
    pub node: Node,
    pub session_id: String,
    pub channel: EventChannel,
    pub local: bool,
    /// Session-scoped cancellation: canceled on teardown so every in-flight
    /// request against this session observes cancellation transport-side.
    pub epoch: CancellationToken,
}

#[derive(Clone)]
struct ActiveSession {
    session_id: String,
    channel: EventChannel,
    local: bool,
    epoch: CancellationToken,
}

#[derive(Default)]
struct Selection {
    selected: Option<Node>,
    session: Option<ActiveSession>,
}

/// Owns node selection and the active session. The dispatcher and tool
/// controllers only ever read snapshots; all mutation happens here, under a
/// single lock, so a half-torn-down session is never observable as ready.
pub struct SessionManager {
    registry: NodeRegistry,
    local: Arc<LocalSessionService>,
    http: reqwest::Client,
    state: RwLock<Selection>,
    handshake_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        http: reqwest::Client,
        registry: NodeRegistry,
        local: Arc<LocalSessionService>,
    ) -> Self {
        Self {
            registry,
            local,
            http,
            state: RwLock::new(Selection::default()),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// Select a node and establish its session.
    ///
    /// Requires the node to be a member of the current catalogue. Re-selecting
    /// the already-active node is a no-op (no duplicate channel). Any failure
    /// rolls selection back to no-node/no-session.
    pub async fn select_node(&self, node: &Node) -> Result<()> {
        if !self.registry.contains(node) {
            return Err(Error::UnknownNode(node.name.clone()));
        }
        let key = node.key();
        {
            let state = self.state.read();
            if state.session.is_some()
                && state.selected.as_ref().map(Node::key) == Some(key.clone())
            {
                return Ok(());
            }
        }

        // Tear down the previous session before any new work begins.
        self.cleanup_session();
        self.state.write().selected = Some(node.clone());

        let established = if self.registry.is_current_node(node) {
            self.adopt_local_session().await
        } else {
            establish_session(&self.http, &node.url, self.handshake_timeout)
                .await
                .map(|est| (est.session_id, est.channel, est.config, false))
        };

        match established {
            Ok((session_id, channel, config, local)) => {
                self.registry.set_config(&key, config);
                let mut state = self.state.write();
                // Selection may have moved on while the handshake ran.
                if state.selected.as_ref().map(Node::key) != Some(key) {
                    if !local {
                        channel.close();
                    }
                    return Err(Error::Canceled);
                }
                tracing::info!(node = %node.name, session = %session_id, "node session ready");
                state.session = Some(ActiveSession {
                    session_id,
                    channel,
                    local,
                    epoch: CancellationToken::new(),
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(node = %node.name, error = %e, "node selection failed");
                let mut state = self.state.write();
                // Roll back only if this call still owns the selection; a
                // concurrent select may have installed its own session.
                if state.selected.as_ref().map(Node::key) == Some(key) {
                    state.selected = None;
                    if let Some(session) = state.session.take() {
                        session.epoch.cancel();
                        if !session.local {
                            session.channel.close();
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// The local node reuses the process-wide session; no new channel.
    async fn adopt_local_session(
        &self,
    ) -> Result<(String, EventChannel, Map<String, Value>, bool)> {
        let session = tokio::time::timeout(self.handshake_timeout, self.local.ready())
            .await
            .map_err(|_| Error::HandshakeTimeout)?
            .ok_or_else(|| Error::HandshakeError("local session service stopped".into()))?;
        Ok((
            session.session_id.clone(),
            session.channel.clone(),
            session.config.clone(),
            true,
        ))
    }

    /// Tear down the active session. The channel is closed unless it belongs
    /// to the local node, whose lifetime is owned by the local service.
    /// Safe to call with no session (no-op).
    pub fn cleanup_session(&self) {
        let taken = self.state.write().session.take();
        if let Some(session) = taken {
            session.epoch.cancel();
            if !session.local {
                session.channel.close();
            }
        }
    }

    /// Ready iff a node is selected and its session id is present.
    pub fn is_ready(&self) -> bool {
        let state = self.state.read();
        state.selected.is_some() && state.session.is_some()
    }

    pub fn has_selected_node(&self) -> bool {
        self.state.read().selected.is_some()
    }

    pub fn selected(&self) -> Option<Node> {
        self.state.read().selected.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state
            .read()
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
    }

    /// Atomic ready snapshot for the dispatcher.
    pub fn ready_session(&self) -> Result<ReadySession> {
        let state = self.state.read();
        match (&state.selected, &state.session) {
            (Some(node), Some(session)) => Ok(ReadySession {
                node: node.clone(),
                session_id: session.session_id.clone(),
                channel: session.channel.clone(),
                local: session.local,
                epoch: session.epoch.clone(),
            }),
            _ => Err(Error::NoSession),
        }
    }

    /// The active channel handle; fails with `NoSession` if none is ready.
    pub fn event_source(&self) -> Result<EventChannel> {
        self.ready_session().map(|s| s.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::sse::{Event, Sse};
    use axum::routing::get;
    use axum::{Json, Router};
    use futures::stream;
    use futures::StreamExt;
    use serde_json::json;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Spawn a node server whose /session pushes the given events and then
    /// keeps the stream open. Counts session connects.
    async fn spawn_node_server(
        events: Vec<(&'static str, String)>,
        connects: Arc<AtomicUsize>,
    ) -> String {
        let app = Router::new().route(
            "/session",
            get(move || {
                connects.fetch_add(1, Ordering::SeqCst);
                let events = events.clone();
                async move {
                    let burst = stream::iter(
                        events
                            .into_iter()
                            .map(|(name, data)| {
                                Ok::<_, Infallible>(Event::default().event(name).data(data))
                            })
                            .collect::<Vec<_>>(),
                    );
                    Sse::new(burst.chain(stream::pending()))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Registry pre-populated with the given nodes via a discovery server.
    async fn registry_with(nodes: Vec<(&str, &str)>) -> NodeRegistry {
        let catalogue: Vec<_> = nodes
            .iter()
            .map(|(name, url)| json!({"name": name, "url": url, "location": "test"}))
            .collect();
        let app = Router::new().route(
            "/nodes",
            get(move || {
                let catalogue = catalogue.clone();
                async move { Json(json!({"success": true, "nodes": catalogue})) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let registry = NodeRegistry::new(reqwest::Client::new(), format!("http://{}", addr));
        registry.fetch().await.unwrap();
        registry
    }

    fn manager(registry: NodeRegistry) -> SessionManager {
        let http = reqwest::Client::new();
        // Local service pointed at an unreachable origin: these tests only
        // exercise remote selection.
        let local = LocalSessionService::spawn(http.clone(), "http://127.0.0.1:1");
        SessionManager::new(http, registry, local)
    }

    fn handshake_events(session: &str) -> Vec<(&'static str, String)> {
        vec![
            ("SessionId", session.to_string()),
            ("Config", r#"{"feature_ping": true}"#.to_string()),
        ]
    }

    #[tokio::test]
    async fn select_rejects_non_member() {
        let registry = registry_with(vec![("fra", "http://203.0.113.10:9100")]).await;
        let mgr = manager(registry);
        let stranger = Node {
            name: "nowhere".into(),
            url: "http://203.0.113.99:9100".into(),
            location: String::new(),
            config: None,
        };
        assert!(matches!(
            mgr.select_node(&stranger).await,
            Err(Error::UnknownNode(_))
        ));
        assert!(!mgr.is_ready());
    }

    #[tokio::test]
    async fn select_establishes_remote_session() {
        let connects = Arc::new(AtomicUsize::new(0));
        let origin = spawn_node_server(handshake_events("sess-1"), connects.clone()).await;
        let registry = registry_with(vec![("fra", origin.as_str())]).await;
        let mgr = manager(registry.clone());

        let node = registry.get_by_name("fra").unwrap();
        mgr.select_node(&node).await.unwrap();

        assert!(mgr.is_ready());
        assert_eq!(mgr.session_id().as_deref(), Some("sess-1"));
        // Handshake config is cached on the catalogue entry.
        let cached = registry.get_by_name("fra").unwrap().config.unwrap();
        assert_eq!(cached.get("feature_ping"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn handshake_order_is_not_significant() {
        let connects = Arc::new(AtomicUsize::new(0));
        let events = vec![
            ("Config", r#"{"feature_ping": false}"#.to_string()),
            ("SessionId", "sess-2".to_string()),
        ];
        let origin = spawn_node_server(events, connects).await;
        let registry = registry_with(vec![("fra", origin.as_str())]).await;
        let mgr = manager(registry.clone());

        let node = registry.get_by_name("fra").unwrap();
        mgr.select_node(&node).await.unwrap();
        assert_eq!(mgr.session_id().as_deref(), Some("sess-2"));
    }

    #[tokio::test]
    async fn reselecting_active_node_opens_no_second_channel() {
        let connects = Arc::new(AtomicUsize::new(0));
        let origin = spawn_node_server(handshake_events("sess-3"), connects.clone()).await;
        let registry = registry_with(vec![("fra", origin.as_str())]).await;
        let mgr = manager(registry.clone());

        let node = registry.get_by_name("fra").unwrap();
        mgr.select_node(&node).await.unwrap();
        mgr.select_node(&node).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_config_event_times_out_and_rolls_back() {
        let connects = Arc::new(AtomicUsize::new(0));
        let events = vec![("SessionId", "half".to_string())];
        let origin = spawn_node_server(events, connects).await;
        let registry = registry_with(vec![("fra", origin.as_str())]).await;
        let mut mgr = manager(registry.clone());
        mgr.handshake_timeout = Duration::from_millis(300);

        let node = registry.get_by_name("fra").unwrap();
        let result = mgr.select_node(&node).await;
        assert!(matches!(result, Err(Error::HandshakeTimeout)));
        assert!(!mgr.has_selected_node());
        assert!(!mgr.is_ready());
        assert!(mgr.session_id().is_none());
    }

    #[tokio::test]
    async fn stream_ending_during_handshake_fails_selection() {
        // /session closes the stream without pushing any events.
        let app = Router::new().route(
            "/session",
            get(|| async { Sse::new(stream::empty::<std::result::Result<Event, Infallible>>()) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let origin = format!("http://{}", addr);

        let registry = registry_with(vec![("fra", origin.as_str())]).await;
        let mut mgr = manager(registry.clone());
        mgr.handshake_timeout = Duration::from_secs(2);

        let node = registry.get_by_name("fra").unwrap();
        let result = mgr.select_node(&node).await;
        assert!(matches!(result, Err(Error::HandshakeError(_))));
        assert!(!mgr.has_selected_node());
    }

    #[tokio::test]
    async fn cleanup_always_yields_not_ready() {
        let connects = Arc::new(AtomicUsize::new(0));
        let origin = spawn_node_server(handshake_events("sess-4"), connects).await;
        let registry = registry_with(vec![("fra", origin.as_str())]).await;
        let mgr = manager(registry.clone());

        // No session yet: cleanup is a no-op.
        mgr.cleanup_session();
        assert!(!mgr.is_ready());

        let node = registry.get_by_name("fra").unwrap();
        mgr.select_node(&node).await.unwrap();
        let channel = mgr.event_source().unwrap();
        assert!(mgr.is_ready());

        mgr.cleanup_session();
        assert!(!mgr.is_ready());
        assert!(matches!(mgr.ready_session(), Err(Error::NoSession)));
        // Non-local channel was actually closed, not just dropped.
        let mut status = channel.status();
        tokio::time::timeout(Duration::from_secs(2), async {
            while *status.borrow() != ChannelStatus::Closed {
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        // Idempotent.
        mgr.cleanup_session();
        assert!(!mgr.is_ready());
    }

    #[tokio::test]
    async fn cleanup_cancels_session_epoch() {
        let connects = Arc::new(AtomicUsize::new(0));
        let origin = spawn_node_server(handshake_events("sess-5"), connects).await;
        let registry = registry_with(vec![("fra", origin.as_str())]).await;
        let mgr = manager(registry.clone());

        let node = registry.get_by_name("fra").unwrap();
        mgr.select_node(&node).await.unwrap();
        let epoch = mgr.ready_session().unwrap().epoch;
        assert!(!epoch.is_cancelled());

        mgr.cleanup_session();
        assert!(epoch.is_cancelled());
    }

    #[tokio::test]
    async fn failed_select_leaves_a_concurrent_winner_intact() {
        // "bad" node: /session stays silent and ends the stream after a
        // delay, so its handshake fails well after "good" has finished.
        let bad_app = Router::new().route(
            "/session",
            get(|| async {
                let quiet = stream::once(async {
                    tokio::time::sleep(Duration::from_millis(600)).await;
                    Ok::<_, Infallible>(Event::default().event("Noise").data("x"))
                });
                Sse::new(quiet)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bad_origin = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, bad_app).await.unwrap();
        });

        let connects = Arc::new(AtomicUsize::new(0));
        let good_origin = spawn_node_server(handshake_events("sess-good"), connects).await;
        let registry = registry_with(vec![
            ("bad", bad_origin.as_str()),
            ("good", good_origin.as_str()),
        ])
        .await;
        let mgr = Arc::new(manager(registry.clone()));

        let bad = registry.get_by_name("bad").unwrap();
        let good = registry.get_by_name("good").unwrap();

        let failing = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.select_node(&bad).await })
        };
        // Let the bad handshake get in flight, then win with the good node.
        tokio::time::sleep(Duration::from_millis(150)).await;
        mgr.select_node(&good).await.unwrap();
        assert_eq!(mgr.session_id().as_deref(), Some("sess-good"));

        let result = tokio::time::timeout(Duration::from_secs(5), failing)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());

        // The late failure must not wipe the established session.
        assert!(mgr.is_ready());
        assert_eq!(mgr.selected().unwrap().name, "good");
        assert_eq!(mgr.session_id().as_deref(), Some("sess-good"));
    }

    #[tokio::test]
    async fn local_channel_survives_switching_away() {
        // One backend serving both discovery and its own session, so the
        // catalogue's first entry is the manager's own origin.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = format!("http://{}", listener.local_addr().unwrap());
        let connects = Arc::new(AtomicUsize::new(0));
        let remote_origin = spawn_node_server(handshake_events("sess-remote"), connects).await;

        let catalogue = json!([
            {"name": "local", "url": origin, "location": "here"},
            {"name": "remote", "url": remote_origin, "location": "there"}
        ]);
        let app = Router::new()
            .route(
                "/nodes",
                get(move || {
                    let catalogue = catalogue.clone();
                    async move { Json(json!({"success": true, "nodes": catalogue})) }
                }),
            )
            .route(
                "/session",
                get(|| async {
                    let burst = stream::iter(vec![
                        Ok::<_, Infallible>(Event::default().event("SessionId").data("sess-local")),
                        Ok(Event::default().event("Config").data("{}")),
                    ]);
                    Sse::new(burst.chain(stream::pending()))
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let http = reqwest::Client::new();
        let registry = NodeRegistry::new(http.clone(), origin.clone());
        registry.fetch().await.unwrap();
        let local = LocalSessionService::spawn(http.clone(), origin);
        let mgr = SessionManager::new(http, registry.clone(), local.clone());

        let local_node = registry.get_by_name("local").unwrap();
        let remote_node = registry.get_by_name("remote").unwrap();
        assert!(registry.is_current_node(&local_node));

        mgr.select_node(&local_node).await.unwrap();
        assert_eq!(mgr.session_id().as_deref(), Some("sess-local"));
        let local_channel = mgr.event_source().unwrap();

        // Switching away tears down the selection but must leave the
        // process-wide local channel open.
        mgr.select_node(&remote_node).await.unwrap();
        assert_eq!(mgr.session_id().as_deref(), Some("sess-remote"));
        assert!(local_channel.is_open());
        assert!(local.current().unwrap().channel.is_open());

        // Re-selecting local adopts the same still-open session.
        mgr.select_node(&local_node).await.unwrap();
        assert_eq!(mgr.session_id().as_deref(), Some("sess-local"));
        assert!(local_channel.is_open());

        // Explicit cleanup of a local selection leaves it open too.
        mgr.cleanup_session();
        assert!(local_channel.is_open());
        local.shutdown();
    }

    #[tokio::test]
    async fn switching_nodes_tears_down_previous_session() {
        let connects_a = Arc::new(AtomicUsize::new(0));
        let connects_b = Arc::new(AtomicUsize::new(0));
        let origin_a = spawn_node_server(handshake_events("sess-a"), connects_a).await;
        let origin_b = spawn_node_server(handshake_events("sess-b"), connects_b).await;
        let registry =
            registry_with(vec![("a", origin_a.as_str()), ("b", origin_b.as_str())]).await;
        let mgr = manager(registry.clone());

        let a = registry.get_by_name("a").unwrap();
        let b = registry.get_by_name("b").unwrap();

        mgr.select_node(&a).await.unwrap();
        let channel_a = mgr.event_source().unwrap();
        let epoch_a = mgr.ready_session().unwrap().epoch;

        mgr.select_node(&b).await.unwrap();
        assert_eq!(mgr.session_id().as_deref(), Some("sess-b"));
        assert!(epoch_a.is_cancelled());
        let mut status = channel_a.status();
        tokio::time::timeout(Duration::from_secs(2), async {
            while *status.borrow() != ChannelStatus::Closed {
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }
}
