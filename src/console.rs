//! Top-level wiring: one [`NodeConsole`] per control surface.

use std::sync::Arc;

use crate::alert::AlertHub;
use crate::config::ConsoleConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::latency::LatencyProber;
use crate::local::LocalSessionService;
use crate::registry::NodeRegistry;
use crate::session::SessionManager;
use crate::tool::ToolController;

pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:9100";

/// Owns the shared HTTP client and every long-lived component. Cheap to
/// clone via the Arc-backed handles it exposes; UI surfaces hold one of
/// these and build [`ToolController`]s from it as needed.
pub struct NodeConsole {
    registry: NodeRegistry,
    prober: LatencyProber,
    local: Arc<LocalSessionService>,
    sessions: Arc<SessionManager>,
    dispatcher: Dispatcher,
    alerts: AlertHub,
}

impl NodeConsole {
    pub fn new(config: &ConsoleConfig) -> Result<Self> {
        let origin = config
            .origin
            .clone()
            .unwrap_or_else(|| DEFAULT_ORIGIN.to_string());
        let http = reqwest::Client::builder()
            .user_agent(concat!("probelink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Channel(format!("http client: {}", e)))?;

        let registry = NodeRegistry::new(http.clone(), origin.clone());
        let prober = LatencyProber::new(http.clone(), registry.clone());
        let local = LocalSessionService::spawn(http.clone(), origin);
        let sessions = Arc::new(SessionManager::new(
            http.clone(),
            registry.clone(),
            local.clone(),
        ));
        let dispatcher = Dispatcher::new(http, sessions.clone(), local.clone());

        Ok(Self {
            registry,
            prober,
            local,
            sessions,
            dispatcher,
            alerts: AlertHub::new(),
        })
    }

    /// Refresh the catalogue, auto-select the local node if nothing is
    /// selected yet, then run a full latency sweep.
    ///
    /// A failed auto-select is reported through the alert hub but does not
    /// fail the refresh; the sweep still runs over the new catalogue.
    pub async fn refresh_nodes(&self) -> Result<()> {
        self.registry.fetch().await?;

        if !self.sessions.has_selected_node() {
            if let Some(local) = self.registry.current() {
                if let Err(e) = self.sessions.select_node(&local).await {
                    self.alerts
                        .error(format!("Failed to connect to {}: {}", local.name, e));
                }
            }
        }

        self.prober.probe_all().await;
        Ok(())
    }

    /// Build a tool controller bound to this console's dispatcher and alerts.
    pub fn controller(&self) -> ToolController {
        ToolController::new(self.dispatcher.clone(), self.alerts.clone())
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn prober(&self) -> &LatencyProber {
        &self.prober
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn local(&self) -> &Arc<LocalSessionService> {
        &self.local
    }

    pub fn alerts(&self) -> &AlertHub {
        &self.alerts
    }

    /// Tear down the active session and stop the local service.
    pub fn shutdown(&self) {
        self.sessions.cleanup_session();
        self.local.shutdown();
    }
}
