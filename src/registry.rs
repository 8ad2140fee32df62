//! Node catalogue: fetching, local-node identification, config caching.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::node::{same_origin, Node};
use crate::wire::NodesResponse;

/// Clone-able handle to the node catalogue.
///
/// The catalogue is replaced wholesale on each successful fetch; a failed
/// fetch leaves the previous (stale-but-available) catalogue in place. The
/// "current" node is the catalogue entry whose origin matches the control
/// surface's own origin.
#[derive(Clone)]
pub struct NodeRegistry {
    origin: String,
    http: reqwest::Client,
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    nodes: Vec<Node>,
    current_key: Option<String>,
}

impl NodeRegistry {
    /// `origin` is the control surface's own origin, used both as the
    /// discovery endpoint base and to identify the local node.
    pub fn new(http: reqwest::Client, origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            http,
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Fetch the catalogue from `{origin}/nodes` and re-identify the local
    /// node. On any failure the stored catalogue is left untouched.
    pub async fn fetch(&self) -> Result<Vec<Node>> {
        let url = format!("{}/nodes", self.origin.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Discovery(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::Discovery(format!(
                "{} returned status {}",
                url,
                resp.status()
            )));
        }
        let body: NodesResponse = resp
            .json()
            .await
            .map_err(|e| Error::Discovery(format!("invalid nodes payload: {}", e)))?;
        if !body.success {
            return Err(Error::Discovery("server reported failure".into()));
        }

        let current_key = body
            .nodes
            .iter()
            .find(|n| self.is_current_node(n))
            .map(Node::key);

        let mut inner = self.inner.write();
        inner.nodes = body.nodes.clone();
        inner.current_key = current_key;
        tracing::debug!(count = inner.nodes.len(), "node catalogue refreshed");
        Ok(body.nodes)
    }

    /// True when the node's origin equals the control surface's own origin
    /// (trailing slashes and default ports normalized away).
    pub fn is_current_node(&self, node: &Node) -> bool {
        same_origin(&node.url, &self.origin)
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.inner.read().nodes.clone()
    }

    /// The catalogue entry identified as local, if any.
    pub fn current(&self) -> Option<Node> {
        let inner = self.inner.read();
        let key = inner.current_key.as_deref()?;
        inner.nodes.iter().find(|n| n.key() == key).cloned()
    }

    /// Membership check by identity key; guards against stale references.
    pub fn contains(&self, node: &Node) -> bool {
        let key = node.key();
        self.inner.read().nodes.iter().any(|n| n.key() == key)
    }

    pub fn get(&self, key: &str) -> Option<Node> {
        self.inner.read().nodes.iter().find(|n| n.key() == key).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Node> {
        self.inner.read().nodes.iter().find(|n| n.name == name).cloned()
    }

    /// Attach a handshake-provided config to the catalogue entry so later
    /// display does not need another round-trip.
    pub fn set_config(&self, key: &str, config: serde_json::Map<String, serde_json::Value>) {
        let mut inner = self.inner.write();
        if let Some(node) = inner.nodes.iter_mut().find(|n| n.key() == key) {
            node.config = Some(config);
        }
    }
}
