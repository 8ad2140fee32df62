//! Round-trip latency probing and health-tier classification.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;

use crate::node::Node;
use crate::registry::NodeRegistry;
use crate::wire::LatencyResponse;

/// Per-probe timeout. A node that cannot answer within this is offline as
/// far as the display is concerned.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pacing delay between sequential probes. Keeps ordering deterministic and
/// avoids a thundering herd of simultaneous cross-origin requests.
pub const PROBE_PACING: Duration = Duration::from_millis(100);

/// Coarse latency health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Good,
    Medium,
    High,
    Error,
}

impl Tier {
    /// Classify a successful round-trip time in milliseconds.
    pub fn classify(latency_ms: i64) -> Self {
        if latency_ms < 200 {
            Tier::Good
        } else if latency_ms < 500 {
            Tier::Medium
        } else {
            Tier::High
        }
    }

    /// Display label matching what the control surface shows.
    pub fn label(&self) -> &'static str {
        match self {
            Tier::Good => "Excellent",
            Tier::Medium => "Good",
            Tier::High => "Slow",
            Tier::Error => "Offline",
        }
    }
}

/// Transient probe result, overwritten on every probe. No history kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencyRecord {
    /// Wall-clock round trip in milliseconds; -1 means unreachable.
    pub latency_ms: i64,
    pub tier: Tier,
}

impl LatencyRecord {
    fn unreachable() -> Self {
        Self {
            latency_ms: -1,
            tier: Tier::Error,
        }
    }
}

#[derive(Clone)]
pub struct LatencyProber {
    registry: NodeRegistry,
    http: reqwest::Client,
    records: Arc<RwLock<HashMap<String, LatencyRecord>>>,
    pinging: Arc<RwLock<HashSet<String>>>,
    busy: Arc<AtomicBool>,
}

impl LatencyProber {
    pub fn new(http: reqwest::Client, registry: NodeRegistry) -> Self {
        Self {
            registry,
            http,
            records: Arc::new(RwLock::new(HashMap::new())),
            pinging: Arc::new(RwLock::new(HashSet::new())),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// One timestamped round-trip probe. Failures (timeout, transport error,
    /// non-success payload) are absorbed into the record; this never fails.
    pub async fn probe_node(&self, node: &Node) {
        let record = self.measure(node).await;
        if record.tier == Tier::Error {
            tracing::debug!(node = %node.name, "latency probe failed");
        }
        self.records.write().insert(node.key(), record);
    }

    async fn measure(&self, node: &Node) -> LatencyRecord {
        // Local probes go through the control surface's own introspection
        // path rather than back out through the node's public origin.
        let base = if self.registry.is_current_node(node) {
            self.registry.origin()
        } else {
            node.url.as_str()
        };
        let url = format!("{}/nodes/latency", base.trim_end_matches('/'));
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        let started = Instant::now();
        let resp = match self
            .http
            .get(&url)
            .query(&[("timestamp", timestamp.to_string())])
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            _ => return LatencyRecord::unreachable(),
        };
        let body: LatencyResponse = match resp.json().await {
            Ok(body) => body,
            Err(_) => return LatencyRecord::unreachable(),
        };
        if !body.success {
            return LatencyRecord::unreachable();
        }

        let latency_ms = started.elapsed().as_millis() as i64;
        LatencyRecord {
            latency_ms,
            tier: Tier::classify(latency_ms),
        }
    }

    /// Probe every catalogue entry strictly sequentially, in registry order,
    /// with a fixed pacing delay after each probe. Sets the busy flag for
    /// the duration.
    pub async fn probe_all(&self) {
        let nodes = self.registry.nodes();
        if nodes.is_empty() {
            return;
        }

        self.busy.store(true, Ordering::SeqCst);
        for node in &nodes {
            self.probe_node(node).await;
            tokio::time::sleep(PROBE_PACING).await;
        }
        self.busy.store(false, Ordering::SeqCst);
    }

    /// On-demand single re-probe with a per-node probing flag, so the
    /// presentation layer can show a spinner independent of the global
    /// busy flag.
    pub async fn ping_single(&self, node: &Node) {
        let key = node.key();
        self.pinging.write().insert(key.clone());
        self.probe_node(node).await;
        self.pinging.write().remove(&key);
    }

    pub fn record(&self, key: &str) -> Option<LatencyRecord> {
        self.records.read().get(key).copied()
    }

    pub fn records(&self) -> HashMap<String, LatencyRecord> {
        self.records.read().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn is_probing(&self, key: &str) -> bool {
        self.pinging.read().contains(key)
    }
}
