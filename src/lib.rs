//! probelink - node session and dispatch layer for a looking-glass console.
//!
//! A looking-glass deployment is a set of diagnostic nodes, each exposing the
//! same small HTTP surface: node discovery, a latency endpoint, a streaming
//! session endpoint, and per-tool command endpoints. This crate is the client
//! side of that surface: it maintains the node catalogue, probes latency,
//! establishes per-node sessions over server-pushed event streams, and
//! dispatches tool invocations against whichever node is selected.
//!
//! [`console::NodeConsole`] is the assembled stack; the individual layers are
//! usable on their own.

pub mod alert;
pub mod channel;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod error;
pub mod latency;
pub mod local;
pub mod node;
pub mod registry;
pub mod session;
pub mod sse;
pub mod tool;
pub mod wire;

pub use alert::{Alert, AlertHub, AlertLevel};
pub use config::ConsoleConfig;
pub use console::NodeConsole;
pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use latency::{LatencyProber, LatencyRecord, Tier};
pub use node::Node;
pub use registry::NodeRegistry;
pub use session::SessionManager;
pub use tool::ToolController;
