//! probelink - command-line console for a looking-glass node network.
//!
//! Talks to a control-surface backend, lists its diagnostic nodes, probes
//! their latency, and runs diagnostic tools on a selected node while
//! streaming their output.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser as ClapParser, Subcommand};
use probelink::channel::EventHandler;
use probelink::{wire, AlertLevel, ConsoleConfig, NodeConsole};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// probelink - looking-glass node console
#[derive(ClapParser, Debug)]
#[command(name = "probelink", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Origin of the control-surface backend (overrides the config file)
    #[arg(long, env = "PROBELINK_ORIGIN")]
    origin: Option<String>,

    /// Path to the TOML config file
    #[arg(long, default_value = "probelink.toml")]
    config: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the node catalogue with a full latency sweep
    Nodes,

    /// Re-probe a single node's latency
    Ping {
        /// Node name
        name: String,
    },

    /// Run a diagnostic tool on a node and stream its output
    Run {
        /// Node name to run against
        node: String,

        /// Tool method, e.g. "ping", "traceroute", "mtr"
        method: String,

        /// Tool parameters as key=value pairs
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,

        /// Named output event to stream (defaults to the capitalized method)
        #[arg(long)]
        event: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ConsoleConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?
        .unwrap_or_default();
    if cli.origin.is_some() {
        config.origin = cli.origin.clone();
    }

    init_tracing(config.log_filter.as_deref());

    let console = NodeConsole::new(&config).context("building console")?;
    let result = match cli.command {
        Commands::Nodes => run_nodes(&console).await,
        Commands::Ping { name } => run_ping(&console, &name).await,
        Commands::Run {
            node,
            method,
            params,
            event,
        } => run_tool(&console, &node, &method, &params, event.as_deref()).await,
    };
    console.shutdown();
    result
}

fn init_tracing(config_filter: Option<&str>) {
    let default = config_filter.unwrap_or("probelink=info");
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_nodes(console: &NodeConsole) -> anyhow::Result<()> {
    console.refresh_nodes().await.context("fetching nodes")?;

    let nodes = console.registry().nodes();
    if nodes.is_empty() {
        println!("No nodes in catalogue.");
        return Ok(());
    }

    println!(
        "{:<16} {:<24} {:<10} {:<10} {}",
        "NAME", "LOCATION", "LATENCY", "HEALTH", ""
    );
    for node in &nodes {
        let (latency, health) = match console.prober().record(&node.key()) {
            Some(record) if record.latency_ms >= 0 => {
                (format!("{} ms", record.latency_ms), record.tier.label())
            }
            Some(record) => ("-".to_string(), record.tier.label()),
            None => ("-".to_string(), "-"),
        };
        let marker = if console.registry().is_current_node(node) {
            "(local)"
        } else {
            ""
        };
        println!(
            "{:<16} {:<24} {:<10} {:<10} {}",
            node.name, node.location, latency, health, marker
        );
    }
    Ok(())
}

async fn run_ping(console: &NodeConsole, name: &str) -> anyhow::Result<()> {
    console.registry().fetch().await.context("fetching nodes")?;
    let node = console
        .registry()
        .get_by_name(name)
        .with_context(|| format!("no node named '{}'", name))?;

    console.prober().ping_single(&node).await;
    match console.prober().record(&node.key()) {
        Some(record) if record.latency_ms >= 0 => {
            println!("{}: {} ms ({})", node.name, record.latency_ms, record.tier.label());
        }
        _ => println!("{}: unreachable", node.name),
    }
    Ok(())
}

async fn run_tool(
    console: &NodeConsole,
    node_name: &str,
    method: &str,
    raw_params: &[String],
    event: Option<&str>,
) -> anyhow::Result<()> {
    let params = parse_params(raw_params)?;

    console.registry().fetch().await.context("fetching nodes")?;
    let node = console
        .registry()
        .get_by_name(node_name)
        .with_context(|| format!("no node named '{}'", node_name))?;
    console
        .sessions()
        .select_node(&node)
        .await
        .with_context(|| format!("connecting to {}", node.name))?;
    tracing::info!(node = %node.name, method, "session ready, running tool");

    // Alerts go to stderr so streamed output stays clean on stdout.
    let mut alerts = console.alerts().subscribe();
    let alert_task = tokio::spawn(async move {
        while let Ok(alert) = alerts.recv().await {
            match alert.level {
                AlertLevel::Info => eprintln!("probelink: {}", alert.message),
                AlertLevel::Error => eprintln!("probelink: error: {}", alert.message),
            }
        }
    });

    let event = event
        .map(str::to_string)
        .unwrap_or_else(|| capitalize(method));
    let handler: EventHandler = Arc::new(|data: &str| {
        println!("{}", wire::event_output(data));
    });

    let controller = console.controller();
    let run = controller.start(method, &params, Some((event.as_str(), handler)));

    let ok = tokio::select! {
        ok = run => ok,
        _ = tokio::signal::ctrl_c() => {
            controller.stop();
            eprintln!("probelink: interrupted");
            false
        }
    };
    alert_task.abort();

    if !ok {
        anyhow::bail!("{} did not complete successfully", method);
    }
    Ok(())
}

fn parse_params(raw: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("expected key=value, got '{}'", pair))
        })
        .collect()
}

fn capitalize(method: &str) -> String {
    let mut chars = method.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
