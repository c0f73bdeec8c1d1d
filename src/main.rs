//! CLI Entry Point for fieldlog
//!
//! Runs the node against the simulated backplane so the whole pipeline —
//! discovery, bus sequencing, query passes, frame assembly — can be
//! exercised without hardware:
//!
//! ```bash
//! fieldlog probe                 # discovery scan, print the binding table
//! fieldlog cycle --passes 3      # discovery + init + measurement cycles
//! fieldlog cycle --config node.toml
//! ```
//!
//! A hardware build swaps the sim factories and backplane for real
//! adapters at this composition root; nothing below main() changes.

use anyhow::Result;
use clap::{Parser, Subcommand};
use fieldlog::config::NodeConfig;
use fieldlog::logging::{self, OutputFormat};
use fieldlog::node::SensorNode;
use fieldlog::registry::CandidateRegistry;
use fieldlog::sim::{SimBackplane, SimCoreMonitor, SimHubFactory, SimLeafFactory};
use fieldlog::uplink::LogTransport;
use fieldlog::DeviceCaps;
use std::path::PathBuf;
use std::sync::Arc;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Demo topology used when no config file is given: two hubs, three leaf
/// sensors, one declared-but-absent candidate to light the missing flag.
const DEMO_CONFIG: &str = r#"
[node]
name = "demo-node"
hub_slots = 4
max_message_length = 512

[[hubs]]
id = "hub-east"
type = "sim_hub"
interface = "i2c"
config = { slot = 1, ports = 2, interface = "i2c", name = "hub-east" }

[[hubs]]
id = "hub-west"
type = "sim_hub"
interface = "serial_bus"
config = { slot = 3, ports = 4, interface = "serial_bus", name = "hub-west" }

[[sensors]]
id = "soil-a"
type = "sim_leaf"
interface = "i2c"
config = { hub_slot = 1, port = 1, name = "soil-a", fields = ["vwc", "temp_c"], values = [0.31, 18.2], noise = 0.02, seed = 11 }

[[sensors]]
id = "wind"
type = "sim_leaf"
interface = "serial_bus"
keep_powered = true
config = { hub_slot = 3, port = 2, name = "wind", fields = ["speed_ms", "dir_deg"], values = [4.2, 181.0], noise = 0.5, seed = 12 }

[[sensors]]
id = "snow-depth"
type = "sim_leaf"
interface = "serial_bus"
config = { hub_slot = 0, port = 0, name = "snow-depth", fields = ["depth_cm"] }
"#;

#[derive(Parser)]
#[command(name = "fieldlog")]
#[command(about = "Modular sensing-node data logger (simulated hardware)", long_about = None)]
struct Cli {
    /// Node configuration file (TOML); a demo topology is used if omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run discovery once and print the binding table
    Probe,

    /// Run discovery, the init pass, and measurement cycles
    Cycle {
        /// Number of measurement cycles to run
        #[arg(long, default_value = "1")]
        passes: u32,

        /// Also emit the metadata pass after the cycles
        #[arg(long)]
        metadata: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => NodeConfig::load_from(path)?,
        None => NodeConfig::load_str(DEMO_CONFIG)?,
    };
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    logging::init(&config.node.log_level, OutputFormat::Pretty)
        .map_err(|e| anyhow::anyhow!(e))?;

    let mut node = build_node(config).await?;

    match cli.command {
        Commands::Probe => probe(&mut node).await,
        Commands::Cycle { passes, metadata } => cycle(&mut node, passes, metadata).await,
    }

    Ok(())
}

async fn build_node(config: NodeConfig) -> Result<SensorNode> {
    let backplane = SimBackplane::new(config.node.hub_slots);
    let mut registry = CandidateRegistry::new();
    registry.register_factory(Box::new(SimHubFactory::new(backplane.clone())));
    registry.register_factory(Box::new(SimLeafFactory::new(backplane.clone())));

    let mut node = SensorNode::build(config, &registry, backplane, Arc::new(LogTransport)).await?;

    let monitor = SimCoreMonitor::new(3.92);
    node.add_core_device(
        "controller",
        DeviceCaps::new()
            .with_telemetry(monitor.clone())
            .with_diagnostics(monitor.clone())
            .with_metadata(monitor),
    );
    Ok(node)
}

async fn probe(node: &mut SensorNode) {
    println!("🔍 Scanning slots and sub-ports...");
    let outcome = node.discover().await;

    println!();
    println!(
        "{:<14} {:<6} {:<12} {:<10} {}",
        "DEVICE", "KIND", "INTERFACE", "POSITION", "ERRORS"
    );
    let table = node.table();
    for idx in table.indices() {
        let record = table.record(idx);
        let position = record
            .position
            .map(|p| p.to_string())
            .unwrap_or_else(|| "—".to_string());
        println!(
            "{:<14} {:<6} {:<12} {:<10} {}",
            record.name,
            format!("{:?}", record.kind).to_lowercase(),
            record.interface.label(),
            position,
            record.error_count,
        );
    }

    println!();
    if outcome.missing {
        println!("⚠️  {} hub(s), {} sensor(s) bound; some candidates missing", outcome.hubs_bound, outcome.sensors_bound);
    } else {
        println!("✅ {} hub(s), {} sensor(s) bound", outcome.hubs_bound, outcome.sensors_bound);
    }
}

async fn cycle(node: &mut SensorNode, passes: u32, metadata: bool) {
    let outcome = node.discover().await;
    println!(
        "🔍 Discovery: {} hub(s), {} sensor(s){}",
        outcome.hubs_bound,
        outcome.sensors_bound,
        if outcome.missing { " — some missing" } else { "" }
    );

    node.run_init_pass().await;

    for pass in 1..=passes {
        println!("📦 Measurement cycle {pass}/{passes}");
        node.run_cycle().await;
    }

    if metadata {
        node.send_metadata().await;
    }

    let status = node.status();
    if status.critical_fault {
        println!("❌ Critical fault reported during init");
    } else if status.missing_sensor || status.recoverable_fault {
        println!("⚠️  Degraded: missing={} recoverable={}", status.missing_sensor, status.recoverable_fault);
    } else {
        println!("✅ Node healthy");
    }
}
