//! Command line entry point for the LPWAN simulator.

use clap::Parser;
use lpwansim_phy::airtime_ticks;
use lpwansim_radio::{RadioParams, WakeUpRadioParams};
use lpwansim_runner::{
    build_simulation, AlohaStats, Protocol, RunnerError, ScenarioConfig, Topology,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Tick-synchronous LPWAN network simulator.
#[derive(Debug, Parser)]
#[command(name = "lpwansim", version, about)]
struct Args {
    /// Topology file (JSON with Nodes, Gateways and optional Relays).
    #[arg(long)]
    topology: PathBuf,

    /// LoRa radio parameter file (JSON).
    #[arg(long)]
    radio_params: PathBuf,

    /// Wake-up radio parameter file (JSON); required for multihop runs.
    #[arg(long)]
    wakeup_params: Option<PathBuf>,

    /// Protocol family to run.
    #[arg(long, value_enum, default_value_t = Protocol::ClassA)]
    protocol: Protocol,

    /// Ticks to simulate per run (one tick is one millisecond).
    #[arg(long, default_value_t = 600_000)]
    ticks: u64,

    /// Generation probabilities to sweep, one run each.
    #[arg(long, value_delimiter = ',', default_values_t = [0.001])]
    gen_probability: Vec<f64>,

    /// Run seed.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Cluster channel assigned by multihop gateways.
    #[arg(long, default_value_t = 4)]
    cluster_channel: u8,

    /// Skip the join procedure; nodes start joined (pure ALOHA runs).
    #[arg(long)]
    disable_join: bool,

    /// Skip the Rx1/Rx2 windows after data uplinks.
    #[arg(long)]
    disable_receive_windows: bool,

    /// Where to write the JSON report; stdout when omitted.
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), RunnerError> {
    let topology = Topology::load(&args.topology)?;
    let radio_params = RadioParams::load(&args.radio_params)?;
    let wakeup_params = match &args.wakeup_params {
        Some(path) => Some(WakeUpRadioParams::load(path)?),
        None => None,
    };

    // Normalize throughput to one uplink airtime at the default tuning.
    let slot_ticks = airtime_ticks(
        ScenarioConfig::default().node_config.message.len(),
        radio_params.sf,
        radio_params.bandwidth,
    )
    .max(1);

    let mut node_config = ScenarioConfig::default().node_config;
    node_config.join_enabled = !args.disable_join;
    node_config.receiving_windows_enabled = !args.disable_receive_windows;

    let mut stats = AlohaStats::new();
    for &gen_probability in &args.gen_probability {
        let scenario = ScenarioConfig {
            protocol: args.protocol,
            gen_probability,
            seed: args.seed,
            cluster_channel: args.cluster_channel,
            node_config: node_config.clone(),
        };
        let mut sim = build_simulation(&topology, &radio_params, wakeup_params.as_ref(), &scenario)?;
        let report = sim.run(args.ticks)?;
        info!(
            gen_probability,
            generated = report.generated_packets,
            received = report.unique_received_packets,
            joined = report.joined_devices,
            delivery_ratio = report.delivery_ratio,
            "run finished"
        );
        let sources = (topology.nodes.len() + topology.relays.len()) as u64;
        stats.add_run(
            gen_probability,
            sources,
            args.ticks,
            slot_ticks,
            report.generated_packets,
            report.unique_received_packets,
        );
    }

    match &args.report {
        Some(path) => stats.write(path)?,
        None => println!("{}", serde_json::to_string_pretty(&stats)?),
    }
    Ok(())
}
