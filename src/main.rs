//! Pico Telemetry - device metrics agent binary.
//!
//! Associates with WiFi, opens an MQTT session and publishes a metrics
//! snapshot every interval until interrupted.

use clap::{Args, Parser, Subcommand};
use futures_util::FutureExt;
use pico_telemetry::{
    platform::{
        host::{HostBoard, HostHeap, HostRadio},
        sim::{SimBoard, SimHeap, SimRadio},
        Board, Heap, Radio,
    },
    supervisor::{CRASH_RESTART_DELAY, FATAL_RESTART_DELAY},
    transport::{mqtt::MqttBroker, sim::SimBroker},
    error::panic_message,
    AgentConfig, AgentError, BrokerClient, CategorySet, FailureCounters, LinkManager,
    MetricsCollector, Supervisor, DEFAULT_BROKER_PORT, DEFAULT_PUBLISH_INTERVAL_SECS,
};
use std::panic::AssertUnwindSafe;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "pico_telemetry")]
#[command(about = "Device telemetry agent publishing sensor snapshots over MQTT")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = "Keeps a WiFi association and an MQTT session alive and publishes a metrics snapshot on a fixed interval")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// WiFi network name
    #[arg(long, env = "WIFI_SSID", default_value = "")]
    ssid: String,

    /// WiFi passphrase
    #[arg(long, env = "WIFI_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Wireless interface (host backend)
    #[arg(long, default_value = "wlan0")]
    interface: String,

    /// MQTT broker host
    #[arg(long, env = "MQTT_SERVER", default_value = "localhost")]
    broker_host: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = DEFAULT_BROKER_PORT)]
    broker_port: u16,

    /// MQTT client identifier
    #[arg(long, env = "CLIENT_ID", default_value = "pico-telemetry")]
    client_id: String,

    /// Topic snapshots are published under
    #[arg(long, env = "MQTT_TOPIC", default_value = "pico/metrics")]
    topic: String,

    /// Seconds between publish cycles
    #[arg(short, long, env = "PUBLISH_INTERVAL", default_value_t = DEFAULT_PUBLISH_INTERVAL_SECS)]
    interval: u64,

    /// Publish only memory, network, identity and GC metrics
    #[arg(long)]
    minimal: bool,

    /// Probe heap fragmentation by allocating half the free heap each cycle
    #[arg(long)]
    fragmentation_probe: bool,

    /// Use the scripted simulator instead of host hardware and a real broker
    #[arg(long)]
    simulate: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the telemetry loop (default)
    Run,

    /// Collect a single snapshot, print it and exit
    Snapshot(SnapshotArgs),
}

#[derive(Args)]
struct SnapshotArgs {
    /// Pretty-print the JSON
    #[arg(long)]
    pretty: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;

    let config = build_config(&cli);
    match &cli.command {
        Some(Commands::Snapshot(args)) => {
            if cli.simulate {
                snapshot_command(&config, args, SimRadio::associated(), SimBoard::new(), SimHeap::new())
            } else {
                snapshot_command(&config, args, HostRadio::new(&cli.interface), HostBoard::new(), HostHeap::new())
            }
        }
        Some(Commands::Run) | None => {
            if !cli.simulate {
                config.validate()?;
            }
            print_banner();
            info!("Publishing to {} on {}", config.topic, config.broker_address());
            if cli.simulate {
                info!("Running against the simulator");
                let supervisor = Supervisor::new(&config, SimRadio::new(), SimBroker::new(), SimBoard::new(), SimHeap::new());
                drive(supervisor, &config).await
            } else {
                let broker = MqttBroker::new(&config);
                let supervisor = Supervisor::new(
                    &config,
                    HostRadio::new(&cli.interface),
                    broker,
                    HostBoard::new(),
                    HostHeap::new(),
                );
                drive(supervisor, &config).await
            }
        }
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

fn print_banner() {
    println!("{}", "=".repeat(50));
    println!("Pico Telemetry - Device Monitoring Agent");
    println!("   Version: {}", env!("CARGO_PKG_VERSION"));
    println!("{}", "=".repeat(50));
    println!();
}

fn build_config(cli: &Cli) -> AgentConfig {
    let categories = if cli.minimal {
        CategorySet::minimal()
    } else {
        CategorySet::full()
    };

    AgentConfig::new(&cli.ssid, &cli.password, &cli.broker_host)
        .with_broker_port(cli.broker_port)
        .with_client_id(&cli.client_id)
        .with_topic(&cli.topic)
        .with_publish_interval(cli.interval)
        .with_categories(categories)
        .with_fragmentation_probe(cli.fragmentation_probe)
}

/// Initialize and run the loop until interrupted. Failures end in a device reset.
async fn drive<R, C, B, H>(mut supervisor: Supervisor<R, C, B, H>, config: &AgentConfig) -> anyhow::Result<()>
where
    R: Radio,
    C: BrokerClient,
    B: Board,
    H: Heap,
{
    let outcome = tokio::select! {
        outcome = AssertUnwindSafe(supervise(&mut supervisor)).catch_unwind() => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };

    match outcome {
        None => {
            info!("Stopped by user");
            Ok(())
        }
        Some(Ok(err)) => {
            error!("[FATAL] {}", err);
            error!("Please check:");
            error!("  1. WiFi credentials (--ssid / --password)");
            error!("  2. MQTT broker is running at {}", config.broker_address());
            error!("  3. Network connectivity");
            error!("Rebooting in {} seconds...", FATAL_RESTART_DELAY.as_secs());
            tokio::time::sleep(FATAL_RESTART_DELAY).await;
            supervisor.reset_device()
        }
        Some(Err(panic)) => {
            error!("[CRITICAL ERROR] {}", panic_message(panic.as_ref()));
            error!("Rebooting in {} seconds...", CRASH_RESTART_DELAY.as_secs());
            tokio::time::sleep(CRASH_RESTART_DELAY).await;
            supervisor.reset_device()
        }
    }
}

/// Returns only when initialization fails. Iteration panics are recovered
/// inside the loop, so only a panic during bring-up unwinds out of here.
async fn supervise<R, C, B, H>(supervisor: &mut Supervisor<R, C, B, H>) -> AgentError
where
    R: Radio,
    C: BrokerClient,
    B: Board,
    H: Heap,
{
    if let Err(err) = supervisor.init().await {
        return err;
    }
    match supervisor.run().await {}
}

fn snapshot_command<R: Radio, B: Board, H: Heap>(
    config: &AgentConfig,
    args: &SnapshotArgs,
    radio: R,
    board: B,
    heap: H,
) -> anyhow::Result<()> {
    let link = LinkManager::from_config(radio, config);
    let mut collector = MetricsCollector::from_config(board, heap, config);
    let snapshot = collector.snapshot(&link, &FailureCounters::default())?;

    let json = if args.pretty {
        serde_json::to_string_pretty(&snapshot)?
    } else {
        serde_json::to_string(&snapshot)?
    };
    println!("{}", json);

    Ok(())
}
