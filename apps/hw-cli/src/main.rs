use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};

use device_registry as devreg;
use hardware_hub as hub;
use hub::{BusPort, Fanout, HubMetrics, JointCommand, JointView, TelemetrySink, TracingSink};
use servo_transport::{MockBus, PortInfo, ServoBus, MAX_DEVICE_ID};

#[derive(Parser, Debug)]
#[command(
    name = "srhw",
    version,
    about = "Saorsa Robotics servo bus tool",
    disable_help_subcommand = true
)]
struct Cli {
    /// Simulate every declared bus instead of opening serial adapters
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Pose {
    /// Hold the pose read at startup
    Hold,
    /// All joints to 0 rad
    Zero,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports
    Ports,
    /// Load and validate a hardware config
    Validate {
        #[arg(long)]
        config: String,
        /// Print the parsed config as JSON
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Ping the declared devices (or every address with --scan)
    Ping {
        #[arg(long)]
        config: String,
        /// Only this bus
        #[arg(long)]
        bus: Option<String>,
        #[arg(long, action = ArgAction::SetTrue)]
        scan: bool,
    },
    /// Run discovery and print the bindings
    Discover {
        #[arg(long)]
        config: String,
        /// Give up after this many failed passes
        #[arg(long)]
        attempts: Option<u32>,
    },
    /// Bring the hardware up and run read/write cycles
    Run {
        #[arg(long)]
        config: String,
        #[arg(long, default_value_t = 100u64)]
        cycles: u64,
        #[arg(long, default_value_t = 100.0)]
        rate_hz: f64,
        #[arg(long, value_enum, default_value = "hold")]
        pose: Pose,
        /// Profile velocity for the pose in rad/s (unlimited if omitted)
        #[arg(long)]
        velocity: Option<f64>,
        /// Print prometheus metrics after the run
        #[arg(long, action = ArgAction::SetTrue)]
        metrics: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ports => list_ports(cli.mock),
        Commands::Validate { config, json } => validate(&config, json),
        Commands::Ping { config, bus, scan } => ping(&config, bus.as_deref(), scan, cli.mock),
        Commands::Discover { config, attempts } => discover(&config, attempts, cli.mock).await,
        Commands::Run {
            config,
            cycles,
            rate_hz,
            pose,
            velocity,
            metrics,
        } => run(&config, cycles, rate_hz, pose, velocity, metrics, cli.mock).await,
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load(path: &str) -> Result<devreg::HardwareConfig> {
    devreg::load_config_file(path)
}

fn open_buses(cfg: &devreg::HardwareConfig, mock: bool) -> Result<Vec<BusPort>> {
    if mock {
        let (ports, _) = hub::simulated_ports(cfg);
        return Ok(ports);
    }
    open_serial_buses(cfg)
}

#[cfg(feature = "serial")]
fn open_serial_buses(cfg: &devreg::HardwareConfig) -> Result<Vec<BusPort>> {
    Ok(hub::open_ports(&cfg.ports, hub::open_serial)?)
}

#[cfg(not(feature = "serial"))]
fn open_serial_buses(_cfg: &devreg::HardwareConfig) -> Result<Vec<BusPort>> {
    Err(anyhow!(
        "built without serial support; rebuild with --features serial or pass --mock"
    ))
}

#[cfg(feature = "serial")]
fn serial_ports() -> Result<Vec<PortInfo>> {
    Ok(servo_transport::SerialServoBus::list()?)
}

#[cfg(not(feature = "serial"))]
fn serial_ports() -> Result<Vec<PortInfo>> {
    Err(anyhow!("built without serial support"))
}

fn list_ports(mock: bool) -> Result<()> {
    let ports = if mock {
        MockBus::list()?
    } else {
        serial_ports()?
    };
    if ports.is_empty() {
        println!("no ports found");
    }
    for p in ports {
        println!("{}\t{}", p.name, p.driver);
    }
    Ok(())
}

fn validate(path: &str, json: bool) -> Result<()> {
    let cfg = load(path)?;
    println!(
        "ok: {} ports, {} devices, {} joints",
        cfg.ports.len(),
        cfg.devices.len(),
        cfg.joint_names().len()
    );
    if json {
        println!("{}", serde_json::to_string_pretty(&cfg)?);
    }
    Ok(())
}

fn ping(path: &str, only: Option<&str>, scan: bool, mock: bool) -> Result<()> {
    let cfg = load(path)?;
    for mut port in open_buses(&cfg, mock)? {
        if only.is_some_and(|b| b != port.name) {
            continue;
        }
        let ids: Vec<u8> = if scan {
            (0..=MAX_DEVICE_ID).collect()
        } else {
            cfg.devices_on(&port.name)
                .iter()
                .map(|d| d.address)
                .collect()
        };
        for id in ids {
            match port.driver.ping(id) {
                Ok(Some(sig)) => println!("{}\t{id}\t{sig}", port.name),
                Ok(None) if !scan => println!("{}\t{id}\tno reply", port.name),
                Ok(None) => {}
                Err(e) => warn!(bus = %port.name, id, error = %e, "ping failed"),
            }
        }
    }
    Ok(())
}

async fn discover(path: &str, attempts: Option<u32>, mock: bool) -> Result<()> {
    let cfg = load(path)?;
    let ports = open_buses(&cfg, mock)?;
    let mut discovery = hub::Discovery::new(&cfg, Arc::new(TracingSink));
    if let Some(n) = attempts {
        let mut policy = hub::RetryPolicy::from_settings(&cfg.hub.discovery);
        policy.max_attempts = Some(n);
        discovery = discovery.with_policy(policy);
    }
    let found = discovery.run(ports).await?;
    for b in found.bindings() {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            b.bus, b.address, b.name, b.kind, b.signature
        );
    }
    for name in found.missing() {
        println!("missing\t{name}");
    }
    println!("attempts: {}", found.attempts());
    Ok(())
}

async fn run(
    path: &str,
    cycles: u64,
    rate_hz: f64,
    pose: Pose,
    velocity: Option<f64>,
    show_metrics: bool,
    mock: bool,
) -> Result<()> {
    if !(rate_hz.is_finite() && rate_hz > 0.0) {
        return Err(anyhow!("--rate-hz must be positive"));
    }
    let cfg = load(path)?;
    let ports = open_buses(&cfg, mock)?;
    let metrics = Arc::new(HubMetrics::new().map_err(|e| anyhow!(e))?);
    let sinks: Vec<Arc<dyn TelemetrySink>> = vec![Arc::new(TracingSink), metrics.clone()];
    let aggregator = hub::bring_up(&cfg, ports, Arc::new(Fanout(sinks))).await?;
    let mut view = JointView::new(aggregator);

    let command: JointCommand = match pose {
        Pose::Zero => {
            let names = view.joint_names();
            JointCommand::zero(names, velocity)
        }
        Pose::Hold => {
            let state = view.read(OffsetDateTime::now_utc()).await?;
            for (name, _) in state.iter().filter(|(_, r)| r.stale) {
                warn!(joint = %name, "no reading to hold, joint left uncommanded");
            }
            JointCommand::hold(&state, velocity)
        }
    };
    info!(joints = command.len(), ?pose, cycles, rate_hz, "running");

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / rate_hz));
    for _ in 0..cycles {
        ticker.tick().await;
        view.write(&command, OffsetDateTime::now_utc()).await?;
        view.read(OffsetDateTime::now_utc()).await?;
    }

    println!("{}", serde_json::to_string_pretty(view.snapshot())?);
    if show_metrics {
        print!("{}", metrics.encode_text());
    }
    let ports = view.into_inner().shutdown().await?;
    info!(ports = ports.len(), "ports released");
    Ok(())
}
