//! `dcssrv` binary entry point: parses CLI flags, loads configuration,
//! wires the backends/event engine/scheduler together, and blocks on the
//! process-wide halt condition until a signal or fatal error stops it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dcssrv::algo;
use dcssrv::backend::hostapd::HostapdBackend;
use dcssrv::backend::netlink::NetlinkBackend;
use dcssrv::backend::vendor::VendorBackend;
use dcssrv::config::Config;
use dcssrv::datalog::Datalog;
use dcssrv::dcs::DcsScheduler;
use dcssrv::engine::EventEngine;
use dcssrv::halt::Halt;
use dcssrv::model::SwitchContext;
use dcssrv::replay::ReplaySource;

#[derive(Parser, Debug)]
#[command(name = "dcssrv", about = "Dynamic Channel Selection controller for a Wi-Fi HaLow AP")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "DCS_CONFIG_PATH")]
    config: PathBuf,

    /// Override the tracing filter (defaults to `RUST_LOG`, then `info`).
    #[arg(long)]
    log_level: Option<String>,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = log_level
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt().with_env_filter(filter).with_timer(tracing_subscriber::fmt::time::SystemTime).init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(70);
        }
    };

    if let Err(e) = run(config) {
        error!(error = %e, "dcssrv exited with an error");
        std::process::exit(1);
    }
}

fn run(config: Config) -> dcssrv::Result<()> {
    let halt = Halt::new();
    let cancel = Arc::new(AtomicBool::new(false));

    let hostapd = Arc::new(HostapdBackend::connect(&config.backends.hostapd.control_path, &config.interface_name)?);
    let event_engine = EventEngine::new();
    let algorithm = algo::build(&config.dcs)?;
    let datalog = Datalog::open(&config.datalog)?;

    let mut scheduler = if config.dcs.test.enabled {
        let filepath = config
            .dcs
            .test
            .filepath
            .clone()
            .ok_or_else(|| dcssrv::error::DcsError::Config("dcs.test.enabled requires dcs.test.filepath".into()))?;
        let replay = Arc::new(ReplaySource::load(&filepath)?);
        let switch_ctx = Arc::new(SwitchContext::default());
        DcsScheduler::init_replay(config.dcs.clone(), replay, hostapd.clone(), switch_ctx, algorithm, datalog, cancel.clone())?
    } else {
        let netlink = Arc::new(NetlinkBackend::connect()?);
        let ifindex = resolve_ifindex(&config.interface_name)?;
        let vendor = Arc::new(VendorBackend::new(
            NetlinkBackend::connect().map_err(dcssrv::error::DcsError::Backend)?,
            ifindex,
        ));
        let _ = &netlink; // netlink above is reused for vendor's inner socket; this handle carries the CH_SWITCH_NOTIFY subscription.
        DcsScheduler::init_live(config.dcs.clone(), &event_engine, hostapd.clone(), netlink, vendor, algorithm, datalog, cancel.clone())?
    };

    let scheduler_handle = std::thread::Builder::new()
        .name("dcs-scheduler".into())
        .spawn(move || scheduler.run())
        .expect("spawn scheduler thread");

    let halt_for_signal = halt.clone();
    ctrlc::set_handler(move || {
        info!("received termination signal, halting");
        halt_for_signal.signal();
    })
    .expect("install signal handler");

    halt.wait();

    info!("shutdown: cancelling scheduler");
    cancel.store(true, Ordering::SeqCst);
    let _ = scheduler_handle.join();

    info!("shutdown: stopping event engine");
    event_engine.shutdown();

    info!("shutdown complete");
    Ok(())
}

/// Resolve the kernel interface index for `interface_name` by reading the
/// sysfs attribute the kernel publishes for every network device, rather
/// than opening a second netlink round-trip just for this one lookup.
fn resolve_ifindex(interface_name: &str) -> dcssrv::Result<u32> {
    let path = format!("/sys/class/net/{interface_name}/ifindex");
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| dcssrv::error::DcsError::Config(format!("reading {path}: {e}")))?;
    raw.trim()
        .parse::<u32>()
        .map_err(|e| dcssrv::error::DcsError::Config(format!("malformed ifindex in {path}: {e}")).into())
}
