//! Virtio Crypto Device Manager - pool simulation
//!
//! Attaches a set of simulated crypto accelerators spread over NUMA nodes,
//! drives concurrent submitters through the registry, then detaches every
//! device and prints the registry statistics as JSON.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use virtio_crypto_devmgr::{
    AlgorithmRegistrar, CryptoDevice, DeviceRegistry, Error, ErrorAction, ModuleHandle,
    ModuleRefTracker, NumaNode, RegistryConfig, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Virtio crypto device manager - accelerator pool simulation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Registry configuration file (YAML)
    #[arg(long, env = "DEVMGR_CONFIG")]
    config: Option<PathBuf>,

    /// Number of simulated devices to attach
    #[arg(long, env = "DEVMGR_DEVICES", default_value = "4")]
    devices: usize,

    /// Number of NUMA nodes the devices are spread over
    #[arg(long, env = "DEVMGR_NODES", default_value = "2")]
    nodes: i32,

    /// Devices attached with unknown locality
    #[arg(long, env = "DEVMGR_UNKNOWN_LOCALITY", default_value = "0")]
    unknown_locality: usize,

    /// Concurrent submitters
    #[arg(long, env = "DEVMGR_WORKERS", default_value = "8")]
    workers: usize,

    /// Requests per submitter
    #[arg(long, env = "DEVMGR_REQUESTS", default_value = "1000")]
    requests: u64,

    /// NUMA nodes requested by submitters (defaults to --nodes)
    #[arg(long, env = "DEVMGR_REQUEST_NODES")]
    request_nodes: Option<i32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Simulated Algorithm Layer
// =============================================================================

/// Stand-in for the crypto API registration of the accelerated algorithms
#[derive(Debug, Default)]
struct SimulatedAlgorithms {
    registrations: AtomicU64,
}

impl AlgorithmRegistrar for SimulatedAlgorithms {
    fn register(&self) -> Result<()> {
        let n = self.registrations.fetch_add(1, Ordering::SeqCst) + 1;
        info!(registrations = n, "Registered akcipher and skcipher algorithms");
        Ok(())
    }

    fn unregister(&self) {
        info!("Unregistered akcipher and skcipher algorithms");
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    if args.nodes <= 0 {
        bail!("--nodes must be at least 1");
    }

    let config = match &args.config {
        Some(path) => RegistryConfig::from_yaml_file(path)
            .with_context(|| format!("loading registry config {}", path.display()))?,
        None => RegistryConfig::default(),
    };

    info!("Starting virtio crypto pool simulation");
    info!("  Version: {}", virtio_crypto_devmgr::VERSION);
    info!("  Capacity: {}", config.capacity);
    info!("  Devices: {} over {} nodes", args.devices, args.nodes);
    info!("  Workers: {} x {} requests", args.workers, args.requests);

    let algorithms = Arc::new(SimulatedAlgorithms::default());
    let modules = ModuleRefTracker::new();
    let registry = DeviceRegistry::new(config, algorithms.clone(), modules.clone())?;
    let owner = ModuleHandle::new("virtio_crypto");

    let attached = attach_devices(&registry, &owner, &args)?;
    info!(attached = attached.len(), "Device pool ready");

    run_workers(&registry, &args).await?;

    for device in &attached {
        if device.is_in_use() {
            warn!(
                device = %device,
                refs = device.ref_count(),
                "Device still referenced after workload"
            );
        }
        registry.stop(device)?;
        registry.remove(device)?;
    }

    let stats = registry.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    let pins = modules.pin_count(&owner);
    if pins != 0 {
        bail!("module {} still pinned {} times after detach", owner, pins);
    }
    modules
        .begin_unload(&owner)
        .context("module unload after detach")?;

    info!("Simulation complete");
    Ok(())
}

// =============================================================================
// Attach
// =============================================================================

fn attach_devices(
    registry: &DeviceRegistry,
    owner: &ModuleHandle,
    args: &Args,
) -> Result<Vec<Arc<CryptoDevice>>> {
    let mut attached = Vec::with_capacity(args.devices);

    for index in 0..args.devices {
        let node = if index < args.unknown_locality {
            NumaNode::UNKNOWN
        } else {
            NumaNode::new(index as i32 % args.nodes)
        };
        let device = CryptoDevice::new(format!("vcrypto{index}"), node, owner.clone());

        match registry.add(&device) {
            Ok(_) => {}
            Err(e @ Error::CapacityExceeded { .. }) => {
                warn!(error = %e, "Skipping remaining devices");
                break;
            }
            Err(e) => return Err(e),
        }
        registry.start(&device)?;
        attached.push(device);
    }

    Ok(attached)
}

// =============================================================================
// Workload
// =============================================================================

async fn run_workers(registry: &Arc<DeviceRegistry>, args: &Args) -> anyhow::Result<()> {
    let request_nodes = args.request_nodes.unwrap_or(args.nodes).max(1);
    let fallbacks = Arc::new(AtomicU64::new(0));

    let handles = (0..args.workers).map(|worker| {
        let registry = registry.clone();
        let fallbacks = fallbacks.clone();
        let requests = args.requests;

        tokio::spawn(async move {
            for request in 0..requests {
                let node = NumaNode::new(((worker as u64 + request) % request_nodes as u64) as i32);
                match registry.lease_for_locality(node) {
                    Ok(lease) => {
                        debug!(
                            worker,
                            node = %node,
                            device = %lease.device(),
                            "Submitting request"
                        );
                        tokio::task::yield_now().await;
                    }
                    Err(e) if e.action() == ErrorAction::Fallback => {
                        fallbacks.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
    });

    for result in futures::future::join_all(handles).await {
        result.context("worker panicked")??;
    }

    let fallbacks = fallbacks.load(Ordering::Relaxed);
    if fallbacks > 0 {
        warn!(fallbacks, "Requests served by the software fallback path");
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
