// hyperconn - Main Entry Point
//
// Command-line front end for the hypervisor connection manager:
// - URI resolution
// - Host CPU / memory telemetry
// - Domain listing and lookup
// - Storage pool create/remove
//
// The only host backend shipped with the crate is the in-memory simulated
// host, which this binary seeds with a small demo inventory.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hyperconn::config::Config;
use hyperconn::host::sim::SimHost;
use hyperconn::host::{CpuStats, DomainState, MemoryStats};
use hyperconn::hypervisor::{self, CpuSampler, Hypervisor, LifecycleListener};
use hyperconn::{metrics, storage};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// hyperconn: resilient hypervisor connection manager
#[derive(Parser, Debug)]
#[command(name = "hyperconn")]
#[command(version)]
#[command(about = "Resilient hypervisor connection manager and host telemetry sampler", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a config file (defaults to the XDG config location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Host connection URI, overriding the config file
    #[arg(long, global = true)]
    uri: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve a connection URI into schema, address and path
    Resolve {
        /// Connection URI, e.g. qemu+ssh://root@node1/system
        uri: String,
    },
    /// Show host CPU count, model and idle time
    Cpu,
    /// Show host memory in bytes
    Mem,
    /// List all domains
    Domains,
    /// Look a domain up by UUID or name
    Domain {
        /// Domain UUID or name
        key: String,
    },
    /// Sample host CPU for a number of ticks and print each value
    Watch {
        /// Number of ticks to observe
        #[arg(long, default_value_t = 3)]
        ticks: u32,
    },
    /// Manage storage pools
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },
}

#[derive(Subcommand, Debug)]
enum PoolAction {
    /// Create a directory-backed pool (no-op if it exists)
    Create {
        name: String,

        /// Backing directory; defaults to <default_pool_path>/<name>
        #[arg(long)]
        path: Option<String>,
    },
    /// Delete all volumes of a pool and deactivate it
    Remove { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(uri) = &args.uri {
        config.hypervisor.uri = uri.clone();
    }
    init_tracing(&config, args.verbose)?;
    metrics::init().context("Failed to register metrics")?;

    if let Commands::Resolve { uri } = &args.command {
        return print_json(&hypervisor::resolve(uri));
    }

    let host = SimHost::new();
    seed_demo_host(&host).await;
    let hv = Arc::new(Hypervisor::new(Arc::new(host), &config.hypervisor.uri));
    hv.add_listener(Arc::new(
        LifecycleListener::new()
            .on_opened(|_| {
                info!("Host connection opened");
                Ok(())
            })
            .on_closed(|_| {
                info!("Host connection closed");
                Ok(())
            }),
    ))
    .await;

    match args.command {
        Commands::Resolve { .. } => {}
        Commands::Cpu => {
            if let Err(e) = hv.sample_cpu().await {
                tracing::debug!("cpu: sample failed: {}", e);
            }
            print_json(&hv.get_cpu().await)?;
        }
        Commands::Mem => print_json(&hv.get_mem().await)?,
        Commands::Domains => {
            let domains = hv.list_all().await.context("Failed to list domains")?;
            print_json(&domains)?;
        }
        Commands::Domain { key } => {
            let domain = hv
                .lookup_by_uuid_or_name(&key)
                .await
                .with_context(|| format!("Failed to look up domain '{}'", key))?;
            print_json(&domain)?;
        }
        Commands::Watch { ticks } => watch(hv.clone(), &config, ticks).await?,
        Commands::Pool { action } => match action {
            PoolAction::Create { name, path } => {
                let path = path.unwrap_or_else(|| {
                    config.storage.pool_path(&name).to_string_lossy().into_owned()
                });
                let pool = storage::create_pool(&hv, &name, &path)
                    .await
                    .with_context(|| format!("Failed to create pool '{}'", name))?;
                print_json(&pool)?;
            }
            PoolAction::Remove { name } => {
                storage::remove_pool(&hv, &name)
                    .await
                    .with_context(|| format!("Failed to remove pool '{}'", name))?;
                println!("Removed pool {}", name);
            }
        },
    }

    hv.close().await;
    Ok(())
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { config.log_level()? };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

/// Run the background sampler for `ticks` intervals, printing the idle value after each
async fn watch(hv: Arc<Hypervisor>, config: &Config, ticks: u32) -> Result<()> {
    let interval = config.hypervisor.sample_interval();
    let mut sampler = CpuSampler::spawn(hv.clone(), interval);

    for tick in 1..=ticks {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping sampler");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                println!("tick {}: idle {}/1000", tick, hv.idle_per_mille().await);
            }
        }
    }

    sampler.shutdown().await;
    print!("{}", metrics::gather_metrics()?);
    Ok(())
}

async fn seed_demo_host(host: &SimHost) {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    host.set_node_info(cpus, "x86_64", 16 * 1024 * 1024).await;
    host.set_memory_stats(MemoryStats {
        total: Some(16 * 1024 * 1024),
        free: Some(9 * 1024 * 1024),
        cached: Some(3 * 1024 * 1024),
    })
    .await;
    host.set_cpu_step(CpuStats {
        user: 120,
        idle: 800,
        kernel: 60,
        intr: 5,
        iowait: 15,
    })
    .await;
    host.add_domain("web-1", DomainState::Running).await;
    host.add_domain("db-1", DomainState::Shutoff).await;
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}
