use clap::{Parser, Subcommand};
use sitefence_blocker::{BlockSynchronizer, PfctlFirewall};
use sitefence_domain::event::run_stamp;
use sitefence_domain::CliOverrides;
use sitefence_proxy::{DnsProxy, ProxyState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod bootstrap;

#[derive(Parser)]
#[command(name = "sitefence")]
#[command(version)]
#[command(about = "Sitefence - DNS measurement proxy and reactive IP blocker")]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Output directory for logs and session artifacts
    #[arg(long)]
    log_dir: Option<String>,

    /// Session stamp shared between the proxy and the blocker; defaults
    /// to the current local time
    #[arg(long)]
    run_stamp: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the DNS forwarding proxy
    Proxy {
        /// Listen address for both UDP and TCP
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Upstream resolver address
        #[arg(short = 'u', long)]
        upstream: Option<String>,

        /// Upstream exchange timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Session length in seconds; 0 runs until interrupted
        #[arg(short = 'd', long)]
        duration_secs: Option<u64>,
    },
    /// Run the firewall rule synchronizer
    Block {
        /// Domain whose resolved IPs get blocked
        #[arg(short = 't', long)]
        target_domain: Option<String>,

        /// Event log to tail; defaults to the proxy's log for the same
        /// run stamp and log dir
        #[arg(long)]
        events_log: Option<String>,

        /// Poll interval in milliseconds
        #[arg(long)]
        poll_ms: Option<u64>,

        /// PF anchor name
        #[arg(long)]
        anchor: Option<String>,

        /// PF rule label
        #[arg(long)]
        label: Option<String>,

        /// Liveness marker file
        #[arg(long)]
        pid_file: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut overrides = CliOverrides {
        log_dir: cli.log_dir.clone(),
        log_level: cli.log_level.clone(),
        ..CliOverrides::default()
    };
    match &cli.command {
        Command::Proxy {
            listen,
            upstream,
            timeout_ms,
            duration_secs,
        } => {
            overrides.listen_addr = listen.clone();
            overrides.upstream_addr = upstream.clone();
            overrides.timeout_ms = *timeout_ms;
            overrides.duration_secs = *duration_secs;
        }
        Command::Block {
            target_domain,
            events_log,
            poll_ms,
            anchor,
            label,
            pid_file,
        } => {
            overrides.target_domain = target_domain.clone();
            overrides.events_log = events_log.clone();
            overrides.poll_ms = *poll_ms;
            overrides.anchor = anchor.clone();
            overrides.label = label.clone();
            overrides.pid_file = pid_file.clone();
        }
    }

    let config = bootstrap::load_config(cli.config.as_deref(), overrides)?;
    bootstrap::init_logging(&config);

    info!("Starting sitefence v{}", env!("CARGO_PKG_VERSION"));

    let stamp = cli.run_stamp.clone().unwrap_or_else(run_stamp);
    let stop = CancellationToken::new();
    spawn_interrupt_handler(stop.clone());

    match cli.command {
        Command::Proxy { .. } => {
            let state =
                Arc::new(ProxyState::create(Path::new(&config.log_dir), &stamp).await?);
            let proxy = DnsProxy::bind(&config.proxy, state, stop).await?;
            proxy.run().await?;
        }
        Command::Block { .. } => {
            let log_dir = PathBuf::from(&config.log_dir);
            tokio::fs::create_dir_all(&log_dir).await?;

            let events_log = match &config.blocker.events_log {
                Some(path) => PathBuf::from(path),
                None => log_dir.join(format!("dns_events_{stamp}.log")),
            };
            let firewall = Arc::new(PfctlFirewall::new(config.blocker.anchor.clone()));

            let mut sync = BlockSynchronizer::new(
                &config.blocker.target_domain,
                events_log,
                &log_dir,
                &stamp,
                &config.blocker.anchor,
                &config.blocker.label,
                Duration::from_millis(config.blocker.poll_ms),
                config.blocker.pid_file.as_ref().map(PathBuf::from),
                firewall,
                stop,
            );
            sync.run().await?;
        }
    }

    Ok(())
}

fn spawn_interrupt_handler(stop: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                stop.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        }
    });
}
