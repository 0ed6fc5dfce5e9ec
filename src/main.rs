//! nfqio - NFQUEUE packet interception
//!
//! Diverts traffic into a kernel netfilter queue with nftables (or legacy
//! iptables) rules, hands each queued packet to user space and applies a
//! verdict.
//!
//! # Usage
//!
//! ```bash
//! # Print the divert rules a session would install
//! nfqio rules --local
//! nfqio rules --rst --format ipt
//!
//! # Show which firewall backend would be used
//! nfqio probe
//!
//! # Queue traffic and apply a fixed verdict until Ctrl-C (requires root)
//! nfqio run --config nfqio.json --verdict accept-stream
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand, ValueEnum};
use nfqio::config::{QueueConfig, load_config};
use nfqio::core::backend::RuleBackend;
use nfqio::core::policy::{DivertParams, SessionPolicy};
use nfqio::core::session::{Flow, QueueEvent, QueueSession, Verdict};
use nfqio::core::{ipt, nft};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "nfqio")]
#[command(version = build::CLAP_LONG_VERSION)]
#[command(about = "NFQUEUE packet interception with nftables/iptables divert rules", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum RuleFormat {
    /// nftables script, as loaded with `nft -f`
    Nft,
    /// iptables rule arguments, one rule per line
    Ipt,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the divert rules for a policy
    Rules {
        /// Intercept local traffic (INPUT/OUTPUT) instead of forwarded traffic
        #[arg(long)]
        local: bool,
        /// Reset dropped TCP connections (forward mode only)
        #[arg(long)]
        rst: bool,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = RuleFormat::Nft)]
        format: RuleFormat,
    },
    /// Show which firewall backend would be selected
    Probe,
    /// Queue packets and apply a fixed verdict until interrupted
    Run {
        /// JSON config file (defaults apply when omitted)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Verdict applied to every packet
        #[arg(long, default_value = "accept")]
        verdict: Verdict,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            if let Some(hint) = e.hint() {
                eprintln!("Hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn handle_cli(command: Commands) -> nfqio::Result<()> {
    match command {
        Commands::Rules { local, rst, format } => {
            let policy = SessionPolicy::new(local, rst)?;
            let params = DivertParams::default();
            match format {
                RuleFormat::Nft => print!("{}", nft::generate(&policy, &params)?),
                RuleFormat::Ipt => {
                    for rule in ipt::generate(&policy, &params)? {
                        println!("{rule}");
                    }
                }
            }
        }
        Commands::Probe => {
            let backend = RuleBackend::probe(DivertParams::default())?;
            println!("Backend: {}", backend.kind());
            if !nix::unistd::getuid().is_root() {
                println!("Note: not running as root; `nfqio run` needs root or CAP_NET_ADMIN.");
            }
        }
        Commands::Run { config, verdict } => {
            let config = match config {
                Some(path) => load_config(&path).await?,
                None => QueueConfig::default(),
            };
            run(&config, verdict).await?;
        }
    }
    Ok(())
}

async fn run(config: &QueueConfig, verdict: Verdict) -> nfqio::Result<()> {
    let mut session = QueueSession::open(config)?;
    let handle = session.verdict_handle();
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut packets: u64 = 0;
    let registered = session
        .register(stop_rx, move |event| {
            match event {
                QueueEvent::Packet(packet) => {
                    packets += 1;
                    debug!(
                        "Packet {} stream {} ({} bytes) -> {verdict}",
                        packet.id(),
                        packet.stream_id(),
                        packet.data().len()
                    );
                    if let Err(e) = handle.set_verdict(packet, verdict, None) {
                        warn!("Verdict failed: {e}");
                    }
                    if packets.is_power_of_two() {
                        info!("{packets} packets verdicted");
                    }
                }
                QueueEvent::Error(e) => error!("Queue error: {e}"),
            }
            Flow::Continue
        })
        .await;

    if let Err(e) = registered {
        session.close().await?;
        return Err(e);
    }

    info!(
        "Queueing traffic with the {} backend, applying {verdict}; press Ctrl-C to stop",
        session.backend_kind()
    );
    let interrupted = tokio::signal::ctrl_c().await;
    info!("Shutting down");

    let _ = stop_tx.send(true);
    session.close().await?;
    interrupted?;
    Ok(())
}
