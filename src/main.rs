use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hoptrace::{
    report::{run_report, run_watch},
    Args, HickoryResolver, HopProbeEngine, IcmpTransport, ProbeTransport, Result,
    SimulatedTransport,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(args: &Args) {
    if args.is_batch() {
        // In report mode, we can safely log to stderr
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hoptrace=info")),
            )
            .with_writer(std::io::stderr)
            .init();
    } else {
        // In watch mode, log to a file so the table is not interleaved with log lines
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hoptrace=debug"));
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open("hoptrace.log")
        {
            Ok(log_file) => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(log_file))
                .init(),
            Err(_) => tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new("off"))
                .init(),
        }
    }
}

fn select_transport(args: &Args) -> Arc<dyn ProbeTransport> {
    if args.simulate {
        info!("Using simulated transport");
        return Arc::new(SimulatedTransport::default());
    }
    match IcmpTransport::new() {
        Ok(transport) => {
            info!("Using raw ICMP sockets");
            Arc::new(transport)
        }
        Err(e) => {
            warn!(
                "{}; falling back to simulation. Try running with sudo for real probing.",
                e
            );
            Arc::new(SimulatedTransport::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting hoptrace v{}", env!("CARGO_PKG_VERSION"));
    info!("Target: {}", args.target);

    let resolver = HickoryResolver::new();
    let target_addr = resolver
        .lookup_target(&args.target)
        .await
        .context("could not resolve target")?;

    let mut builder = HopProbeEngine::builder(args.engine_config(target_addr), select_transport(&args));
    if !args.numeric {
        builder = builder.resolver(Arc::new(resolver));
    }
    let engine = builder.build();

    if args.is_batch() {
        run_report(engine, &args).await
    } else {
        run_watch(engine, &args).await
    }
}
