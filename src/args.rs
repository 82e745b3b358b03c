use std::{net::IpAddr, time::Duration};

use clap::Parser;

use crate::config::EngineConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "hoptrace")]
#[command(about = "Continuously probe every hop on the route to a target")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Target hostname or IP address
    pub target: String,

    /// Number of probe rounds before printing the report (default: run until Ctrl-C)
    #[arg(short, long)]
    pub count: Option<u32>,

    /// Wait time between probes of the same hop in milliseconds (minimum 200)
    #[arg(short, long, default_value = "1000")]
    pub interval: u64,

    /// Probe timeout in milliseconds (defaults to the interval, never exceeds it)
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Enable report mode (print a single table at the end)
    #[arg(short, long)]
    pub report: bool,

    /// Show IP addresses instead of hostnames (skips reverse DNS)
    #[arg(short, long)]
    pub numeric: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Use a simulated network path instead of raw ICMP sockets
    #[arg(long, help = "Run in simulation mode with fake network data")]
    pub simulate: bool,
}

impl Args {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.unwrap_or(self.interval))
    }

    /// Report and JSON modes print once at the end instead of refreshing.
    pub fn is_batch(&self) -> bool {
        self.report || self.json
    }

    pub fn engine_config(&self, target: IpAddr) -> EngineConfig {
        EngineConfig::new(target, self.interval(), self.timeout())
    }
}
