//! Text and JSON consumer of the engine used by the binary.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::hop_stats::HopRecord;
use crate::utils::{self, visualization};
use crate::{Args, HopProbeEngine, Result, SessionEvent};

const HOST_WIDTH: usize = 28;

fn format_column_headers() -> String {
    format!(
        "{:>3}  {:<width$} {:>6} {:>7} {:>6} {:>6} {:>6} {:>6} {:>6}  {}",
        "",
        "Host",
        "Loss%",
        "Rcv/Snt",
        "Last",
        "Avg",
        "Best",
        "Wrst",
        "StDev",
        "Recent",
        width = HOST_WIDTH
    )
}

fn format_rtt(rtt: Option<Duration>) -> String {
    rtt.map(|rtt| format!("{:.1}", utils::time::duration_to_ms_f64(rtt)))
        .unwrap_or_else(|| "???".to_string())
}

fn stddev_ms(hop: &HopRecord) -> f64 {
    match hop.avg_rtt() {
        Some(avg) if hop.received() > 1 => {
            let values: Vec<f64> = hop
                .latencies
                .iter()
                .map(|rtt| utils::time::duration_to_ms_f64(*rtt))
                .collect();
            utils::math::calculate_stddev(&values, utils::time::duration_to_ms_f64(avg))
        }
        _ => 0.0,
    }
}

/// Recent samples as one glyph each, scaled against `max_ms`.
fn sample_strip(hop: &HopRecord, max_ms: f64) -> String {
    hop.samples
        .iter()
        .map(|sample| {
            if sample.is_loss {
                visualization::LOSS_CHAR
            } else {
                let ratio = utils::math::calculate_ratio(
                    utils::time::duration_to_ms_f64(sample.latency),
                    max_ms,
                );
                visualization::get_sparkline_char(ratio)
            }
        })
        .collect()
}

fn host_column(hop: &HopRecord, numeric: bool) -> String {
    let host = if numeric && hop.addr.is_some() {
        utils::network::format_optional_ip(hop.addr)
    } else {
        hop.host_display()
    };
    utils::network::truncate_hostname(&host, HOST_WIDTH)
}

fn format_row_data(hop: &HopRecord, numeric: bool, max_ms: f64) -> String {
    format!(
        "{:>2}.  {:<width$} {:>6} {:>7} {:>6} {:>6} {:>6} {:>6} {:>6.1}  {}",
        hop.hop,
        host_column(hop, numeric),
        hop.loss_display(),
        hop.recv_sent_display(),
        format_rtt(hop.last_rtt()),
        format_rtt(hop.avg_rtt()),
        format_rtt(hop.best_rtt),
        format_rtt(hop.worst_rtt),
        stddev_ms(hop),
        sample_strip(hop, max_ms),
        width = HOST_WIDTH
    )
}

/// Render the hop collection as an mtr-style table.
pub fn render_table(hops: &[HopRecord], numeric: bool) -> String {
    let max_ms = hops
        .iter()
        .filter_map(|hop| hop.worst_rtt)
        .map(utils::time::duration_to_ms_f64)
        .fold(0.0, f64::max);

    let mut out = format_column_headers();
    for hop in hops {
        out.push('\n');
        out.push_str(&format_row_data(hop, numeric, max_ms));
    }
    out
}

/// One hop in the JSON report.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HopSummary {
    pub hop: u8,
    pub addr: Option<IpAddr>,
    pub hostname: Option<String>,
    pub sent: usize,
    pub received: usize,
    pub loss_percent: f64,
    pub last_ms: Option<f64>,
    pub avg_ms: Option<f64>,
    pub best_ms: Option<f64>,
    pub worst_ms: Option<f64>,
    pub stddev_ms: f64,
}

impl From<&HopRecord> for HopSummary {
    fn from(hop: &HopRecord) -> Self {
        let ms = |rtt: Option<Duration>| rtt.map(utils::time::duration_to_ms_f64);
        Self {
            hop: hop.hop,
            addr: hop.addr,
            hostname: hop.hostname.clone(),
            sent: hop.sent(),
            received: hop.received(),
            loss_percent: hop.loss_percent,
            last_ms: ms(hop.last_rtt()),
            avg_ms: ms(hop.avg_rtt()),
            best_ms: ms(hop.best_rtt),
            worst_ms: ms(hop.worst_rtt),
            stddev_ms: stddev_ms(hop),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub start: DateTime<Utc>,
    pub target: String,
    pub target_addr: IpAddr,
    pub converged_hop: Option<u8>,
    pub hops: Vec<HopSummary>,
}

impl Report {
    pub fn new(start: DateTime<Utc>, target: &str, engine: &HopProbeEngine) -> Self {
        Self {
            start,
            target: target.to_string(),
            target_addr: engine.target(),
            converged_hop: engine.converged_hop(),
            hops: probed_hops(&engine.hops()).iter().map(HopSummary::from).collect(),
        }
    }
}

/// Hops that have actually been probed; drops the placeholder and untouched rows.
fn probed_hops(hops: &[HopRecord]) -> Vec<HopRecord> {
    hops.iter()
        .filter(|hop| hop.hop > 0 && hop.sent() > 0)
        .cloned()
        .collect()
}

/// How long report mode runs: one interval per round plus one for the estimation probe.
/// Saturates instead of overflowing on extreme counts or intervals.
fn report_duration(interval: Duration, rounds: u32) -> Duration {
    interval
        .checked_mul(rounds.saturating_add(1))
        .unwrap_or(Duration::MAX)
}

/// Probe for `count` rounds (or until Ctrl-C), then print a single report.
pub async fn run_report(engine: HopProbeEngine, args: &Args) -> Result<()> {
    let start = Utc::now();
    let mut events = engine.subscribe();
    engine.start()?;

    let run_for = report_duration(engine.interval(), args.count.unwrap_or(10));
    let deadline = tokio::time::sleep(run_for);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, printing partial report");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Status(status)) => info!("{}", status),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
    engine.stop().await;

    if args.json {
        let report = Report::new(start, &args.target, &engine);
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Start: {}", start.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("HOST: localhost → {} ({})", args.target, engine.target());
    if let Some(hop) = engine.converged_hop() {
        println!("Target reached at hop {}", hop);
    }
    println!();
    println!("{}", render_table(&probed_hops(&engine.hops()), args.numeric));
    Ok(())
}

/// Redraw the table every interval until Ctrl-C.
pub async fn run_watch(engine: HopProbeEngine, args: &Args) -> Result<()> {
    let mut events = engine.subscribe();
    engine.start()?;

    let mut status = String::new();
    let mut redraw = tokio::time::interval(engine.interval());
    redraw.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = redraw.tick() => {
                // Clear screen and home the cursor
                print!("\x1B[2J\x1B[H");
                println!("hoptrace → {} ({})  {}", args.target, engine.target(), status);
                println!();
                println!("{}", render_table(&engine.hops(), args.numeric));
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Status(text)) => status = text,
                Ok(event) => debug!("Event: {:?}", event),
                Err(RecvError::Lagged(skipped)) => debug!("Changefeed lagged by {}", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hop() -> HopRecord {
        let mut hop = HopRecord::new(2);
        hop.claim_addr("10.0.0.2".parse().unwrap());
        hop.record_reply(Duration::from_millis(10));
        hop.record_loss();
        hop.record_reply(Duration::from_millis(30));
        hop
    }

    #[test]
    fn test_render_table_rows() {
        let table = render_table(&[sample_hop()], false);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Loss%"));
        assert!(lines[1].contains("10.0.0.2"));
        assert!(lines[1].contains("33.3%"));
        assert!(lines[1].contains("2/3"));
        assert!(!lines[1].ends_with('×'));
        assert!(lines[1].contains('×'));
    }

    #[test]
    fn test_sample_strip() {
        let strip = sample_strip(&sample_hop(), 30.0);
        assert_eq!(strip.chars().count(), 3);
        assert_eq!(strip.chars().nth(1), Some(visualization::LOSS_CHAR));
        assert_eq!(strip.chars().nth(2), Some('█'));
    }

    #[test]
    fn test_hop_summary() {
        let summary = HopSummary::from(&sample_hop());
        assert_eq!(summary.sent, 3);
        assert_eq!(summary.received, 2);
        assert_eq!(summary.avg_ms, Some(20.0));
        assert_eq!(summary.best_ms, Some(10.0));
        assert_eq!(summary.worst_ms, Some(30.0));
        assert_eq!(summary.stddev_ms, 10.0);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["addr"], "10.0.0.2");
        assert_eq!(json["hop"], 2);
    }

    #[test]
    fn test_report_duration_saturates() {
        let interval = Duration::from_millis(500);
        assert_eq!(report_duration(interval, 3), Duration::from_secs(2));
        assert_eq!(report_duration(interval, 0), interval);
        assert_eq!(report_duration(interval, u32::MAX), interval * u32::MAX);
        assert_eq!(report_duration(Duration::MAX, 10), Duration::MAX);
        assert_eq!(report_duration(Duration::from_secs(u64::MAX / 2), u32::MAX), Duration::MAX);
    }

    #[test]
    fn test_probed_hops_skips_placeholder_and_unprobed() {
        let hops = vec![HopRecord::placeholder(), HopRecord::new(1), sample_hop()];
        let probed = probed_hops(&hops);
        assert_eq!(probed.len(), 1);
        assert_eq!(probed[0].hop, 2);
    }
}
