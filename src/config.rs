use std::{net::IpAddr, time::Duration};

use tracing::warn;

/// Hard upper bound on the number of hops probed.
pub const MAX_HOPS: u8 = 30;

/// Extra hops added on top of the TTL-based distance estimate.
pub const HOP_MARGIN: u8 = 3;

/// Number of recent samples each hop keeps for trend display.
pub const SAMPLE_WINDOW: usize = 30;

/// Shortest interval a hop loop may use between probes.
pub const INTERVAL_FLOOR: Duration = Duration::from_millis(200);

/// Default probe interval (and default timeout).
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

/// Hop limit used for the hop-count estimation probe.
pub const ESTIMATION_HOP_LIMIT: u8 = 255;

/// Settings for one probing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub target: IpAddr,
    pub interval: Duration,
    pub timeout: Duration,
}

impl EngineConfig {
    /// Build a config, raising the interval to [`INTERVAL_FLOOR`] and clamping the
    /// timeout so it never exceeds the interval.
    pub fn new(target: IpAddr, interval: Duration, timeout: Duration) -> Self {
        let interval = if interval < INTERVAL_FLOOR {
            warn!(
                "Interval {}ms is below the {}ms floor, using the floor",
                interval.as_millis(),
                INTERVAL_FLOOR.as_millis()
            );
            INTERVAL_FLOOR
        } else {
            interval
        };

        let timeout = if timeout > interval {
            warn!(
                "Timeout {}ms exceeds interval {}ms, clamping",
                timeout.as_millis(),
                interval.as_millis()
            );
            interval
        } else if timeout.is_zero() {
            interval
        } else {
            timeout
        };

        Self {
            target,
            interval,
            timeout,
        }
    }

    /// Config with the default interval, timeout equal to the interval.
    pub fn with_defaults(target: IpAddr) -> Self {
        Self::new(target, DEFAULT_INTERVAL, DEFAULT_INTERVAL)
    }
}
