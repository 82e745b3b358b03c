// Individual modules import what they need

/// Time conversion utilities
pub mod time {
    use std::time::Duration;

    /// Convert Duration to milliseconds as f64
    pub fn duration_to_ms_f64(duration: Duration) -> f64 {
        duration.as_secs_f64() * 1000.0
    }

    /// Convert Duration to whole milliseconds
    pub fn duration_to_ms_u64(duration: Duration) -> u64 {
        duration.as_millis() as u64
    }

    /// Format duration as whole milliseconds, e.g. "42ms"
    pub fn format_duration_ms(duration: Duration) -> String {
        format!("{}ms", duration_to_ms_u64(duration))
    }

    /// Format optional duration, or "---" if None
    pub fn format_optional_duration_ms(duration: Option<Duration>) -> String {
        duration
            .map(format_duration_ms)
            .unwrap_or_else(|| "---".to_string())
    }

    /// `interval - elapsed`, saturating at zero
    pub fn remaining(interval: Duration, elapsed: Duration) -> Duration {
        interval.saturating_sub(elapsed)
    }
}

/// Mathematical utilities
pub mod math {
    /// Population standard deviation around a known mean
    pub fn calculate_stddev(values: &[f64], mean: f64) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }
        let variance = values
            .iter()
            .map(|value| {
                let diff = value - mean;
                diff * diff
            })
            .sum::<f64>()
            / values.len() as f64;
        variance.sqrt()
    }

    /// Ratio of value to max, clamped to [0, 1]
    pub fn calculate_ratio(value: f64, max_value: f64) -> f64 {
        if max_value > 0.0 {
            (value / max_value).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Network address utilities
pub mod network {
    use std::net::IpAddr;

    /// Format IP address as string, or "(no response)" if None
    pub fn format_optional_ip(addr: Option<IpAddr>) -> String {
        addr.map(|a| a.to_string())
            .unwrap_or_else(|| "(no response)".to_string())
    }

    /// Format hostname with fallback to IP address
    pub fn format_hostname_with_fallback(hostname: Option<String>, addr: Option<IpAddr>) -> String {
        hostname
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format_optional_ip(addr))
    }

    /// Truncate hostname to fit display width
    pub fn truncate_hostname(hostname: &str, max_len: usize) -> String {
        if hostname.chars().count() <= max_len {
            hostname.to_string()
        } else {
            let kept: String = hostname.chars().take(max_len.saturating_sub(3)).collect();
            format!("{}...", kept)
        }
    }

    /// Strip the trailing root dot DNS answers carry
    pub fn trim_fqdn(name: &str) -> String {
        name.trim_end_matches('.').to_string()
    }
}

/// Sample strip rendering
pub mod visualization {
    const BLOCKS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

    /// Glyph for a latency ratio in [0, 1]
    pub fn get_sparkline_char(ratio: f64) -> char {
        let index = (ratio.clamp(0.0, 1.0) * (BLOCKS.len() - 1) as f64).round() as usize;
        BLOCKS[index.min(BLOCKS.len() - 1)]
    }

    /// Glyph used for a lost probe
    pub const LOSS_CHAR: char = '×';
}
