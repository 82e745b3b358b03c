use std::{collections::VecDeque, net::IpAddr, time::Duration};

use crate::config::SAMPLE_WINDOW;
use crate::utils;

/// Host name shown on the placeholder row while the hop count is being estimated.
pub const PLACEHOLDER_NAME: &str = "Initial ping";

/// Outcome of one probe, kept in a hop's recent-sample window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSample {
    pub latency: Duration,
    pub is_loss: bool,
}

impl ProbeSample {
    pub fn reply(latency: Duration) -> Self {
        Self {
            latency,
            is_loss: false,
        }
    }

    pub fn loss() -> Self {
        Self {
            latency: Duration::ZERO,
            is_loss: true,
        }
    }
}

/// Rolling statistics for a single hop on the path.
#[derive(Debug, Clone, PartialEq)]
pub struct HopRecord {
    pub hop: u8,
    pub addr: Option<IpAddr>,
    pub hostname: Option<String>,
    /// Every successful latency this session; the average is computed from this.
    pub latencies: Vec<Duration>,
    pub best_rtt: Option<Duration>,
    pub worst_rtt: Option<Duration>,
    pub lost: usize,
    pub samples: VecDeque<ProbeSample>,
    pub loss_percent: f64,
}

impl HopRecord {
    pub fn new(hop: u8) -> Self {
        Self {
            hop,
            addr: None,
            hostname: None,
            latencies: Vec::new(),
            best_rtt: None,
            worst_rtt: None,
            lost: 0,
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            loss_percent: 0.0,
        }
    }

    /// Row shown before the hop count is known.
    pub fn placeholder() -> Self {
        let mut record = Self::new(0);
        record.hostname = Some(PLACEHOLDER_NAME.to_string());
        record
    }

    pub fn sent(&self) -> usize {
        self.latencies.len() + self.lost
    }

    pub fn received(&self) -> usize {
        self.latencies.len()
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.latencies.last().copied()
    }

    /// Mean over the full latency history, not just the sample window.
    pub fn avg_rtt(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let sum: Duration = self.latencies.iter().sum();
        Some(sum / self.latencies.len() as u32)
    }

    /// Store the first address this hop answered from. Later addresses are ignored.
    pub fn claim_addr(&mut self, addr: IpAddr) -> bool {
        if self.addr.is_some() {
            return false;
        }
        self.addr = Some(addr);
        true
    }

    /// Set the resolved name unless one is already present.
    pub fn set_hostname(&mut self, hostname: String) -> bool {
        if self.hostname.as_deref().is_some_and(|name| !name.is_empty()) {
            return false;
        }
        self.hostname = Some(hostname);
        true
    }

    pub fn record_reply(&mut self, rtt: Duration) {
        self.latencies.push(rtt);

        if self.best_rtt.map_or(true, |best| rtt < best) {
            self.best_rtt = Some(rtt);
        }
        if self.worst_rtt.map_or(true, |worst| rtt > worst) {
            self.worst_rtt = Some(rtt);
        }

        self.push_sample(ProbeSample::reply(rtt));
        self.update_loss_percent();

        tracing::debug!(
            "record_reply: hop={}, received={}, rtt={:.1}ms",
            self.hop,
            self.received(),
            utils::time::duration_to_ms_f64(rtt)
        );
    }

    pub fn record_loss(&mut self) {
        self.lost += 1;
        self.push_sample(ProbeSample::loss());
        self.update_loss_percent();

        tracing::debug!("record_loss: hop={}, lost={}/{}", self.hop, self.lost, self.sent());
    }

    fn push_sample(&mut self, sample: ProbeSample) {
        self.samples.push_back(sample);
        while self.samples.len() > SAMPLE_WINDOW {
            self.samples.pop_front();
        }
    }

    pub fn update_loss_percent(&mut self) {
        let sent = self.sent();
        self.loss_percent = if sent > 0 {
            (self.lost as f64 / sent as f64) * 100.0
        } else {
            0.0
        };
    }

    pub fn host_display(&self) -> String {
        utils::network::format_hostname_with_fallback(self.hostname.clone(), self.addr)
    }

    pub fn loss_display(&self) -> String {
        format!("{:.1}%", self.loss_percent)
    }

    pub fn recv_sent_display(&self) -> String {
        if self.sent() == 0 {
            return "---".to_string();
        }
        format!("{}/{}", self.received(), self.sent())
    }

    pub fn best_display(&self) -> String {
        utils::time::format_optional_duration_ms(self.best_rtt)
    }

    pub fn avg_display(&self) -> String {
        utils::time::format_optional_duration_ms(self.avg_rtt())
    }

    pub fn worst_display(&self) -> String {
        utils::time::format_optional_duration_ms(self.worst_rtt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_record_new() {
        let hop = HopRecord::new(5);
        assert_eq!(hop.hop, 5);
        assert_eq!(hop.sent(), 0);
        assert_eq!(hop.received(), 0);
        assert_eq!(hop.loss_percent, 0.0);
        assert!(hop.addr.is_none());
        assert!(hop.hostname.is_none());
        assert!(hop.best_rtt.is_none());
        assert!(hop.worst_rtt.is_none());
        assert!(hop.avg_rtt().is_none());
        assert!(hop.samples.is_empty());
    }

    #[test]
    fn test_placeholder() {
        let hop = HopRecord::placeholder();
        assert_eq!(hop.hop, 0);
        assert_eq!(hop.host_display(), PLACEHOLDER_NAME);
    }

    #[test]
    fn test_alternating_reply_and_loss() {
        let mut hop = HopRecord::new(3);
        hop.record_reply(Duration::from_millis(50));
        hop.record_loss();
        hop.record_reply(Duration::from_millis(30));

        assert_eq!(hop.best_rtt, Some(Duration::from_millis(30)));
        assert_eq!(hop.worst_rtt, Some(Duration::from_millis(50)));
        assert_eq!(hop.avg_rtt(), Some(Duration::from_millis(40)));
        assert!((hop.loss_percent - 33.333).abs() < 0.01);
        assert_eq!(hop.loss_display(), "33.3%");
        assert_eq!(
            hop.samples.iter().copied().collect::<Vec<_>>(),
            vec![
                ProbeSample::reply(Duration::from_millis(50)),
                ProbeSample::loss(),
                ProbeSample::reply(Duration::from_millis(30)),
            ]
        );
        assert_eq!(hop.samples[1].latency, Duration::ZERO);
    }

    #[test]
    fn test_min_max_bound_every_latency() {
        let mut hop = HopRecord::new(1);
        for ms in [80, 12, 45, 200, 3, 77, 150] {
            hop.record_reply(Duration::from_millis(ms));
            hop.record_loss();

            let best = hop.best_rtt.unwrap();
            let worst = hop.worst_rtt.unwrap();
            assert!(hop.latencies.iter().all(|rtt| best <= *rtt && *rtt <= worst));
            assert!((0.0..=100.0).contains(&hop.loss_percent));
        }
        assert_eq!(hop.best_rtt, Some(Duration::from_millis(3)));
        assert_eq!(hop.worst_rtt, Some(Duration::from_millis(200)));
        assert_eq!(hop.loss_percent, 50.0);
    }

    #[test]
    fn test_sample_window_capacity() {
        let mut hop = HopRecord::new(1);
        for i in 0..45 {
            hop.record_reply(Duration::from_millis(i));
        }

        assert_eq!(hop.samples.len(), SAMPLE_WINDOW);
        assert_eq!(hop.samples.front().unwrap().latency, Duration::from_millis(15));
        assert_eq!(hop.samples.back().unwrap().latency, Duration::from_millis(44));

        // Average still covers the whole history: mean of 0..45 = 22
        assert_eq!(hop.latencies.len(), 45);
        assert_eq!(hop.avg_rtt(), Some(Duration::from_millis(22)));
    }

    #[test]
    fn test_all_losses() {
        let mut hop = HopRecord::new(7);
        for _ in 0..4 {
            hop.record_loss();
        }
        assert_eq!(hop.sent(), 4);
        assert_eq!(hop.loss_percent, 100.0);
        assert!(hop.best_rtt.is_none());
        assert_eq!(hop.avg_display(), "---");
        assert_eq!(hop.recv_sent_display(), "0/4");
        assert_eq!(hop.host_display(), "(no response)");
    }

    #[test]
    fn test_hostname_set_once() {
        let mut hop = HopRecord::new(2);
        assert!(hop.set_hostname("first.example.net".to_string()));
        assert!(!hop.set_hostname("second.example.net".to_string()));
        assert_eq!(hop.hostname.as_deref(), Some("first.example.net"));
    }

    #[test]
    fn test_claim_addr_keeps_first() {
        let mut hop = HopRecord::new(2);
        let first: IpAddr = "10.0.0.1".parse().unwrap();
        let second: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(hop.claim_addr(first));
        assert!(!hop.claim_addr(second));
        assert_eq!(hop.addr, Some(first));
        assert_eq!(hop.host_display(), "10.0.0.1");
    }

    #[test]
    fn test_displays() {
        let mut hop = HopRecord::new(1);
        assert_eq!(hop.recv_sent_display(), "---");
        assert_eq!(hop.best_display(), "---");

        hop.record_reply(Duration::from_millis(12));
        hop.record_reply(Duration::from_millis(20));
        hop.record_loss();
        assert_eq!(hop.recv_sent_display(), "2/3");
        assert_eq!(hop.best_display(), "12ms");
        assert_eq!(hop.avg_display(), "16ms");
        assert_eq!(hop.worst_display(), "20ms");
    }
}
