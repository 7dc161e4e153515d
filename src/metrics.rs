use parking_lot::RwLock;

/// Snapshot of the link telemetry a connection maintains.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LinkTelemetry {
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    /// packets/s as reported by the peer's arrival-rate estimate
    pub delivery_rate: u32,
    /// packets/s as estimated from probe pairs
    pub bandwidth: u32,
}

/// Shared RTT and rate estimates, mutated from both engine tasks through a
///  short critical section and read many times per tick.
///
/// RTT and RTTvar are only fed from ACK/ACK2 round trips; delivery rate and
///  bandwidth only from peer reports in full ACKs. All four are EWMAs with
///  the protocol's fixed factors.
pub struct ConnectionMetrics {
    inner: RwLock<LinkTelemetry>,
}

impl ConnectionMetrics {
    pub fn new() -> ConnectionMetrics {
        // the protocol's conventional pre-handshake estimates: 100 ms RTT,
        // half of that as variance, and minimal rates until reports arrive
        ConnectionMetrics {
            inner: RwLock::new(LinkTelemetry {
                rtt_us: 100_000,
                rtt_var_us: 50_000,
                delivery_rate: 16,
                bandwidth: 1,
            }),
        }
    }

    pub fn snapshot(&self) -> LinkTelemetry {
        *self.inner.read()
    }

    pub fn rtt_us(&self) -> u32 {
        self.inner.read().rtt_us
    }

    /// Folds one measured round trip into the RTT estimate:
    ///  `var <- (3 var + |rtt - sample|) / 4`, `rtt <- (7 rtt + sample) / 8`.
    pub fn apply_rtt(&self, sample_us: u32) {
        let mut inner = self.inner.write();
        inner.rtt_var_us = (3 * inner.rtt_var_us + inner.rtt_us.abs_diff(sample_us)) / 4;
        inner.rtt_us = (7 * inner.rtt_us + sample_us) / 8;
    }

    /// Folds peer-reported arrival rate and bandwidth estimates in, factor 7/8.
    ///  A zero report means "no estimate yet" and is ignored.
    pub fn apply_receive_rates(&self, arrival_rate: u32, bandwidth: u32) {
        let mut inner = self.inner.write();
        if arrival_rate > 0 {
            inner.delivery_rate =
                ((7 * inner.delivery_rate as u64 + arrival_rate as u64) / 8) as u32;
        }
        if bandwidth > 0 {
            inner.bandwidth = ((7 * inner.bandwidth as u64 + bandwidth as u64) / 8) as u32;
        }
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_converges_geometrically() {
        let metrics = ConnectionMetrics::new();
        for _ in 0..200 {
            metrics.apply_rtt(20_000);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rtt_us, 20_000);
        assert_eq!(snapshot.rtt_var_us, 0);
    }

    #[test]
    fn test_rtt_single_sample_weight() {
        let metrics = ConnectionMetrics::new();
        metrics.apply_rtt(20_000);
        // (7 * 100_000 + 20_000) / 8
        assert_eq!(metrics.rtt_us(), 90_000);
        // (3 * 50_000 + 80_000) / 4
        assert_eq!(metrics.snapshot().rtt_var_us, 57_500);
    }

    #[test]
    fn test_receive_rates_ignore_zero_reports() {
        let metrics = ConnectionMetrics::new();
        metrics.apply_receive_rates(800, 0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.delivery_rate, (7 * 16 + 800) / 8);
        assert_eq!(snapshot.bandwidth, 1);
    }
}
