use crate::metrics::ConnectionMetrics;
use crate::packet::{AckTelemetry, DataPacket, LossRange};
use crate::packet_id::PacketId;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// The protocol's base tick, 10 ms.
pub const SYN_US: u64 = 10_000;

/// Pacing and acknowledgement knobs written by the congestion controller and
///  read lock-free by the engine loops.
pub struct CcOutputs {
    send_period_us: AtomicU64,
    cwnd_pkts: AtomicU32,
    ack_interval_pkts: AtomicU32,
    ack_period_us: AtomicU64,
    /// 0 means "no override": the sender derives the EXP interval from RTT
    rto_us: AtomicU64,
}

impl CcOutputs {
    fn new() -> CcOutputs {
        CcOutputs {
            send_period_us: AtomicU64::new(1),
            cwnd_pkts: AtomicU32::new(16),
            ack_interval_pkts: AtomicU32::new(64),
            ack_period_us: AtomicU64::new(SYN_US),
            rto_us: AtomicU64::new(0),
        }
    }

    pub fn send_period_us(&self) -> u64 {
        self.send_period_us.load(Ordering::Relaxed)
    }

    pub fn cwnd_pkts(&self) -> u32 {
        self.cwnd_pkts.load(Ordering::Relaxed)
    }

    pub fn ack_interval_pkts(&self) -> u32 {
        self.ack_interval_pkts.load(Ordering::Relaxed)
    }

    pub fn ack_period_us(&self) -> u64 {
        self.ack_period_us.load(Ordering::Relaxed)
    }

    pub fn rto_us(&self) -> u64 {
        self.rto_us.load(Ordering::Relaxed)
    }
}

/// What a congestion-control policy may observe and adjust: link telemetry on
///  the read side, pacing and acknowledgement cadence on the write side.
pub struct CcContext {
    metrics: Arc<ConnectionMetrics>,
    mtu: Arc<AtomicU32>,
    outputs: Arc<CcOutputs>,
    max_bandwidth: Option<u32>,
    last_sent: PacketId,
}

impl CcContext {
    pub fn rtt_us(&self) -> u32 {
        self.metrics.rtt_us()
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Relaxed)
    }

    /// Estimated link bandwidth in packets/s, from packet-pair probing.
    pub fn bandwidth(&self) -> u32 {
        self.metrics.snapshot().bandwidth
    }

    /// Peer-reported packet arrival rate in packets/s.
    pub fn arrival_rate(&self) -> u32 {
        self.metrics.snapshot().delivery_rate
    }

    pub fn last_sent_seq(&self) -> PacketId {
        self.last_sent
    }

    pub fn set_send_period_us(&self, mut period_us: f64) {
        if let Some(max_bandwidth) = self.max_bandwidth {
            period_us = period_us.max(1e6 / max_bandwidth as f64);
        }
        self.outputs
            .send_period_us
            .store(period_us.max(1.0) as u64, Ordering::Relaxed);
    }

    pub fn set_cwnd_pkts(&self, cwnd: f64) {
        self.outputs
            .cwnd_pkts
            .store(cwnd.clamp(1.0, u32::MAX as f64) as u32, Ordering::Relaxed);
    }

    pub fn set_ack_interval_pkts(&self, packets: u32) {
        self.outputs.ack_interval_pkts.store(packets, Ordering::Relaxed);
    }

    pub fn set_ack_period_us(&self, period_us: u64) {
        self.outputs.ack_period_us.store(period_us, Ordering::Relaxed);
    }

    pub fn set_rto_us(&self, rto_us: u64) {
        self.outputs.rto_us.store(rto_us, Ordering::Relaxed);
    }
}

/// A positive acknowledgement as seen by the policy.
pub struct AckEvent {
    pub recv_next: PacketId,
    /// packets newly acknowledged by this ACK
    pub delivered: u32,
    /// telemetry block of a full ACK, absent for light ACKs
    pub telemetry: Option<AckTelemetry>,
}

/// A pluggable congestion-control policy, one instance per connection. All
///  callbacks run under the connection's congestion lock and must not block.
pub trait CongestionControl: Send + 'static {
    fn init(&mut self, ctx: &CcContext);
    fn close(&mut self, ctx: &CcContext);
    fn on_ack(&mut self, ctx: &CcContext, ack: &AckEvent);
    fn on_nak(&mut self, ctx: &CcContext, loss: &[LossRange]);
    fn on_timeout(&mut self, ctx: &CcContext);
    fn on_pkt_sent(&mut self, ctx: &CcContext, packet: &DataPacket);
    fn on_pkt_recv(&mut self, ctx: &CcContext, packet: &DataPacket);
    /// A UserDefined control packet, passed through verbatim.
    fn on_custom_msg(&mut self, ctx: &CcContext, subtype: u16, info: u32, payload: &[u8]);
}

/// Host-side handle binding one policy instance to a connection. The two
///  engine tasks funnel their events through this; the critical section is
///  only the policy callback itself.
pub struct Cc {
    inner: parking_lot::Mutex<(Box<dyn CongestionControl>, CcContext)>,
    outputs: Arc<CcOutputs>,
}

impl Cc {
    pub fn new(
        policy: Box<dyn CongestionControl>,
        metrics: Arc<ConnectionMetrics>,
        mtu: Arc<AtomicU32>,
        max_bandwidth: Option<u32>,
    ) -> Cc {
        let outputs = Arc::new(CcOutputs::new());
        let ctx = CcContext {
            metrics,
            mtu,
            outputs: outputs.clone(),
            max_bandwidth,
            last_sent: PacketId::ZERO,
        };
        Cc { inner: parking_lot::Mutex::new((policy, ctx)), outputs }
    }

    pub fn outputs(&self) -> Arc<CcOutputs> {
        self.outputs.clone()
    }

    pub fn init(&self) {
        let mut guard = self.inner.lock();
        let (policy, ctx) = &mut *guard;
        policy.init(ctx);
    }

    pub fn close(&self) {
        let mut guard = self.inner.lock();
        let (policy, ctx) = &mut *guard;
        policy.close(ctx);
    }

    pub fn on_ack(&self, ack: &AckEvent) {
        let mut guard = self.inner.lock();
        let (policy, ctx) = &mut *guard;
        policy.on_ack(ctx, ack);
    }

    pub fn on_nak(&self, loss: &[LossRange]) {
        let mut guard = self.inner.lock();
        let (policy, ctx) = &mut *guard;
        policy.on_nak(ctx, loss);
    }

    pub fn on_timeout(&self) {
        let mut guard = self.inner.lock();
        let (policy, ctx) = &mut *guard;
        policy.on_timeout(ctx);
    }

    pub fn on_pkt_sent(&self, packet: &DataPacket) {
        let mut guard = self.inner.lock();
        let (policy, ctx) = &mut *guard;
        ctx.last_sent = packet.seq;
        policy.on_pkt_sent(ctx, packet);
    }

    pub fn on_pkt_recv(&self, packet: &DataPacket) {
        let mut guard = self.inner.lock();
        let (policy, ctx) = &mut *guard;
        policy.on_pkt_recv(ctx, packet);
    }

    pub fn on_custom_msg(&self, subtype: u16, info: u32, payload: &[u8]) {
        let mut guard = self.inner.lock();
        let (policy, ctx) = &mut *guard;
        policy.on_custom_msg(ctx, subtype, info, payload);
    }
}

/// The native UDT policy: a slow-start/congestion-avoidance hybrid that grows
///  the window from delivered-packet reports until it covers the
///  bandwidth-delay product, then paces by a period derived from the
///  bandwidth estimate, recovered additively on ACKs and backed off
///  multiplicatively (window x 15/16, period x 9/8) at most once per RTT on
///  NAKs. A timeout falls back to a window of 2 and a 10 ms period.
pub struct NativeCc {
    slow_start: bool,
    cwnd: f64,
    send_period_us: f64,
    last_dec_period_us: f64,
    last_dec: Option<Instant>,
}

impl NativeCc {
    pub fn new() -> NativeCc {
        NativeCc {
            slow_start: true,
            cwnd: 16.0,
            send_period_us: 1.0,
            last_dec_period_us: 1.0,
            last_dec: None,
        }
    }

    #[cfg(test)]
    fn set_internals(&mut self, slow_start: bool, cwnd: f64, send_period_us: f64) {
        self.slow_start = slow_start;
        self.cwnd = cwnd;
        self.send_period_us = send_period_us;
    }

    fn publish(&self, ctx: &CcContext) {
        ctx.set_cwnd_pkts(self.cwnd);
        ctx.set_send_period_us(self.send_period_us);
    }

    /// The additive period-recovery step: probe for spare bandwidth in
    ///  decimal-magnitude increments of the sending rate.
    fn recover_period(&mut self, ctx: &CcContext) {
        let bandwidth = ctx.bandwidth() as f64;
        let mtu = ctx.mtu().max(1) as f64;

        let mut spare = bandwidth - 1e6 / self.send_period_us;
        if self.send_period_us > self.last_dec_period_us && spare > bandwidth / 9.0 {
            // right after a decrease, probe cautiously
            spare = bandwidth / 9.0;
        }

        let inc = if spare <= 0.0 {
            1.0 / mtu
        } else {
            ((10.0f64).powf((spare * mtu * 8.0).log10().ceil()) * 0.000_001_5 / mtu).max(1.0 / mtu)
        };

        let syn = SYN_US as f64;
        self.send_period_us = (self.send_period_us * syn) / (self.send_period_us * inc + syn);
    }
}

impl Default for NativeCc {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionControl for NativeCc {
    fn init(&mut self, ctx: &CcContext) {
        self.slow_start = true;
        self.cwnd = 16.0;
        self.send_period_us = 1.0;
        self.publish(ctx);
    }

    fn close(&mut self, _ctx: &CcContext) {}

    fn on_ack(&mut self, ctx: &CcContext, ack: &AckEvent) {
        let rtt_us = ctx.rtt_us() as f64;
        let bandwidth = ctx.bandwidth();

        if self.slow_start {
            self.cwnd += ack.delivered as f64;

            let bdp = bandwidth as f64 * rtt_us / 1e6;
            if bandwidth > 1 && self.cwnd >= bdp {
                self.slow_start = false;
                self.send_period_us = 1e6 / bandwidth as f64;
                debug!(
                    "leaving slow start: cwnd {:.0}, period {:.1}us",
                    self.cwnd, self.send_period_us
                );
            }
        } else {
            // track the delivery rate the peer reports
            let arrival_rate = ctx.arrival_rate();
            if arrival_rate > 0 {
                self.cwnd = arrival_rate as f64 / 1e6 * (rtt_us + SYN_US as f64) + 16.0;
            }
            self.recover_period(ctx);
        }

        trace!("on_ack: cwnd {:.1}, period {:.1}us", self.cwnd, self.send_period_us);
        self.publish(ctx);
    }

    fn on_nak(&mut self, ctx: &CcContext, _loss: &[LossRange]) {
        let now = Instant::now();

        if self.slow_start {
            self.slow_start = false;
            let arrival_rate = ctx.arrival_rate();
            if arrival_rate > 0 {
                self.send_period_us = 1e6 / arrival_rate as f64;
            } else {
                self.send_period_us = self.cwnd.max(1.0).recip() * (ctx.rtt_us() as f64 + SYN_US as f64);
            }
            self.publish(ctx);
            return;
        }

        let rtt = std::time::Duration::from_micros(ctx.rtt_us() as u64);
        if self.last_dec.map(|t| now.duration_since(t) < rtt).unwrap_or(false) {
            return;
        }
        self.last_dec = Some(now);
        self.last_dec_period_us = self.send_period_us;

        self.cwnd = (self.cwnd * 15.0 / 16.0).max(2.0);
        self.send_period_us *= 1.125;
        debug!("loss: cwnd {:.1}, period {:.1}us", self.cwnd, self.send_period_us);
        self.publish(ctx);
    }

    fn on_timeout(&mut self, ctx: &CcContext) {
        self.slow_start = false;
        self.cwnd = 2.0;
        self.send_period_us = SYN_US as f64;
        debug!("timeout: resetting cwnd to 2, period to 10ms");
        self.publish(ctx);
    }

    fn on_pkt_sent(&mut self, _ctx: &CcContext, _packet: &DataPacket) {}

    fn on_pkt_recv(&mut self, _ctx: &CcContext, _packet: &DataPacket) {}

    fn on_custom_msg(&mut self, _ctx: &CcContext, _subtype: u16, _info: u32, _payload: &[u8]) {}
}
