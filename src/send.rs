use crate::congestion::{AckEvent, Cc, CcOutputs, SYN_US};
use crate::connection::EngineSignal;
use crate::metrics::ConnectionMetrics;
use crate::packet::{
    AckTelemetry, ControlKind, DataPacket, LossRange, MessageBoundary, Packet, SocketMode,
};
use crate::packet_id::{MessageId, PacketId};
use crate::seq_buffers::{DataPacketBuffer, PacketIdSet};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// IP + UDP header bytes counted against the negotiated maximum packet size.
const UDP_IP_OVERHEAD: u32 = 28;
/// EXP never fires faster than this.
const EXP_FLOOR_US: u64 = 300_000;
/// Doubling of the EXP interval is capped here so the exhaustion rule below
///  stays reachable.
const EXP_CEIL_US: u64 = 1_000_000;
/// EXP exhaustion: this many consecutive expiries ...
const EXP_LIMIT: u32 = 16;
/// ... plus this much peer silence escalate the connection to Timeout.
const PEER_SILENCE_LIMIT: Duration = Duration::from_secs(10);

/// A user write waiting to be segmented, stamped at enqueue time for TTL.
pub(crate) struct QueuedMessage {
    pub data: Bytes,
    pub queued_at: Instant,
}

struct PendingMessage {
    fragments: VecDeque<(MessageBoundary, Bytes)>,
    message_id: MessageId,
    in_order: bool,
    expires: Option<Instant>,
    first_seq: Option<PacketId>,
    last_seq: Option<PacketId>,
}

/// Everything the sender engine shares with the rest of the connection.
pub(crate) struct SenderShared {
    pub cc: Arc<Cc>,
    pub cc_out: Arc<CcOutputs>,
    pub metrics: Arc<ConnectionMetrics>,
    pub mtu: Arc<AtomicU32>,
    /// peer-advertised flow window, refreshed from full-ACK buffer reports
    pub peer_window: Arc<AtomicU32>,
    /// upper bound on the peer window, fixed at handshake
    pub negotiated_window: u32,
    /// µs since `created` of the last packet seen from the peer
    pub last_activity_us: Arc<AtomicU64>,
    pub created: Instant,
}

/// The per-connection sender engine: segmentation, pacing, retransmission and
///  the EXP liveness timer. Protocol state transitions are synchronous; the
///  async `run` loop only moves packets and events through channels.
pub(crate) struct Sender {
    shared: SenderShared,
    mode: SocketMode,
    message_ttl: Option<Duration>,

    send_next: PacketId,
    send_last_ack: PacketId,
    loss_list: PacketIdSet,
    send_buffer: DataPacketBuffer,
    pending: VecDeque<PendingMessage>,
    next_msg: MessageId,

    exp_count: u32,
    last_exp: Instant,
    next_send_at: Instant,

    /// control packets produced by the sync handlers, flushed by the loop
    ctrl_out: VecDeque<Packet>,
    message_closed: bool,
    drained_signaled: bool,
    running: bool,

    pkt_out: mpsc::Sender<Packet>,
    signals: mpsc::Sender<EngineSignal>,
}

impl Sender {
    pub(crate) fn new(
        shared: SenderShared,
        mode: SocketMode,
        message_ttl: Option<Duration>,
        initial_seq: PacketId,
        pkt_out: mpsc::Sender<Packet>,
        signals: mpsc::Sender<EngineSignal>,
    ) -> Sender {
        let now = Instant::now();
        Sender {
            shared,
            mode,
            message_ttl,
            send_next: initial_seq,
            send_last_ack: initial_seq,
            loss_list: PacketIdSet::default(),
            send_buffer: DataPacketBuffer::default(),
            pending: VecDeque::new(),
            next_msg: MessageId::ZERO,
            exp_count: 0,
            last_exp: now,
            next_send_at: now,
            ctrl_out: VecDeque::new(),
            message_closed: false,
            drained_signaled: false,
            running: true,
            pkt_out,
            signals,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut events: mpsc::Receiver<(Packet, Instant)>,
        mut messages: mpsc::Receiver<QueuedMessage>,
    ) {
        while self.running {
            while let Some(packet) = self.ctrl_out.pop_front() {
                if self.pkt_out.send(packet).await.is_err() {
                    return;
                }
            }

            let now = Instant::now();
            if now >= self.next_send_at {
                if let Some(packet) = self.dequeue_packet(now) {
                    self.shared.cc.on_pkt_sent(&packet);
                    let probe_pair = packet.seq.to_raw() & 0xF == 0;
                    if self.pkt_out.send(Packet::Data(packet)).await.is_err() {
                        return;
                    }
                    self.next_send_at = if probe_pair {
                        // the second packet of a probe pair goes back to back
                        now
                    } else {
                        now + Duration::from_micros(self.shared.cc_out.send_period_us())
                    };
                    continue;
                }
            }

            self.maybe_signal_drained();

            let wake = self.next_wake(now);
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some((packet, at)) => self.handle_event(packet, at),
                    None => return,
                },
                message = messages.recv(), if !self.message_closed && self.pending.is_empty() => {
                    match message {
                        Some(message) => self.segment_message(message),
                        None => self.message_closed = true,
                    }
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
            }

            self.check_exp(Instant::now());
        }

        // flush whatever the last sync step produced (keep-alive, drop requests)
        while let Some(packet) = self.ctrl_out.pop_front() {
            if self.pkt_out.send(packet).await.is_err() {
                return;
            }
        }
    }

    fn next_wake(&self, now: Instant) -> Instant {
        let exp_at = self.exp_anchor() + self.exp_interval();
        if self.has_work() {
            exp_at.min(self.next_send_at)
        } else {
            exp_at
        }
        .max(now)
    }

    fn has_work(&self) -> bool {
        !self.loss_list.is_empty()
            || (!self.pending.is_empty() && self.flight() < self.window())
    }

    fn flight(&self) -> u32 {
        self.send_next.offset_from(self.send_last_ack)
    }

    fn window(&self) -> u32 {
        self.shared
            .peer_window
            .load(Ordering::Relaxed)
            .min(self.shared.cc_out.cwnd_pkts())
            .max(1)
    }

    fn max_payload(&self) -> usize {
        let mtu = self.shared.mtu.load(Ordering::Relaxed);
        mtu.saturating_sub(UDP_IP_OVERHEAD + crate::packet::DATA_HEADER_LEN as u32)
            .max(1) as usize
    }

    /// Splits one user write into data fragments. Stream mode produces
    ///  standalone full segments; datagram mode produces one fragment group
    ///  sharing a message id and ordered-delivery flag.
    fn segment_message(&mut self, message: QueuedMessage) {
        let cap = self.max_payload();
        let data = message.data;

        let mut fragments = VecDeque::new();
        let chunk_count = data.len().div_ceil(cap).max(1);
        for i in 0..chunk_count {
            let chunk = data.slice(i * cap..((i + 1) * cap).min(data.len()));
            let boundary = match (self.mode, chunk_count, i) {
                (SocketMode::Stream, _, _) => MessageBoundary::Only,
                (_, 1, _) => MessageBoundary::Only,
                (_, _, 0) => MessageBoundary::First,
                (_, n, i) if i == n - 1 => MessageBoundary::Last,
                _ => MessageBoundary::Middle,
            };
            fragments.push_back((boundary, chunk));
        }

        let (message_id, in_order, expires) = match self.mode {
            SocketMode::Stream => (MessageId::ZERO, false, None),
            SocketMode::Datagram => {
                let id = self.next_msg;
                self.next_msg = self.next_msg.next();
                (id, true, self.message_ttl.map(|ttl| message.queued_at + ttl))
            }
        };

        trace!("segmented write into {} fragments as {}", fragments.len(), message_id);
        self.pending.push_back(PendingMessage {
            fragments,
            message_id,
            in_order,
            expires,
            first_seq: None,
            last_seq: None,
        });
    }

    /// Picks the next data packet: the loss list minimum if any, else a fresh
    ///  fragment when the flight fits the window. Retransmissions are never
    ///  window-gated since they do not grow the flight.
    fn dequeue_packet(&mut self, now: Instant) -> Option<DataPacket> {
        while let Some(seq) = self.loss_list.pop_min(self.send_last_ack) {
            if let Some(packet) = self.send_buffer.get(seq) {
                trace!("retransmitting {}", seq);
                return Some(packet.clone());
            }
            debug!("loss entry {} is no longer buffered, skipping", seq);
        }

        loop {
            if self.flight() >= self.window() {
                return None;
            }

            let message = self.pending.front_mut()?;
            let expired = message.expires.map(|at| now >= at).unwrap_or(false);
            if expired && message.first_seq.is_none() {
                debug!("dropping fully untransmitted {} past its ttl", message.message_id);
                self.pending.pop_front();
                continue;
            }

            let (boundary, payload) = message
                .fragments
                .pop_front()
                .expect("pending messages always hold at least one fragment");
            let seq = self.send_next;
            self.send_next = self.send_next.next();
            if message.first_seq.is_none() {
                message.first_seq = Some(seq);
            }
            message.last_seq = Some(seq);

            let packet = DataPacket {
                seq,
                boundary,
                in_order: message.in_order,
                message_id: message.message_id,
                timestamp: 0,
                dst_conn_id: 0,
                payload,
            };

            if message.fragments.is_empty() {
                let finished = self.pending.pop_front().expect("front still present");
                if expired {
                    // a partly transmitted message past its ttl is finished,
                    // then its lost fragments are abandoned
                    let first = finished.first_seq.expect("checked above");
                    let last = finished.last_seq.expect("assigned above");
                    debug!("abandoning expired {} ({}..{})", finished.message_id, first, last);
                    self.loss_list.remove_range(first, last);
                    self.send_buffer.remove_range(first, last);
                    self.ctrl_out.push_back(Packet::control(ControlKind::MsgDropRequest {
                        message_id: finished.message_id,
                        first,
                        last,
                    }));
                    return Some(packet);
                }
            }

            self.send_buffer.insert(packet.clone());
            return Some(packet);
        }
    }

    fn handle_event(&mut self, packet: Packet, now: Instant) {
        let Packet::Control(control) = packet else {
            return;
        };
        match control.kind {
            ControlKind::Ack { ack_seq_no, recv_next, telemetry } => {
                self.on_ack(recv_next, Some((ack_seq_no, telemetry)), now)
            }
            ControlKind::LightAck { recv_next } => self.on_ack(recv_next, None, now),
            ControlKind::Nak { loss } => self.on_nak(&loss),
            ControlKind::Congestion => {
                // obsolete in protocol version 4, peers are not expected to send it
                debug!("ignoring congestion warning");
            }
            other => trace!("sender ignoring {:?}", other),
        }
    }

    fn on_ack(&mut self, recv_next: PacketId, full: Option<(u32, AckTelemetry)>, _now: Instant) {
        let mut delivered = 0;
        if recv_next > self.send_last_ack {
            delivered = recv_next.offset_from(self.send_last_ack);
            self.send_last_ack = recv_next;
            self.send_buffer.remove_below(recv_next);
            self.loss_list.remove_below(recv_next);
            trace!("ack up to {}, {} newly delivered", recv_next, delivered);
        }

        if let Some((ack_seq_no, telemetry)) = full {
            self.ctrl_out.push_back(Packet::control(ControlKind::Ack2 { ack_seq_no }));
            self.shared
                .metrics
                .apply_receive_rates(telemetry.arrival_rate, telemetry.bandwidth);
            if telemetry.avail_buf_pkts > 0 {
                self.shared.peer_window.store(
                    telemetry.avail_buf_pkts.min(self.shared.negotiated_window),
                    Ordering::Relaxed,
                );
            }
        }

        self.shared.cc.on_ack(&AckEvent {
            recv_next,
            delivered,
            telemetry: full.map(|(_, telemetry)| telemetry),
        });
    }

    fn on_nak(&mut self, loss: &[LossRange]) {
        let mut registered = false;
        for range in loss {
            for seq in range.first.seq_range(range.last.next()) {
                // only sequences we actually have in flight are losses
                let in_flight = seq.offset_from(self.send_last_ack)
                    < self.send_next.offset_from(self.send_last_ack);
                if in_flight {
                    self.loss_list.insert(seq);
                    registered = true;
                }
            }
        }
        if registered {
            self.shared.cc.on_nak(loss);
        }
    }

    fn last_activity(&self) -> Instant {
        self.shared.created
            + Duration::from_micros(self.shared.last_activity_us.load(Ordering::Relaxed))
    }

    fn exp_anchor(&self) -> Instant {
        self.last_activity().max(self.last_exp)
    }

    fn exp_interval(&self) -> Duration {
        let base_us = match self.shared.cc_out.rto_us() {
            0 => {
                let telemetry = self.shared.metrics.snapshot();
                4 * telemetry.rtt_us as u64 + telemetry.rtt_var_us as u64 + SYN_US
            }
            rto => rto,
        };
        let base_us = base_us.max(EXP_FLOOR_US);
        let scaled = (base_us << self.exp_count.min(6)).min(base_us.max(EXP_CEIL_US));
        Duration::from_micros(scaled)
    }

    fn check_exp(&mut self, now: Instant) {
        if now < self.exp_anchor() + self.exp_interval() {
            if self.last_activity() > self.last_exp {
                // peer activity since the last expiry ends the streak
                self.exp_count = 0;
            }
            return;
        }

        self.last_exp = now;
        self.exp_count += 1;

        let silence = now.saturating_duration_since(self.last_activity());
        if self.exp_count >= EXP_LIMIT && silence >= PEER_SILENCE_LIMIT {
            debug!("exp exhausted after {:?} of peer silence", silence);
            let _ = self.signals.try_send(EngineSignal::PeerTimeout);
            self.running = false;
            return;
        }

        if self.send_buffer.is_empty() {
            self.ctrl_out.push_back(Packet::control(ControlKind::KeepAlive));
            return;
        }

        // bulk retransmission: everything unacknowledged is considered lost
        let mut marked = 0;
        for seq in self.send_buffer.ids() {
            if self.loss_list.insert(seq) {
                marked += 1;
            }
        }
        debug!("exp #{}: marked {} in-flight packets for retransmission", self.exp_count, marked);
        self.shared.cc.on_timeout();
    }

    fn maybe_signal_drained(&mut self) {
        if self.drained_signaled || !self.message_closed {
            return;
        }
        if self.pending.is_empty() && self.send_buffer.is_empty() && self.loss_list.is_empty() {
            self.drained_signaled = true;
            let _ = self.signals.try_send(EngineSignal::SendDrained);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::NativeCc;
    use rstest::rstest;

    fn test_sender(mode: SocketMode, ttl: Option<Duration>, isn: u32) -> (Sender, mpsc::Receiver<Packet>) {
        let metrics = Arc::new(ConnectionMetrics::new());
        let mtu = Arc::new(AtomicU32::new(1500));
        let cc = Arc::new(Cc::new(Box::new(NativeCc::new()), metrics.clone(), mtu.clone(), None));
        cc.init();
        let cc_out = cc.outputs();
        let (pkt_tx, pkt_rx) = mpsc::channel(64);
        let (sig_tx, _sig_rx) = mpsc::channel(8);

        let shared = SenderShared {
            cc,
            cc_out,
            metrics,
            mtu,
            peer_window: Arc::new(AtomicU32::new(25_600)),
            negotiated_window: 25_600,
            last_activity_us: Arc::new(AtomicU64::new(0)),
            created: Instant::now(),
        };
        (
            Sender::new(shared, mode, ttl, PacketId::from_raw(isn), pkt_tx, sig_tx),
            pkt_rx,
        )
    }

    fn queued(data: &[u8]) -> QueuedMessage {
        QueuedMessage { data: Bytes::copy_from_slice(data), queued_at: Instant::now() }
    }

    #[test]
    fn test_stream_segmentation_fills_mtu() {
        let (mut sender, _rx) = test_sender(SocketMode::Stream, None, 100);
        // payload capacity is 1500 - 28 - 16 = 1456
        sender.segment_message(queued(&vec![7u8; 3000]));

        let now = Instant::now();
        let first = sender.dequeue_packet(now).expect("first segment");
        let second = sender.dequeue_packet(now).expect("second segment");
        let third = sender.dequeue_packet(now).expect("third segment");
        assert_eq!(first.payload.len(), 1456);
        assert_eq!(second.payload.len(), 1456);
        assert_eq!(third.payload.len(), 3000 - 2 * 1456);
        for packet in [&first, &second, &third] {
            assert_eq!(packet.boundary, MessageBoundary::Only);
        }
        assert_eq!(first.seq, PacketId::from_raw(100));
        assert_eq!(second.seq, PacketId::from_raw(101));
        assert_eq!(sender.flight(), 3);
    }

    #[rstest]
    #[case::single(100, vec![MessageBoundary::Only])]
    #[case::two(2000, vec![MessageBoundary::First, MessageBoundary::Last])]
    #[case::three(3000, vec![MessageBoundary::First, MessageBoundary::Middle, MessageBoundary::Last])]
    fn test_datagram_boundaries(#[case] size: usize, #[case] expected: Vec<MessageBoundary>) {
        let (mut sender, _rx) = test_sender(SocketMode::Datagram, None, 0);
        sender.segment_message(queued(&vec![1u8; size]));

        let now = Instant::now();
        let packets: Vec<DataPacket> =
            std::iter::from_fn(|| sender.dequeue_packet(now)).collect();
        assert_eq!(packets.len(), expected.len());
        for (packet, boundary) in packets.iter().zip(expected) {
            assert_eq!(packet.boundary, boundary);
            assert_eq!(packet.message_id, MessageId::ZERO);
            assert!(packet.in_order);
        }
    }

    #[test]
    fn test_ack_prunes_and_naks_retransmit_first() {
        let (mut sender, _rx) = test_sender(SocketMode::Stream, None, 10);
        sender.segment_message(queued(&[1u8; 100]));
        sender.segment_message(queued(&[2u8; 100]));
        sender.segment_message(queued(&[3u8; 100]));
        let now = Instant::now();
        for _ in 0..3 {
            sender.dequeue_packet(now).expect("data available");
        }
        assert_eq!(sender.send_buffer.len(), 3);

        sender.on_ack(PacketId::from_raw(11), None, now);
        assert_eq!(sender.send_last_ack, PacketId::from_raw(11));
        assert_eq!(sender.send_buffer.len(), 2);
        assert_eq!(sender.flight(), 2);

        sender.on_nak(&[LossRange::single(PacketId::from_raw(11))]);
        let retransmit = sender.dequeue_packet(now).expect("retransmission");
        assert_eq!(retransmit.seq, PacketId::from_raw(11));
        assert!(sender.loss_list.is_empty());
    }

    #[test]
    fn test_nak_below_ack_is_ignored() {
        let (mut sender, _rx) = test_sender(SocketMode::Stream, None, 10);
        sender.segment_message(queued(&[0u8; 10]));
        let now = Instant::now();
        sender.dequeue_packet(now).expect("data");
        sender.on_ack(PacketId::from_raw(11), None, now);

        sender.on_nak(&[LossRange::single(PacketId::from_raw(10))]);
        assert!(sender.loss_list.is_empty());
        // and sequences that were never sent are ignored too
        sender.on_nak(&[LossRange::single(PacketId::from_raw(500))]);
        assert!(sender.loss_list.is_empty());
    }

    #[test]
    fn test_full_ack_emits_ack2_and_updates_rates() {
        let (mut sender, _rx) = test_sender(SocketMode::Stream, None, 0);
        let telemetry = AckTelemetry {
            rtt_us: 30_000,
            rtt_var_us: 5_000,
            avail_buf_pkts: 1000,
            arrival_rate: 808,
            bandwidth: 8008,
        };
        sender.on_ack(PacketId::from_raw(0), Some((7, telemetry)), Instant::now());

        assert!(matches!(
            sender.ctrl_out.pop_front(),
            Some(Packet::Control(crate::packet::ControlPacket {
                kind: ControlKind::Ack2 { ack_seq_no: 7 },
                ..
            }))
        ));
        assert_eq!(sender.shared.peer_window.load(Ordering::Relaxed), 1000);
        assert_eq!(sender.shared.metrics.snapshot().delivery_rate, (7 * 16 + 808) / 8);
    }

    #[test]
    fn test_window_gates_new_data_but_not_retransmits() {
        let (mut sender, _rx) = test_sender(SocketMode::Stream, None, 0);
        sender.shared.peer_window.store(2, Ordering::Relaxed);
        sender.segment_message(queued(&vec![1u8; 5000]));

        let now = Instant::now();
        assert!(sender.dequeue_packet(now).is_some());
        assert!(sender.dequeue_packet(now).is_some());
        // window full: no new data
        assert!(sender.dequeue_packet(now).is_none());
        assert_eq!(sender.flight(), 2);

        // but a loss entry still goes out
        sender.on_nak(&[LossRange::single(PacketId::from_raw(0))]);
        assert!(sender.dequeue_packet(now).is_some());
        assert_eq!(sender.flight(), 2);
    }

    #[test]
    fn test_expired_untransmitted_message_is_dropped_silently() {
        let (mut sender, _rx) =
            test_sender(SocketMode::Datagram, Some(Duration::from_millis(1)), 0);
        sender.segment_message(QueuedMessage {
            data: Bytes::from_static(&[1; 10]),
            queued_at: Instant::now() - Duration::from_secs(1),
        });
        sender.segment_message(queued(&[2u8; 10]));

        let packet = sender.dequeue_packet(Instant::now()).expect("second message");
        assert_eq!(packet.payload.as_ref(), &[2u8; 10]);
        assert!(sender.ctrl_out.is_empty());
    }

    #[test]
    fn test_expired_partial_message_finishes_then_requests_drop() {
        let (mut sender, _rx) =
            test_sender(SocketMode::Datagram, Some(Duration::from_millis(10)), 0);
        let start = Instant::now();
        sender.segment_message(QueuedMessage {
            data: Bytes::from(vec![3u8; 3000]),
            queued_at: start,
        });

        let first = sender.dequeue_packet(start).expect("first fragment");
        assert_eq!(first.boundary, MessageBoundary::First);

        // the ttl expires mid-message; the rest is still transmitted
        let late = start + Duration::from_secs(1);
        assert!(sender.dequeue_packet(late).is_some());
        let last = sender.dequeue_packet(late).expect("last fragment");
        assert_eq!(last.boundary, MessageBoundary::Last);

        let drop_request = sender.ctrl_out.pop_front().expect("drop request emitted");
        let Packet::Control(control) = drop_request else { panic!("control expected") };
        let ControlKind::MsgDropRequest { message_id, first, last } = control.kind else {
            panic!("drop request expected")
        };
        assert_eq!(message_id, MessageId::ZERO);
        assert_eq!(first, PacketId::from_raw(0));
        assert_eq!(last, PacketId::from_raw(2));
        // the abandoned fragments are no longer retransmittable
        assert!(sender.send_buffer.is_empty());
    }

    #[test]
    fn test_exp_marks_all_unacked_lost_and_keepalive_when_idle() {
        let (mut sender, _rx) = test_sender(SocketMode::Stream, None, 0);
        let now = Instant::now();
        // the peer has been silent since a long-ago creation
        sender.shared.created = now - Duration::from_secs(30);
        sender.segment_message(queued(&[1u8; 10]));
        sender.dequeue_packet(now).expect("data");

        sender.last_exp = now - Duration::from_secs(5);
        sender.check_exp(now);
        assert_eq!(sender.exp_count, 1);
        assert!(sender.loss_list.contains(PacketId::from_raw(0)));

        // acked: the next expiry emits a keep-alive instead
        sender.on_ack(PacketId::from_raw(1), None, now);
        sender.loss_list.remove_below(PacketId::from_raw(1));
        sender.last_exp = now - Duration::from_secs(5);
        sender.check_exp(now);
        assert!(matches!(
            sender.ctrl_out.back(),
            Some(Packet::Control(crate::packet::ControlPacket { kind: ControlKind::KeepAlive, .. }))
        ));
    }

    #[test]
    fn test_exp_exhaustion_signals_timeout() {
        let (mut sender, _rx) = test_sender(SocketMode::Stream, None, 0);
        let (sig_tx, mut sig_rx) = mpsc::channel(8);
        sender.signals = sig_tx;

        sender.exp_count = EXP_LIMIT;
        sender.last_exp = Instant::now() - Duration::from_secs(20);
        // last_activity_us stays 0, so the peer has been silent since `created`
        sender.shared.created = Instant::now() - Duration::from_secs(30);
        sender.check_exp(Instant::now());

        assert!(!sender.running);
        assert!(matches!(sig_rx.try_recv(), Ok(EngineSignal::PeerTimeout)));
    }

    #[test]
    fn test_drain_signal_after_close() {
        let (mut sender, _rx) = test_sender(SocketMode::Stream, None, 0);
        let (sig_tx, mut sig_rx) = mpsc::channel(8);
        sender.signals = sig_tx;
        sender.message_closed = true;
        sender.segment_message(queued(&[1u8; 10]));

        sender.maybe_signal_drained();
        assert!(sig_rx.try_recv().is_err());

        let now = Instant::now();
        sender.dequeue_packet(now).expect("data");
        sender.on_ack(PacketId::from_raw(1), None, now);
        sender.maybe_signal_drained();
        assert!(matches!(sig_rx.try_recv(), Ok(EngineSignal::SendDrained)));
    }
}
