use crate::congestion::{Cc, CcOutputs};
use crate::connection::EngineSignal;
use crate::metrics::ConnectionMetrics;
use crate::packet::{
    AckTelemetry, ControlKind, DataPacket, LossRange, MessageBoundary, Packet, SocketMode,
};
use crate::packet_id::{MessageId, PacketId};
use crate::seq_buffers::{AckHistory, AckHistoryEntry, DataPacketBuffer, LossList};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Entries kept in the arrival and probe-pair interval windows.
const INTERVAL_WINDOW: usize = 16;
/// Full ACKs whose ACK2 never arrives are given up on after this long.
const ACK_HISTORY_MAX_AGE: Duration = Duration::from_secs(10);

/// What the receive task consumes: inbound packets and the 10 ms tick.
pub(crate) enum RecvEvent {
    Packet(Packet, Instant),
    Tick(Instant),
}

/// A ring of recent inter-arrival intervals; the median with >8x / <1/8x
///  outliers dropped estimates a packets/s rate.
#[derive(Default)]
struct IntervalWindow {
    intervals_us: VecDeque<u64>,
}

impl IntervalWindow {
    fn push(&mut self, interval: Duration) {
        if self.intervals_us.len() == INTERVAL_WINDOW {
            self.intervals_us.pop_front();
        }
        self.intervals_us.push_back(interval.as_micros() as u64);
    }

    fn rate_per_sec(&self) -> u32 {
        if self.intervals_us.len() < INTERVAL_WINDOW / 2 {
            return 0;
        }
        let mut sorted: Vec<u64> = self.intervals_us.iter().copied().collect();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2].max(1);

        let (mut sum, mut count) = (0u64, 0u64);
        for &interval in &sorted {
            if interval <= median * 8 && interval >= median / 8 {
                sum += interval;
                count += 1;
            }
        }
        if sum == 0 {
            return 0;
        }
        (1_000_000 * count / sum).min(u32::MAX as u64) as u32
    }
}

/// An in-progress datagram-mode reassembly.
struct PartialMessage {
    message_id: MessageId,
    fragments: BytesMut,
}

pub(crate) struct ReceiverShared {
    pub cc: Arc<Cc>,
    pub cc_out: Arc<CcOutputs>,
    pub metrics: Arc<ConnectionMetrics>,
    /// our own advertised flow window, fixed at handshake
    pub flow_window: u32,
}

/// The per-connection receiver engine: reassembly, loss detection, the
///  ACK/ACK2 handshake and the rate estimators. Like the sender, all protocol
///  logic is synchronous; `run` only moves data through channels.
pub(crate) struct Receiver {
    shared: ReceiverShared,
    mode: SocketMode,

    recv_next: PacketId,
    /// the first sequence we have never seen; everything between `recv_next`
    ///  and this is either buffered or in the loss list
    next_new: PacketId,
    recv_buffer: DataPacketBuffer,
    loss_list: LossList,
    ack_history: AckHistory,

    last_arrival: Option<(PacketId, Instant)>,
    pkt_intervals: IntervalWindow,
    pair_intervals: IntervalWindow,

    ack_seq_no: u32,
    last_full_ack_at: Instant,
    last_acked: PacketId,
    delivered_since_ack: u32,

    partial: Option<PartialMessage>,

    /// payloads or whole messages ready for the reader, drained by the loop
    deliver: VecDeque<Bytes>,
    ctrl_out: VecDeque<Packet>,
    running: bool,

    signals: mpsc::Sender<EngineSignal>,
}

impl Receiver {
    pub(crate) fn new(
        shared: ReceiverShared,
        mode: SocketMode,
        initial_seq: PacketId,
        signals: mpsc::Sender<EngineSignal>,
    ) -> Receiver {
        Receiver {
            shared,
            mode,
            recv_next: initial_seq,
            next_new: initial_seq,
            recv_buffer: DataPacketBuffer::default(),
            loss_list: LossList::default(),
            ack_history: AckHistory::default(),
            last_arrival: None,
            pkt_intervals: IntervalWindow::default(),
            pair_intervals: IntervalWindow::default(),
            ack_seq_no: 0,
            last_full_ack_at: Instant::now(),
            last_acked: initial_seq,
            delivered_since_ack: 0,
            partial: None,
            deliver: VecDeque::new(),
            ctrl_out: VecDeque::new(),
            running: true,
            signals,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut events: mpsc::Receiver<RecvEvent>,
        messages: mpsc::Sender<Bytes>,
        pkt_out: mpsc::Sender<Packet>,
    ) {
        loop {
            while let Some(message) = self.deliver.pop_front() {
                if messages.send(message).await.is_err() {
                    // the reader is gone; keep the protocol running so the
                    // peer still gets acknowledged until teardown
                    self.deliver.clear();
                    break;
                }
            }
            while let Some(packet) = self.ctrl_out.pop_front() {
                if pkt_out.send(packet).await.is_err() {
                    return;
                }
            }
            if !self.running {
                return;
            }

            match events.recv().await {
                Some(RecvEvent::Packet(packet, now)) => self.handle_packet(packet, now),
                Some(RecvEvent::Tick(now)) => self.on_tick(now),
                None => return,
            }
        }
    }

    fn handle_packet(&mut self, packet: Packet, now: Instant) {
        match packet {
            Packet::Data(data) => self.ingest_data(data, now),
            Packet::Control(control) => match control.kind {
                ControlKind::Ack2 { ack_seq_no } => self.ingest_ack2(ack_seq_no, now),
                ControlKind::Shutdown => {
                    debug!("peer shut the connection down");
                    let _ = self.signals.try_send(EngineSignal::ShutdownReceived);
                    self.running = false;
                }
                ControlKind::MsgDropRequest { message_id, first, last } => {
                    self.ingest_msg_drop(message_id, first, last)
                }
                ControlKind::KeepAlive => {}
                ControlKind::UserDefined { subtype, info, payload } => {
                    self.shared.cc.on_custom_msg(subtype, info, &payload)
                }
                other => trace!("receiver ignoring {:?}", other),
            },
        }
    }

    /// Data ingestion per the protocol: record arrival, detect loss, buffer,
    ///  advance the in-order frontier and deliver.
    fn ingest_data(&mut self, packet: DataPacket, now: Instant) {
        self.record_arrival(packet.seq, now);
        self.shared.cc.on_pkt_recv(&packet);

        let seq = packet.seq;
        if seq < self.recv_next {
            trace!("discarding {} below the delivery frontier {}", seq, self.recv_next);
            return;
        }
        if seq.offset_from(self.recv_next) >= self.shared.flow_window {
            debug!("discarding {} beyond the receive window", seq);
            return;
        }

        if seq < self.next_new {
            // a retransmission filling a known hole
            if !self.loss_list.remove(seq) {
                trace!("duplicate {}", seq);
            }
        } else {
            // everything between the old frontier and this packet is now lost
            if self.next_new != seq {
                self.loss_list.register(self.next_new, seq, now);
                let last = seq.add(0x7FFF_FFFF); // inclusive end, one before seq
                self.ctrl_out.push_back(Packet::control(ControlKind::Nak {
                    loss: vec![LossRange { first: self.next_new, last }],
                }));
                trace!("gap [{}, {}) detected", self.next_new, seq);
            }
            self.next_new = seq.next();
        }

        if !self.recv_buffer.insert(packet) {
            trace!("duplicate {} already buffered", seq);
            return;
        }

        self.advance_frontier();

        let ack_interval = self.shared.cc_out.ack_interval_pkts().max(1);
        if self.delivered_since_ack >= ack_interval {
            self.emit_light_ack();
        }
    }

    fn record_arrival(&mut self, seq: PacketId, now: Instant) {
        if let Some((prev_seq, prev_at)) = self.last_arrival {
            self.pkt_intervals.push(now.duration_since(prev_at));

            // probe pair: a packet on a 16-boundary and its immediate successor
            if prev_seq.to_raw() & 0xF == 0 && prev_seq.next() == seq {
                self.pair_intervals.push(now.duration_since(prev_at));
            }
        }
        self.last_arrival = Some((seq, now));
    }

    /// Pops contiguous buffered packets at `recv_next` and hands their
    ///  payloads to the delivery path.
    fn advance_frontier(&mut self) {
        while let Some(packet) = self.recv_buffer.remove(self.recv_next) {
            self.recv_next = self.recv_next.next();
            self.delivered_since_ack += 1;
            self.deliver_packet(packet);
        }
    }

    fn deliver_packet(&mut self, packet: DataPacket) {
        match self.mode {
            SocketMode::Stream => self.deliver.push_back(packet.payload),
            SocketMode::Datagram => self.reassemble(packet),
        }
    }

    /// Datagram reassembly. Fragments arrive here strictly in sequence order,
    ///  so a message is complete exactly when its `Last` fragment shows up.
    fn reassemble(&mut self, packet: DataPacket) {
        match packet.boundary {
            MessageBoundary::Only => {
                if self.partial.take().is_some() {
                    warn!("datagram {} interrupts an unfinished message", packet.message_id);
                }
                self.deliver.push_back(packet.payload);
            }
            MessageBoundary::First => {
                if self.partial.take().is_some() {
                    warn!("datagram {} interrupts an unfinished message", packet.message_id);
                }
                self.partial = Some(PartialMessage {
                    message_id: packet.message_id,
                    fragments: BytesMut::from(packet.payload.as_ref()),
                });
            }
            MessageBoundary::Middle | MessageBoundary::Last => {
                let Some(partial) = self.partial.as_mut() else {
                    warn!("stray fragment of {} without a first fragment", packet.message_id);
                    return;
                };
                if partial.message_id != packet.message_id {
                    warn!(
                        "fragment of {} interleaved into {}",
                        packet.message_id, partial.message_id
                    );
                    self.partial = None;
                    return;
                }
                partial.fragments.extend_from_slice(&packet.payload);
                if packet.boundary == MessageBoundary::Last {
                    let done = self.partial.take().expect("checked above");
                    self.deliver.push_back(done.fragments.freeze());
                }
            }
        }
    }

    fn ingest_ack2(&mut self, ack_seq_no: u32, now: Instant) {
        if let Some(entry) = self.ack_history.take(ack_seq_no) {
            let sample_us = now.duration_since(entry.sent).as_micros().min(u32::MAX as u128);
            self.shared.metrics.apply_rtt(sample_us as u32);
            trace!("ack2 {} closed the loop in {}us", ack_seq_no, sample_us);
        }
    }

    /// An abandoned message: forget its fragments and step over the hole.
    fn ingest_msg_drop(&mut self, message_id: MessageId, first: PacketId, last: PacketId) {
        debug!("peer dropped {} ({}..{})", message_id, first, last);
        self.recv_buffer.remove_range(first, last);
        self.loss_list.remove_range(first, last);

        if let Some(partial) = &self.partial {
            if partial.message_id == message_id {
                self.partial = None;
            }
        }

        let in_hole = !(self.recv_next < first) && !(last < self.recv_next);
        if in_hole {
            self.recv_next = last.next();
            if self.next_new < self.recv_next {
                self.next_new = self.recv_next;
            }
            self.advance_frontier();
        }
    }

    /// The 10 ms tick: full-ACK cadence, NAK re-issue, history expiry.
    fn on_tick(&mut self, now: Instant) {
        let ack_period = Duration::from_micros(self.shared.cc_out.ack_period_us());
        if self.recv_next != self.last_acked
            && now.duration_since(self.last_full_ack_at) >= ack_period
        {
            self.emit_full_ack(now);
        }

        let rtt_us = self.shared.metrics.rtt_us() as u64;
        let nak_interval_us = (2 * rtt_us).max(10_000);
        let due = self.loss_list.due_ranges(self.recv_next, now, nak_interval_us);
        if !due.is_empty() {
            trace!("re-issuing nak for {} ranges", due.len());
            self.ctrl_out.push_back(Packet::control(ControlKind::Nak { loss: due }));
        }

        self.ack_history.expire(now, ACK_HISTORY_MAX_AGE);
    }

    fn emit_light_ack(&mut self) {
        self.delivered_since_ack = 0;
        self.ctrl_out
            .push_back(Packet::control(ControlKind::LightAck { recv_next: self.recv_next }));
    }

    fn emit_full_ack(&mut self, now: Instant) {
        self.ack_seq_no = (self.ack_seq_no + 1) & 0x7FFF_FFFF;
        let telemetry = self.shared.metrics.snapshot();

        let backlog = (self.recv_buffer.len() + self.deliver.len()) as u32;
        let avail_buf_pkts = self.shared.flow_window.saturating_sub(backlog).max(2);

        self.ctrl_out.push_back(Packet::control(ControlKind::Ack {
            ack_seq_no: self.ack_seq_no,
            recv_next: self.recv_next,
            telemetry: AckTelemetry {
                rtt_us: telemetry.rtt_us,
                rtt_var_us: telemetry.rtt_var_us,
                avail_buf_pkts,
                arrival_rate: self.pkt_intervals.rate_per_sec(),
                bandwidth: self.pair_intervals.rate_per_sec(),
            },
        }));

        self.ack_history.push(AckHistoryEntry {
            ack_seq_no: self.ack_seq_no,
            recv_next: self.recv_next,
            sent: now,
        });
        self.last_acked = self.recv_next;
        self.last_full_ack_at = now;
        self.delivered_since_ack = 0;
    }
}
