use crate::config::{Config, MIN_FLOW_WINDOW};
use crate::congestion::{Cc, CcOutputs, NativeCc};
use crate::error::{Error, Result};
use crate::metrics::ConnectionMetrics;
use crate::multiplexer::{Multiplexer, OutboundPacket};
use crate::packet::{
    ControlKind, ControlPacket, HandshakeInfo, HandshakeReqType, Packet, SocketMode,
};
use crate::packet_id::PacketId;
use crate::recv::{Receiver, ReceiverShared, RecvEvent};
use crate::send::{QueuedMessage, Sender, SenderShared};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const HANDSHAKE_RESEND_INTERVAL: Duration = Duration::from_millis(250);
const CLIENT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const RENDEZVOUS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const PROTOCOL_VERSION: u32 = 4;

/// Connection lifecycle states. The first four are live; the last four are
///  terminal and equivalent as far as `is_open` is concerned.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SocketState {
    Init,
    Rendezvous,
    Connecting,
    Connected,
    Closed,
    Refused,
    Corrupted,
    Timeout,
}

impl SocketState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SocketState::Closed | SocketState::Refused | SocketState::Corrupted | SocketState::Timeout
        )
    }
}

fn state_error(state: SocketState) -> Error {
    match state {
        SocketState::Refused => Error::Refused,
        SocketState::Corrupted => Error::Corrupted("protocol violation by peer"),
        SocketState::Timeout => Error::Timeout,
        _ => Error::Closed,
    }
}

/// How this endpoint entered the connection.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectRole {
    Client,
    Server,
    Rendezvous,
}

/// Notifications from the engine tasks to the manage task.
#[derive(Debug)]
pub(crate) enum EngineSignal {
    PeerTimeout,
    SendDrained,
    ShutdownReceived,
}

enum ManageCmd {
    Close,
}

struct Reader {
    rx: mpsc::Receiver<Bytes>,
    current: Option<Bytes>,
    offset: usize,
}

pub(crate) struct ConnInner {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    conn_id: u32,
    remote_id: AtomicU32,
    role: ConnectRole,
    mode: SocketMode,
    config: Arc<Config>,
    created: Instant,

    isn: PacketId,
    mtu: Arc<AtomicU32>,
    negotiated_window: AtomicU32,
    peer_window: Arc<AtomicU32>,
    last_activity_us: Arc<AtomicU64>,

    metrics: Arc<ConnectionMetrics>,
    cc: Arc<Cc>,
    cc_out: Arc<CcOutputs>,

    state: watch::Sender<SocketState>,
    read_deadline: watch::Sender<Option<Instant>>,
    write_deadline: watch::Sender<Option<Instant>>,

    recv_events: mpsc::Sender<RecvEvent>,
    send_events: mpsc::Sender<(Packet, Instant)>,
    handshakes: mpsc::Sender<HandshakeInfo>,
    ctrl: mpsc::Sender<ManageCmd>,
    message_out: parking_lot::Mutex<Option<mpsc::Sender<QueuedMessage>>>,
    reader: tokio::sync::Mutex<Reader>,
}

impl ConnInner {
    pub(crate) fn conn_id(&self) -> u32 {
        self.conn_id
    }

    pub(crate) fn state_now(&self) -> SocketState {
        *self.state.borrow()
    }

    /// One-way transition: terminal states are never left again.
    fn set_state(&self, new: SocketState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == new {
                false
            } else {
                debug!("connection {}: {:?} -> {:?}", self.conn_id, state, new);
                *state = new;
                true
            }
        });
    }

    fn touch(&self) {
        self.last_activity_us
            .store(self.created.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    /// Entry point from the multiplexer read loop: minimal work, bounded
    ///  queues, packets are dropped (and logged) when a queue is full.
    pub(crate) fn dispatch(&self, packet: Packet, now: Instant) {
        if self.state_now().is_terminal() {
            return;
        }
        self.touch();

        match packet {
            Packet::Control(ControlPacket { kind: ControlKind::Handshake(hs), .. }) => {
                if self.handshakes.try_send(hs).is_err() {
                    debug!("connection {}: handshake queue full, dropping", self.conn_id);
                }
            }
            packet if packet.is_sender_bound() => {
                if self.send_events.try_send((packet, now)).is_err() {
                    debug!("connection {}: send event queue full, dropping packet", self.conn_id);
                }
            }
            packet => {
                if self.recv_events.try_send(RecvEvent::Packet(packet, now)).is_err() {
                    debug!("connection {}: recv event queue full, dropping packet", self.conn_id);
                }
            }
        }
    }

    /// The multiplexer's 10 ms tick, fanned out to every connection.
    pub(crate) fn tick(&self, now: Instant) {
        let _ = self.recv_events.try_send(RecvEvent::Tick(now));
    }

    /// True for a rendezvous-mode connection still waiting for this peer.
    pub(crate) fn matches_rendezvous(&self, from: SocketAddr) -> bool {
        self.peer_addr == from && self.state_now() == SocketState::Rendezvous
    }

    fn apply_peer_limits(&self, hs: &HandshakeInfo) {
        self.mtu.fetch_min(hs.max_packet_size.max(576), Ordering::Relaxed);
        let window = self
            .config
            .max_flow_window
            .min(hs.max_flow_window)
            .max(MIN_FLOW_WINDOW);
        self.negotiated_window.store(window, Ordering::Relaxed);
        self.peer_window.store(window, Ordering::Relaxed);
    }

    fn handshake_info(&self, req_type: HandshakeReqType, init_seq: PacketId, syn_cookie: u32) -> HandshakeInfo {
        HandshakeInfo {
            udt_version: PROTOCOL_VERSION,
            mode: self.mode,
            init_seq,
            max_packet_size: self.mtu.load(Ordering::Relaxed),
            max_flow_window: self.config.max_flow_window,
            req_type,
            conn_id: self.conn_id,
            syn_cookie,
            peer_addr: self.peer_addr.ip(),
        }
    }
}

/// A UDT connection: a reliable, congestion-controlled byte stream or
///  datagram exchange with one peer, multiplexed over a shared UDP endpoint.
#[derive(Clone)]
pub struct UdtConnection {
    inner: Arc<ConnInner>,
}

impl UdtConnection {
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn mode(&self) -> SocketMode {
        self.inner.mode
    }

    pub fn state(&self) -> SocketState {
        self.inner.state_now()
    }

    pub fn is_open(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Resolves once the handshake completes; fails with the terminal state's
    ///  error if the connection never comes up (refused, timeout, corrupted).
    pub async fn wait_connected(&self) -> Result<()> {
        let mut state_rx = self.inner.state.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                SocketState::Connected => return Ok(()),
                s if s.is_terminal() => return Err(state_error(s)),
                _ => {
                    if state_rx.changed().await.is_err() {
                        return Err(Error::Closed);
                    }
                }
            }
        }
    }

    /// Reads the next chunk of the stream, or one datagram. A datagram larger
    ///  than `buf` is truncated: the prefix is copied and `Truncated` returned.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut reader = self.inner.reader.lock().await;
        let mut state_rx = self.inner.state.subscribe();
        let mut deadline_rx = self.inner.read_deadline.subscribe();

        loop {
            if self.inner.mode == SocketMode::Stream {
                if let Some(n) = Self::serve_stream(&mut reader, buf) {
                    return Ok(n);
                }
            }

            match reader.rx.try_recv() {
                Ok(message) => return self.serve_message(&mut reader, message, buf),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(state_error(self.state()))
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            let state = *state_rx.borrow_and_update();
            if state.is_terminal() {
                // drain anything that raced in before failing
                match reader.rx.try_recv() {
                    Ok(message) => return self.serve_message(&mut reader, message, buf),
                    Err(_) => return Err(state_error(state)),
                }
            }

            tokio::select! {
                message = reader.rx.recv() => match message {
                    Some(message) => return self.serve_message(&mut reader, message, buf),
                    None => return Err(state_error(self.state())),
                },
                _ = wait_deadline(&mut deadline_rx) => return Err(Error::DeadlineExceeded),
                _ = state_rx.changed() => {}
            }
        }
    }

    fn serve_stream(reader: &mut Reader, buf: &mut [u8]) -> Option<usize> {
        let current = reader.current.as_ref()?;
        let n = buf.len().min(current.len() - reader.offset);
        buf[..n].copy_from_slice(&current[reader.offset..reader.offset + n]);
        reader.offset += n;
        if reader.offset >= current.len() {
            reader.current = None;
            reader.offset = 0;
        }
        Some(n)
    }

    fn serve_message(&self, reader: &mut Reader, message: Bytes, buf: &mut [u8]) -> Result<usize> {
        match self.inner.mode {
            SocketMode::Stream => {
                reader.current = Some(message);
                reader.offset = 0;
                Ok(Self::serve_stream(reader, buf).expect("current was just set"))
            }
            SocketMode::Datagram => {
                let n = buf.len().min(message.len());
                buf[..n].copy_from_slice(&message[..n]);
                if n < message.len() {
                    return Err(Error::Truncated { copied: n });
                }
                Ok(n)
            }
        }
    }

    /// Queues `buf` for sending: one datagram in message mode, a stream chunk
    ///  otherwise. Returns once the data is accepted into the send queue.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let state = self.state();
        if state.is_terminal() {
            return Err(state_error(state));
        }

        let Some(sender) = self.inner.message_out.lock().clone() else {
            return Err(Error::Closed);
        };
        let message = QueuedMessage { data: Bytes::copy_from_slice(buf), queued_at: Instant::now() };

        let mut state_rx = self.inner.state.subscribe();
        let mut deadline_rx = self.inner.write_deadline.subscribe();
        tokio::select! {
            sent = sender.send(message) => {
                sent.map(|_| buf.len()).map_err(|_| Error::Closed)
            }
            _ = wait_deadline(&mut deadline_rx) => Err(Error::DeadlineExceeded),
            _ = wait_terminal(&mut state_rx) => Err(state_error(self.state())),
        }
    }

    /// Idempotent: stops accepting writes, drains in-flight data for at most
    ///  the configured linger, announces Shutdown to the peer and unblocks any
    ///  concurrent `read`/`write`.
    pub async fn close(&self) -> Result<()> {
        self.inner.message_out.lock().take();
        let _ = self.inner.ctrl.try_send(ManageCmd::Close);

        let mut state_rx = self.inner.state.subscribe();
        loop {
            if state_rx.borrow_and_update().is_terminal() {
                return Ok(());
            }
            if state_rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Routes a handshake that arrived on the listener surface (destination
    ///  id 0) to this connection, e.g. a client's repeated request after the
    ///  response got lost.
    pub fn handle_handshake(&self, hs: HandshakeInfo) {
        self.inner
            .dispatch(Packet::control(ControlKind::Handshake(hs)), Instant::now());
    }

    /// Arms both deadlines; `None` clears them.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.read_deadline.send_replace(deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.write_deadline.send_replace(deadline);
    }

    pub(crate) fn inner(&self) -> Arc<ConnInner> {
        self.inner.clone()
    }
}

/// Completes when the armed deadline passes; pends forever while unarmed.
async fn wait_deadline(rx: &mut watch::Receiver<Option<Instant>>) {
    loop {
        let deadline = *rx.borrow_and_update();
        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                }
            }
            None => {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

async fn wait_terminal(rx: &mut watch::Receiver<SocketState>) {
    loop {
        if rx.borrow_and_update().is_terminal() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

pub(crate) struct ConnectionArgs {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub conn_id: u32,
    pub role: ConnectRole,
    pub mtu: u32,
    pub config: Arc<Config>,
    pub mux: Weak<Multiplexer>,
    pub mux_out: mpsc::Sender<OutboundPacket>,
    /// the client's request, for the server-accept path
    pub accept_hs: Option<HandshakeInfo>,
}

/// Builds a connection and spawns its manage task. The sender and receiver
///  engines are launched by the manage task once the state reaches Connected.
pub(crate) fn create(args: ConnectionArgs) -> Result<UdtConnection> {
    let config = args.config;
    let (recv_events_tx, recv_events_rx) = mpsc::channel(config.event_queue_depth);
    let (send_events_tx, send_events_rx) = mpsc::channel(config.event_queue_depth);
    let (handshakes_tx, handshakes_rx) = mpsc::channel(16);
    let (ctrl_tx, ctrl_rx) = mpsc::channel(4);
    let (signals_tx, signals_rx) = mpsc::channel(8);
    let (engine_pkts_tx, engine_pkts_rx) = mpsc::channel(64);
    let (messages_in_tx, messages_in_rx) = mpsc::channel(config.message_queue_depth);
    let (message_out_tx, message_out_rx) = mpsc::channel(config.message_queue_depth);

    let mode = match (&args.accept_hs, config.datagram) {
        (Some(hs), _) => hs.mode,
        (None, true) => SocketMode::Datagram,
        (None, false) => SocketMode::Stream,
    };

    // the server adopts the initiator's sequence; a handshake response always
    // echoes the initiator's, which lets the initiator validate it
    let isn = match &args.accept_hs {
        Some(hs) => hs.init_seq,
        None => PacketId::random(),
    };

    let metrics = Arc::new(ConnectionMetrics::new());
    let mtu = Arc::new(AtomicU32::new(args.mtu));
    let cc = Arc::new(Cc::new(
        Box::new(NativeCc::new()),
        metrics.clone(),
        mtu.clone(),
        config.max_bandwidth,
    ));
    let cc_out = cc.outputs();

    let initial_state = match args.role {
        ConnectRole::Client => SocketState::Connecting,
        ConnectRole::Rendezvous => SocketState::Rendezvous,
        ConnectRole::Server => SocketState::Init,
    };

    let inner = Arc::new(ConnInner {
        local_addr: args.local_addr,
        peer_addr: args.peer_addr,
        conn_id: args.conn_id,
        remote_id: AtomicU32::new(0),
        role: args.role,
        mode,
        config: config.clone(),
        created: Instant::now(),
        isn,
        mtu,
        negotiated_window: AtomicU32::new(config.max_flow_window),
        peer_window: Arc::new(AtomicU32::new(config.max_flow_window)),
        last_activity_us: Arc::new(AtomicU64::new(0)),
        metrics,
        cc,
        cc_out,
        state: watch::Sender::new(initial_state),
        read_deadline: watch::Sender::new(None),
        write_deadline: watch::Sender::new(None),
        recv_events: recv_events_tx,
        send_events: send_events_tx,
        handshakes: handshakes_tx,
        ctrl: ctrl_tx,
        message_out: parking_lot::Mutex::new(Some(message_out_tx)),
        reader: tokio::sync::Mutex::new(Reader { rx: messages_in_rx, current: None, offset: 0 }),
    });

    let mut manage = ManageTask {
        inner: inner.clone(),
        mux: args.mux,
        mux_out: args.mux_out,
        engines: Some(EngineParts {
            send_events_rx,
            recv_events_rx,
            message_out_rx,
            messages_in_tx,
            engine_pkts_tx,
            signals_tx,
        }),
        engine_handles: Vec::new(),
        recv_isn: None,
        accept_cookie: 0,
        linger_deadline: None,
        shutdown_sent: false,
        send_drained: false,
        rendezvous_peer_seen: false,
        rendezvous_response_sent: false,
        rendezvous_response_seen: false,
    };

    if let Some(hs) = args.accept_hs {
        manage.accept_request(&hs)?;
    }

    tokio::spawn(manage.run(handshakes_rx, signals_rx, ctrl_rx, engine_pkts_rx));

    Ok(UdtConnection { inner })
}

struct EngineParts {
    send_events_rx: mpsc::Receiver<(Packet, Instant)>,
    recv_events_rx: mpsc::Receiver<RecvEvent>,
    message_out_rx: mpsc::Receiver<QueuedMessage>,
    messages_in_tx: mpsc::Sender<Bytes>,
    engine_pkts_tx: mpsc::Sender<Packet>,
    signals_tx: mpsc::Sender<EngineSignal>,
}

/// The connection-management task: drives the handshake, owns the linger and
///  handshake timers, launches the engines and is the sole producer of this
///  connection's outbound packets toward the multiplexer.
struct ManageTask {
    inner: Arc<ConnInner>,
    mux: Weak<Multiplexer>,
    mux_out: mpsc::Sender<OutboundPacket>,
    engines: Option<EngineParts>,
    engine_handles: Vec<JoinHandle<()>>,
    recv_isn: Option<PacketId>,
    accept_cookie: u32,
    linger_deadline: Option<Instant>,
    shutdown_sent: bool,
    send_drained: bool,
    rendezvous_peer_seen: bool,
    rendezvous_response_sent: bool,
    rendezvous_response_seen: bool,
}

impl ManageTask {
    /// Server-accept: applies the client's request before the task even runs,
    ///  so the response can go out on the first loop turn.
    fn accept_request(&mut self, hs: &HandshakeInfo) -> Result<()> {
        if hs.udt_version != PROTOCOL_VERSION {
            return Err(Error::Corrupted("unsupported protocol version"));
        }
        self.inner.apply_peer_limits(hs);
        self.inner.remote_id.store(hs.conn_id, Ordering::Relaxed);
        self.recv_isn = Some(hs.init_seq);
        self.accept_cookie = hs.syn_cookie;
        self.inner.set_state(SocketState::Connected);
        Ok(())
    }

    async fn run(
        mut self,
        mut handshakes_rx: mpsc::Receiver<HandshakeInfo>,
        mut signals_rx: mpsc::Receiver<EngineSignal>,
        mut ctrl_rx: mpsc::Receiver<ManageCmd>,
        mut engine_pkts_rx: mpsc::Receiver<Packet>,
    ) {
        let handshake_deadline = Instant::now()
            + match self.inner.role {
                ConnectRole::Rendezvous => RENDEZVOUS_HANDSHAKE_TIMEOUT,
                _ => CLIENT_HANDSHAKE_TIMEOUT,
            };
        let mut resend = tokio::time::interval(HANDSHAKE_RESEND_INTERVAL);

        if self.inner.role == ConnectRole::Server {
            // answer the accepted request before anything else happens
            self.send_my_handshake().await;
        }

        loop {
            let state = self.inner.state_now();
            if state.is_terminal() {
                break;
            }
            if state == SocketState::Connected && self.engines.is_some() {
                self.launch_engines();
            }
            let connecting =
                matches!(state, SocketState::Connecting | SocketState::Rendezvous);

            let linger_at = self.linger_deadline.unwrap_or_else(|| far_future());

            tokio::select! {
                biased;
                cmd = ctrl_rx.recv() => match cmd {
                    Some(ManageCmd::Close) => self.on_close_requested().await,
                    None => break,
                },
                signal = signals_rx.recv() => match signal {
                    Some(signal) => self.on_signal(signal).await,
                    None => break,
                },
                hs = handshakes_rx.recv() => match hs {
                    Some(hs) => self.on_handshake(hs).await,
                    None => break,
                },
                packet = engine_pkts_rx.recv() => match packet {
                    Some(packet) => { self.send_to_peer(packet).await; }
                    None => break,
                },
                _ = resend.tick(), if connecting => {
                    self.send_my_handshake().await;
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(handshake_deadline)),
                        if connecting => {
                    info!("connection {}: handshake timed out", self.inner.conn_id);
                    self.inner.set_state(SocketState::Timeout);
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(linger_at)),
                        if self.linger_deadline.is_some() => {
                    debug!("connection {}: linger expired with data in flight", self.inner.conn_id);
                    self.finish_close().await;
                }
            }
        }

        self.teardown().await;
    }

    fn launch_engines(&mut self) {
        let Some(parts) = self.engines.take() else { return };
        let inner = &self.inner;
        let recv_isn = self.recv_isn.unwrap_or(inner.isn);

        info!(
            "connection {} to {:?} established ({:?}, mtu {})",
            inner.conn_id,
            inner.peer_addr,
            inner.mode,
            inner.mtu.load(Ordering::Relaxed),
        );
        inner.cc.init();

        let sender = Sender::new(
            SenderShared {
                cc: inner.cc.clone(),
                cc_out: inner.cc_out.clone(),
                metrics: inner.metrics.clone(),
                mtu: inner.mtu.clone(),
                peer_window: inner.peer_window.clone(),
                negotiated_window: inner.negotiated_window.load(Ordering::Relaxed),
                last_activity_us: inner.last_activity_us.clone(),
                created: inner.created,
            },
            inner.mode,
            inner.config.message_ttl,
            inner.isn,
            parts.engine_pkts_tx.clone(),
            parts.signals_tx.clone(),
        );
        self.engine_handles
            .push(tokio::spawn(sender.run(parts.send_events_rx, parts.message_out_rx)));

        let receiver = Receiver::new(
            ReceiverShared {
                cc: inner.cc.clone(),
                cc_out: inner.cc_out.clone(),
                metrics: inner.metrics.clone(),
                flow_window: inner.config.max_flow_window,
            },
            inner.mode,
            recv_isn,
            parts.signals_tx,
        );
        self.engine_handles.push(tokio::spawn(receiver.run(
            parts.recv_events_rx,
            parts.messages_in_tx,
            parts.engine_pkts_tx,
        )));
    }

    async fn send_to_peer(&self, packet: Packet) -> bool {
        let out = OutboundPacket {
            packet,
            dst: self.inner.peer_addr,
            remote_conn_id: self.inner.remote_id.load(Ordering::Relaxed),
            created: self.inner.created,
        };
        self.mux_out.send(out).await.is_ok()
    }

    async fn send_my_handshake(&self) {
        let (req_type, init_seq, cookie) = match self.inner.role {
            ConnectRole::Client => (HandshakeReqType::Request, self.inner.isn, 0),
            ConnectRole::Rendezvous => (HandshakeReqType::Rendezvous, self.inner.isn, 0),
            ConnectRole::Server => (HandshakeReqType::Response, self.inner.isn, self.accept_cookie),
        };
        let hs = self.inner.handshake_info(req_type, init_seq, cookie);
        trace!("connection {}: sending {:?}", self.inner.conn_id, req_type);
        self.send_to_peer(Packet::control(ControlKind::Handshake(hs))).await;
    }

    async fn send_handshake_reply(&self, req_type: HandshakeReqType, init_seq: PacketId, cookie: u32) {
        let hs = self.inner.handshake_info(req_type, init_seq, cookie);
        self.send_to_peer(Packet::control(ControlKind::Handshake(hs))).await;
    }

    async fn on_handshake(&mut self, hs: HandshakeInfo) {
        let state = self.inner.state_now();
        match state {
            SocketState::Connecting => self.on_handshake_connecting(hs).await,
            SocketState::Rendezvous => self.on_handshake_rendezvous(hs).await,
            SocketState::Connected => self.on_handshake_connected(hs).await,
            _ => {}
        }
    }

    async fn on_handshake_connecting(&mut self, hs: HandshakeInfo) {
        match hs.req_type {
            HandshakeReqType::Refused => {
                info!("connection {}: peer refused", self.inner.conn_id);
                self.inner.set_state(SocketState::Refused);
            }
            HandshakeReqType::Response => {
                if hs.udt_version != PROTOCOL_VERSION {
                    warn!("connection {}: peer speaks version {}", self.inner.conn_id, hs.udt_version);
                    self.inner.set_state(SocketState::Corrupted);
                    return;
                }
                if hs.mode != self.inner.mode {
                    warn!("connection {}: peer socket type mismatch", self.inner.conn_id);
                    self.inner.set_state(SocketState::Corrupted);
                    return;
                }
                if hs.init_seq != self.inner.isn {
                    warn!("connection {}: response does not echo our initial sequence", self.inner.conn_id);
                    self.inner.set_state(SocketState::Corrupted);
                    return;
                }
                self.inner.apply_peer_limits(&hs);
                self.inner.remote_id.store(hs.conn_id, Ordering::Relaxed);
                self.recv_isn = Some(hs.init_seq);
                self.inner.set_state(SocketState::Connected);
            }
            _ => trace!("connection {}: ignoring {:?} while connecting", self.inner.conn_id, hs.req_type),
        }
    }

    async fn on_handshake_rendezvous(&mut self, hs: HandshakeInfo) {
        if hs.udt_version != PROTOCOL_VERSION || hs.mode != self.inner.mode {
            self.inner.set_state(SocketState::Corrupted);
            return;
        }
        match hs.req_type {
            HandshakeReqType::Rendezvous => {
                self.inner.apply_peer_limits(&hs);
                self.inner.remote_id.store(hs.conn_id, Ordering::Relaxed);
                self.recv_isn = Some(hs.init_seq);
                self.rendezvous_peer_seen = true;
                // the response echoes the peer's sequence so they can validate it
                self.send_handshake_reply(HandshakeReqType::Response, hs.init_seq, hs.syn_cookie)
                    .await;
                self.rendezvous_response_sent = true;
                self.maybe_finish_rendezvous();
            }
            HandshakeReqType::Response => {
                if hs.init_seq != self.inner.isn {
                    self.inner.set_state(SocketState::Corrupted);
                    return;
                }
                self.inner.apply_peer_limits(&hs);
                self.inner.remote_id.store(hs.conn_id, Ordering::Relaxed);
                self.rendezvous_response_seen = true;
                self.send_handshake_reply(HandshakeReqType::Response2, self.inner.isn, hs.syn_cookie)
                    .await;
                self.maybe_finish_rendezvous();
            }
            HandshakeReqType::Response2 => {
                self.rendezvous_response_seen = true;
                self.maybe_finish_rendezvous();
            }
            HandshakeReqType::Refused => self.inner.set_state(SocketState::Refused),
            HandshakeReqType::Request => {}
        }
    }

    fn maybe_finish_rendezvous(&mut self) {
        if self.rendezvous_peer_seen && self.rendezvous_response_sent && self.rendezvous_response_seen {
            self.inner.set_state(SocketState::Connected);
        }
    }

    /// A duplicate handshake after the connection is up: a server repeats its
    ///  response, any other role confirms with Response2.
    async fn on_handshake_connected(&mut self, hs: HandshakeInfo) {
        match (self.inner.role, hs.req_type) {
            (ConnectRole::Server, HandshakeReqType::Request) => {
                self.inner.apply_peer_limits(&hs);
                self.send_handshake_reply(HandshakeReqType::Response, hs.init_seq, hs.syn_cookie)
                    .await;
            }
            (_, HandshakeReqType::Response | HandshakeReqType::Rendezvous) => {
                self.send_handshake_reply(HandshakeReqType::Response2, self.inner.isn, hs.syn_cookie)
                    .await;
            }
            _ => {}
        }
    }

    async fn on_close_requested(&mut self) {
        let state = self.inner.state_now();
        if state != SocketState::Connected {
            self.inner.set_state(SocketState::Closed);
            return;
        }
        if self.send_drained {
            self.finish_close().await;
            return;
        }
        if self.linger_deadline.is_none() {
            self.linger_deadline = Some(Instant::now() + self.inner.config.linger);
        }
    }

    async fn on_signal(&mut self, signal: EngineSignal) {
        match signal {
            EngineSignal::PeerTimeout => {
                self.inner.set_state(SocketState::Timeout);
            }
            EngineSignal::ShutdownReceived => {
                self.inner.set_state(SocketState::Closed);
            }
            EngineSignal::SendDrained => {
                self.send_drained = true;
                if self.linger_deadline.is_some() {
                    self.finish_close().await;
                }
            }
        }
    }

    async fn finish_close(&mut self) {
        if !self.shutdown_sent {
            self.shutdown_sent = true;
            self.send_to_peer(Packet::control(ControlKind::Shutdown)).await;
        }
        self.inner.set_state(SocketState::Closed);
    }

    async fn teardown(&mut self) {
        for handle in self.engine_handles.drain(..) {
            handle.abort();
        }
        self.inner.cc.close();
        self.inner.message_out.lock().take();
        if let Some(mux) = self.mux.upgrade() {
            mux.close_socket(self.inner.conn_id);
        }
        debug!("connection {} torn down as {:?}", self.inner.conn_id, self.inner.state_now());
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}
