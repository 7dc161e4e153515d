use crate::config::Config;
use crate::connection::{self, ConnInner, ConnectRole, ConnectionArgs, UdtConnection};
use crate::error::{Error, Result};
use crate::packet::{ControlKind, ControlPacket, HandshakeInfo, HandshakeReqType, Packet};
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)]
use mockall::automock;
use rand::RngCore;
use rustc_hash::FxHashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// The protocol tick driving receiver timers, 10 ms.
const TICK_INTERVAL: Duration = Duration::from_millis(10);
/// Largest datagram the protocol will ever consider, 2^31 - 2.
const ABS_MAX_DATAGRAM: u32 = 0x7FFF_FFFE;
const DEFAULT_MTU: u32 = 65_535;

/// One process-wide multiplexer per bound local address.
static MULTIPLEXERS: LazyLock<parking_lot::Mutex<FxHashMap<SocketAddr, Arc<Multiplexer>>>> =
    LazyLock::new(|| parking_lot::Mutex::new(FxHashMap::default()));

/// A packet queued for the write loop, which stamps the destination id and
///  the source connection's relative timestamp just before serialisation.
pub(crate) struct OutboundPacket {
    pub packet: Packet,
    pub dst: SocketAddr,
    pub remote_conn_id: u32,
    pub created: Instant,
}

/// The seam toward the listener surface: handshakes addressed to connection
///  id 0 that no rendezvous connection claimed are delivered here. The
///  implementation must not block the read loop beyond a bounded queue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HandshakeListener: Send + Sync + 'static {
    async fn on_handshake(&self, hs: HandshakeInfo, from: SocketAddr);
}

/// Fans one UDP endpoint out to many connections: reads and routes inbound
///  datagrams by connection id, serialises outbound packets, and pumps the
///  10 ms receiver tick. Lives as long as it has a listener, a rendezvous
///  connection or any registered connection.
pub struct Multiplexer {
    self_weak: Weak<Multiplexer>,
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    config: Arc<Config>,
    mtu: u32,
    next_conn_id: AtomicU32,

    conns: parking_lot::RwLock<FxHashMap<u32, Arc<ConnInner>>>,
    rendezvous: parking_lot::Mutex<Vec<Arc<ConnInner>>>,
    listener: parking_lot::Mutex<Option<Arc<dyn HandshakeListener>>>,

    pkt_out: mpsc::Sender<OutboundPacket>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Multiplexer {
    /// Gets or creates the multiplexer for a local address. An explicit port
    ///  reuses a live multiplexer already bound to it; port 0 always binds a
    ///  fresh ephemeral endpoint.
    pub async fn bind(addr: SocketAddr, config: Config) -> Result<Arc<Multiplexer>> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        if addr.port() != 0 {
            if let Some(existing) = MULTIPLEXERS.lock().get(&addr) {
                if existing.is_live() {
                    return Ok(existing.clone());
                }
            }
        }

        let socket = Arc::new(Self::open_socket(addr, &config)?);
        let local_addr = socket.local_addr()?;

        let discovered = discover_path_mtu(local_addr.ip());
        let mtu = config.max_packet_size.unwrap_or(discovered).min(discovered);
        info!("multiplexer bound to {} (path mtu {})", local_addr, mtu);

        let (pkt_out_tx, pkt_out_rx) = mpsc::channel(config.outbound_queue_depth);

        let mux = Arc::new_cyclic(|self_weak| Multiplexer {
            self_weak: self_weak.clone(),
            local_addr,
            socket: socket.clone(),
            config: Arc::new(config),
            mtu,
            next_conn_id: AtomicU32::new(rand::thread_rng().next_u32()),
            conns: parking_lot::RwLock::new(FxHashMap::default()),
            rendezvous: parking_lot::Mutex::new(Vec::new()),
            listener: parking_lot::Mutex::new(None),
            pkt_out: pkt_out_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let mut tasks = mux.tasks.lock();
        tasks.push(tokio::spawn(Self::read_loop(mux.clone())));
        tasks.push(tokio::spawn(Self::write_loop(socket, pkt_out_rx)));
        tasks.push(tokio::spawn(Self::tick_loop(mux.clone())));
        drop(tasks);

        MULTIPLEXERS.lock().insert(local_addr, mux.clone());
        Ok(mux)
    }

    fn open_socket(addr: SocketAddr, config: &Config) -> Result<UdpSocket> {
        let domain = match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        };
        let socket =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        if let Some(size) = config.socket_recv_buffer {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = config.socket_send_buffer {
            socket.set_send_buffer_size(size)?;
        }
        socket.bind(&addr.into())?;

        if let Err(e) = set_dont_fragment(&socket, addr) {
            warn!("could not set the don't-fragment option: {}", e);
        }

        Ok(UdpSocket::from_std(socket.into())?)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The discovered (and config-capped) path MTU for this endpoint.
    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Installs the listener; false if another one is already installed.
    pub fn set_listener(&self, listener: Arc<dyn HandshakeListener>) -> bool {
        let mut guard = self.listener.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(listener);
        true
    }

    pub fn clear_listener(&self) {
        self.listener.lock().take();
        self.check_live();
    }

    /// Starts an outgoing connection; the dialer awaits `wait_connected`.
    pub fn new_client(&self, peer: SocketAddr) -> Result<UdtConnection> {
        self.create_conn(peer, ConnectRole::Client, None)
    }

    /// Starts a rendezvous connection toward a peer doing the same.
    pub fn new_rendezvous(&self, peer: SocketAddr) -> Result<UdtConnection> {
        self.create_conn(peer, ConnectRole::Rendezvous, None)
    }

    /// Server-side accept of a connection request, called by the listener
    ///  surface once it has decided to take the connection.
    pub fn accept(&self, hs: HandshakeInfo, from: SocketAddr) -> Result<UdtConnection> {
        if hs.req_type != HandshakeReqType::Request {
            return Err(Error::Malformed("not a connection request"));
        }
        self.create_conn(from, ConnectRole::Server, Some(hs))
    }

    fn create_conn(
        &self,
        peer: SocketAddr,
        role: ConnectRole,
        accept_hs: Option<HandshakeInfo>,
    ) -> Result<UdtConnection> {
        let conn_id = self.alloc_conn_id();
        let conn = connection::create(ConnectionArgs {
            local_addr: self.local_addr,
            peer_addr: peer,
            conn_id,
            role,
            mtu: self.mtu,
            config: self.config.clone(),
            mux: self.self_weak.clone(),
            mux_out: self.pkt_out.clone(),
            accept_hs,
        })?;

        self.conns.write().insert(conn_id, conn.inner());
        if role == ConnectRole::Rendezvous {
            self.rendezvous.lock().push(conn.inner());
        }
        debug!("created connection {} to {} as {:?}", conn_id, peer, role);
        Ok(conn)
    }

    fn alloc_conn_id(&self) -> u32 {
        loop {
            let id = self.next_conn_id.fetch_sub(1, Ordering::Relaxed);
            if id != 0 && !self.conns.read().contains_key(&id) {
                return id;
            }
        }
    }

    /// Removes a connection at teardown and re-evaluates the multiplexer's
    ///  own lifetime.
    pub(crate) fn close_socket(&self, conn_id: u32) {
        self.conns.write().remove(&conn_id);
        self.rendezvous.lock().retain(|c| c.conn_id() != conn_id);
        self.check_live();
    }

    fn is_live(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.listener.lock().is_some()
            || !self.rendezvous.lock().is_empty()
            || !self.conns.read().is_empty()
    }

    /// Tears the endpoint down once nothing references it, re-checking under
    ///  the registry lock to tolerate a concurrent insertion.
    fn check_live(&self) {
        if self.is_live() {
            return;
        }
        let mut registry = MULTIPLEXERS.lock();
        if self.is_live() {
            return;
        }
        registry.remove(&self.local_addr);
        if self.is_live() {
            if let Some(strong) = self.self_weak.upgrade() {
                registry.insert(self.local_addr, strong);
            }
            return;
        }
        drop(registry);

        info!("multiplexer on {} has no users, shutting down", self.local_addr);
        self.closed.store(true, Ordering::Relaxed);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn read_loop(mux: Arc<Multiplexer>) {
        let mut buf = vec![0u8; 65_536];
        loop {
            let (len, from) = match mux.socket.recv_from(&mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    if mux.closed.load(Ordering::Relaxed) {
                        return;
                    }
                    error!("udp read failed: {}", e);
                    continue;
                }
            };
            let now = Instant::now();

            let packet = match Packet::decode(&mut &buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("dropping undecodable packet from {}: {}", from, e);
                    continue;
                }
            };

            mux.route_packet(packet, from, now).await;
        }
    }

    async fn route_packet(&self, packet: Packet, from: SocketAddr, now: Instant) {
        let dst_id = packet.dst_conn_id();

        if dst_id == 0 {
            let Packet::Control(ControlPacket { kind: ControlKind::Handshake(hs), .. }) = packet
            else {
                debug!("dropping non-handshake packet addressed to connection 0");
                return;
            };

            let rendezvous_match = self
                .rendezvous
                .lock()
                .iter()
                .find(|conn| conn.matches_rendezvous(from))
                .cloned();
            if let Some(conn) = rendezvous_match {
                trace!("handshake from {} matched rendezvous connection {}", from, conn.conn_id());
                conn.dispatch(Packet::control(ControlKind::Handshake(hs)), now);
                return;
            }

            let listener = self.listener.lock().clone();
            match listener {
                Some(listener) => listener.on_handshake(hs, from).await,
                None => debug!("handshake from {} with no listener installed", from),
            }
            return;
        }

        let conn = self.conns.read().get(&dst_id).cloned();
        match conn {
            Some(conn) => conn.dispatch(packet, now),
            None => trace!("dropping packet for unknown connection {}", dst_id),
        }
    }

    async fn write_loop(socket: Arc<UdpSocket>, mut pkt_out: mpsc::Receiver<OutboundPacket>) {
        let mut buf = BytesMut::with_capacity(65_536);
        while let Some(mut out) = pkt_out.recv().await {
            let timestamp = out.created.elapsed().as_micros() as u32;
            out.packet.stamp(out.remote_conn_id, timestamp);

            buf.clear();
            out.packet.encode(&mut buf);
            if let Err(e) = socket.send_to(&buf, out.dst).await {
                debug!("udp write to {} failed: {}", out.dst, e);
            }
        }
    }

    async fn tick_loop(mux: Arc<Multiplexer>) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        loop {
            tick.tick().await;
            let conns: Vec<Arc<ConnInner>> = mux.conns.read().values().cloned().collect();
            let now = Instant::now();
            for conn in conns {
                conn.tick(now);
            }
        }
    }
}

/// Sets the platform's don't-fragment behavior so the path drops rather than
///  fragments oversized datagrams.
#[cfg(target_os = "linux")]
fn set_dont_fragment(socket: &socket2::Socket, addr: SocketAddr) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let fd = socket.as_raw_fd();
    let (level, option) = match addr {
        SocketAddr::V4(_) => (libc::IPPROTO_IP, libc::IP_MTU_DISCOVER),
        SocketAddr::V6(_) => (libc::IPPROTO_IPV6, libc::IPV6_MTU_DISCOVER),
    };
    let value: libc::c_int = libc::IP_PMTUDISC_DO;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_dont_fragment(_socket: &socket2::Socket, _addr: SocketAddr) -> io::Result<()> {
    Ok(())
}

/// The largest MTU among up, non-loopback interfaces carrying the local IP
///  (all interfaces when none match), floored at 65535 and capped at 2^31 - 2.
#[cfg(target_os = "linux")]
fn discover_path_mtu(local_ip: IpAddr) -> u32 {
    use std::os::fd::AsRawFd;

    let mut best = DEFAULT_MTU;

    let Ok(probe) = std::net::UdpSocket::bind("0.0.0.0:0") else {
        return best;
    };

    unsafe {
        let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut addrs) != 0 {
            return best;
        }

        let mut matching: Vec<[libc::c_char; libc::IFNAMSIZ]> = Vec::new();
        let mut all: Vec<[libc::c_char; libc::IFNAMSIZ]> = Vec::new();
        let mut cursor = addrs;
        while !cursor.is_null() {
            let entry = &*cursor;
            cursor = entry.ifa_next;

            let flags = entry.ifa_flags;
            if flags & libc::IFF_UP as u32 == 0 || flags & libc::IFF_LOOPBACK as u32 != 0 {
                continue;
            }
            let mut name = [0 as libc::c_char; libc::IFNAMSIZ];
            let name_len = libc::strlen(entry.ifa_name).min(libc::IFNAMSIZ - 1);
            std::ptr::copy_nonoverlapping(entry.ifa_name, name.as_mut_ptr(), name_len);
            all.push(name);

            if entry.ifa_addr.is_null() {
                continue;
            }
            let carried = match (*entry.ifa_addr).sa_family as libc::c_int {
                libc::AF_INET => {
                    let sin = &*(entry.ifa_addr as *const libc::sockaddr_in);
                    IpAddr::V4(u32::from_be(sin.sin_addr.s_addr).into())
                }
                libc::AF_INET6 => {
                    let sin6 = &*(entry.ifa_addr as *const libc::sockaddr_in6);
                    IpAddr::V6(sin6.sin6_addr.s6_addr.into())
                }
                _ => continue,
            };
            if carried == local_ip {
                matching.push(name);
            }
        }
        libc::freeifaddrs(addrs);

        let candidates = if matching.is_empty() { all } else { matching };
        let fd = probe.as_raw_fd();
        for name in candidates {
            let mut req: libc::ifreq = std::mem::zeroed();
            req.ifr_name = name;
            if libc::ioctl(fd, libc::SIOCGIFMTU, &mut req) == 0 {
                let mtu = req.ifr_ifru.ifru_mtu;
                if mtu > 0 && mtu as u32 > best {
                    best = mtu as u32;
                }
            }
        }
    }

    best.min(ABS_MAX_DATAGRAM)
}

#[cfg(not(target_os = "linux"))]
fn discover_path_mtu(_local_ip: IpAddr) -> u32 {
    DEFAULT_MTU
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_id::PacketId;
    use std::net::Ipv4Addr;

    fn local(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_discovered_mtu_bounds() {
        let mtu = discover_path_mtu(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(mtu >= DEFAULT_MTU);
        assert!(mtu <= ABS_MAX_DATAGRAM);
    }

    #[tokio::test]
    async fn test_bind_registers_and_is_reused() {
        let first = Multiplexer::bind(local(0), Config::default()).await.expect("bind");
        let bound = first.local_addr();
        assert_ne!(bound.port(), 0);

        // a listener keeps it alive, and binding the same port again reuses it
        let listener = Arc::new(MockHandshakeListener::new());
        assert!(first.set_listener(listener.clone()));
        assert!(!first.set_listener(listener));

        let second = Multiplexer::bind(bound, Config::default()).await.expect("rebind");
        assert!(Arc::ptr_eq(&first, &second));

        first.clear_listener();
    }

    #[tokio::test]
    async fn test_teardown_when_last_user_leaves() {
        let mux = Multiplexer::bind(local(0), Config::default()).await.expect("bind");
        let addr = mux.local_addr();

        let conn = mux.new_client(local(9)).expect("client connection");
        assert!(mux.is_live());
        assert!(MULTIPLEXERS.lock().contains_key(&addr));

        conn.close().await.expect("close");
        // the manage task deregisters the connection on teardown
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!mux.is_live());
        assert!(!MULTIPLEXERS.lock().contains_key(&addr));
    }

    #[tokio::test]
    async fn test_conn_id_allocation_skips_zero_and_duplicates() {
        let mux = Multiplexer::bind(local(0), Config::default()).await.expect("bind");
        mux.next_conn_id.store(1, Ordering::Relaxed);

        let a = mux.alloc_conn_id();
        let b = mux.alloc_conn_id();
        assert_eq!(a, 1);
        assert_ne!(b, 0, "id 0 is reserved for handshakes");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_handshake_to_id_zero_reaches_listener() {
        let mux = Multiplexer::bind(local(0), Config::default()).await.expect("bind");

        let (seen_tx, mut seen_rx) = mpsc::channel(1);
        let mut listener = MockHandshakeListener::new();
        listener.expect_on_handshake().returning(move |hs, from| {
            let _ = seen_tx.try_send((hs, from));
        });
        assert!(mux.set_listener(Arc::new(listener)));

        let hs = HandshakeInfo {
            udt_version: 4,
            mode: crate::packet::SocketMode::Datagram,
            init_seq: PacketId::from_raw(1),
            max_packet_size: 1500,
            max_flow_window: 8192,
            req_type: HandshakeReqType::Request,
            conn_id: 42,
            syn_cookie: 0,
            peer_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        };
        mux.route_packet(
            Packet::control(ControlKind::Handshake(hs.clone())),
            local(1234),
            Instant::now(),
        )
        .await;

        let (seen_hs, seen_from) = seen_rx.recv().await.expect("listener notified");
        assert_eq!(seen_hs, hs);
        assert_eq!(seen_from, local(1234));

        mux.clear_listener();
    }

    #[tokio::test]
    async fn test_non_handshake_to_id_zero_is_dropped() {
        let mux = Multiplexer::bind(local(0), Config::default()).await.expect("bind");
        let mut listener = MockHandshakeListener::new();
        listener.expect_on_handshake().never();
        assert!(mux.set_listener(Arc::new(listener)));

        mux.route_packet(Packet::control(ControlKind::KeepAlive), local(1234), Instant::now())
            .await;

        mux.clear_listener();
    }
}
