//! A user-space reliable transport implementing version 4 of the UDT
//!  (UDP-based Data Transfer) protocol: a connection-oriented,
//!  congestion-controlled byte-stream or message service layered over plain
//!  UDP datagrams.
//!
//! ## Shape of the implementation
//!
//! * One [`Multiplexer`] per local UDP address owns the endpoint and fans
//!   inbound datagrams out to connections by a 32-bit connection id;
//!   handshakes addressed to id 0 are matched against rendezvous connections
//!   first and handed to the installed [`HandshakeListener`] otherwise.
//! * Each [`UdtConnection`] runs three tasks: a sender engine (segmentation,
//!   pacing, retransmission, the EXP liveness timer), a receiver engine
//!   (reassembly, loss detection and NAKs, the ACK/ACK2 round trip, rate
//!   estimation) and a manage task that drives the handshake, owns the
//!   linger/close logic and is the sole producer of the connection's
//!   outbound packets.
//! * All queues are bounded; when a connection's inbound event queue is full
//!   the read loop drops the packet and the protocol recovers through NAKs.
//! * Congestion control is pluggable per connection
//!   ([`congestion::CongestionControl`]); the built-in policy is UDT's
//!   hybrid of window-based slow start and rate-based congestion avoidance.
//!
//! ## Wire format
//!
//! All integers are big-endian. Sequence numbers are 31 bits wide and wrap;
//!  comparisons use the half-range rule.
//!
//! Data packet:
//! ```ascii
//!  0: 0 (1 bit), packet sequence number (31 bits)
//!  4: message boundary (2 bits: 10 first, 00 middle, 01 last, 11 only),
//!     in-order flag (1 bit), message id (29 bits)
//!  8: timestamp (µs since the source connection was created)
//! 12: destination connection id
//! 16: payload
//! ```
//!
//! Control packet:
//! ```ascii
//!  0: 1 (1 bit), type (15 bits), reserved / user-defined subtype (16 bits)
//!  4: additional info (ACK sequence number, message id, ...)
//!  8: timestamp
//! 12: destination connection id
//! 16: type-specific payload
//! ```
//!
//! Control types: 0x0 handshake, 0x1 keep-alive, 0x2 ACK (light ACKs carry
//!  only the next expected sequence, full ACKs add RTT, RTT variance,
//!  available buffer, arrival rate and bandwidth), 0x3 NAK (a compressed
//!  loss list; ranges set the high bit on the first of two entries), 0x4
//!  congestion warning (obsolete), 0x5 shutdown, 0x6 ACK2, 0x7 message drop
//!  request, 0x7FFF user-defined (passed to the congestion controller).
//!
//! The handshake payload carries the protocol version (4), the socket type
//!  (0 stream / 1 datagram), the initial sequence, the maximum packet size
//!  and flow window, a request type (1 request, 0 rendezvous, -1 response,
//!  -2 response2, 1000 refused), the sender's connection id, a SYN cookie
//!  and the peer address in IPv6-mapped form. MTU and flow window are
//!  negotiated down to the smaller side's value during the handshake.

pub mod config;
pub mod congestion;
mod connection;
pub mod error;
pub mod metrics;
mod multiplexer;
pub mod packet;
pub mod packet_id;
mod recv;
mod send;
mod seq_buffers;

pub use config::Config;
pub use connection::{ConnectRole, SocketState, UdtConnection};
pub use error::{Error, Result};
pub use multiplexer::{HandshakeListener, Multiplexer};
pub use packet::{HandshakeInfo, SocketMode};

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
