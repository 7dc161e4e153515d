use anyhow::bail;
use std::time::Duration;

/// The smallest flow window either side may advertise.
pub const MIN_FLOW_WINDOW: u32 = 32;

/// Tunables for a multiplexer and the connections created through it.
#[derive(Clone, Debug)]
pub struct Config {
    /// Caps the MTU negotiated in the handshake. `None` uses the discovered
    ///  path MTU of the local interface.
    pub max_packet_size: Option<u32>,

    /// The maximum number of unacknowledged packets this side is willing to
    ///  buffer, advertised in the handshake. Minimum 32.
    pub max_flow_window: u32,

    /// How long a locally closed connection keeps draining unsent and
    ///  unacknowledged data before it is torn down.
    pub linger: Duration,

    /// Optional hard cap on the send rate, in packets per second. The pacing
    ///  period never drops below `1s / max_bandwidth`.
    pub max_bandwidth: Option<u32>,

    /// Message (datagram) mode rather than byte-stream mode. Peers must agree.
    pub datagram: bool,

    /// Time-to-live for queued datagram-mode messages. A message that is
    ///  still entirely untransmitted when its TTL expires is dropped
    ///  silently; a partly transmitted one is finished and its lost
    ///  fragments are abandoned with a drop request. `None` never expires.
    pub message_ttl: Option<Duration>,

    /// OS receive buffer for the UDP endpoint, if it should be resized.
    pub socket_recv_buffer: Option<usize>,
    /// OS send buffer for the UDP endpoint, if it should be resized.
    pub socket_send_buffer: Option<usize>,

    /// Depth of the per-connection inbound and outbound message queues.
    pub message_queue_depth: usize,
    /// Depth of the per-connection packet event queues. The multiplexer
    ///  drops inbound packets (and logs) when a queue is full; the protocol
    ///  recovers through NAKs.
    pub event_queue_depth: usize,
    /// Depth of the multiplexer's shared outbound packet queue.
    pub outbound_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_packet_size: None,
            max_flow_window: 25_600,
            linger: Duration::from_secs(10),
            max_bandwidth: None,
            datagram: true,
            message_ttl: None,
            socket_recv_buffer: None,
            socket_send_buffer: None,
            message_queue_depth: 256,
            event_queue_depth: 256,
            outbound_queue_depth: 100,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_flow_window < MIN_FLOW_WINDOW {
            bail!("max_flow_window must be at least {}", MIN_FLOW_WINDOW);
        }
        if let Some(max_packet_size) = self.max_packet_size {
            // below an IPv4 minimum-reassembly datagram there is no room for
            // headers plus a useful payload
            if max_packet_size < 576 {
                bail!("max_packet_size must be at least 576, was {}", max_packet_size);
            }
        }
        if let Some(0) = self.max_bandwidth {
            bail!("max_bandwidth of 0 would never send anything");
        }
        if self.message_queue_depth == 0 || self.event_queue_depth == 0 || self.outbound_queue_depth == 0
        {
            bail!("queue depths must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[rstest]
    #[case::window_too_small(Config { max_flow_window: 31, ..Config::default() })]
    #[case::tiny_packet_size(Config { max_packet_size: Some(100), ..Config::default() })]
    #[case::zero_bandwidth(Config { max_bandwidth: Some(0), ..Config::default() })]
    #[case::zero_queue(Config { event_queue_depth: 0, ..Config::default() })]
    fn test_invalid_configs(#[case] config: Config) {
        assert!(config.validate().is_err());
    }
}
