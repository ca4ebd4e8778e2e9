use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::buffers::encryption::ENCRYPTION_OVERHEAD;
use crate::datagram::{FRAGMENTED_HEADER_SIZE, HEADER_SIZE};

/// What to do with a message on an unreliable channel that does not fit into a single datagram.
///  Unreliable channels never fragment.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OversizePolicy {
    /// the send operation fails
    Fail,
    /// the message is logged and silently discarded
    Drop,
}

/// How connection events are delivered to the application. Either way, callbacks for a given
///  connection are never invoked concurrently.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventDispatch {
    /// callbacks run on the task that triggered the event
    ///
    /// NB: for connections of a [crate::peer::UdpPeer], this is the peer's receive loop. A
    ///  callback that awaits something requiring further datagrams (e.g. `UdpConnection::close()`
    ///  or `connect()`) stalls the whole peer: nothing is received and nothing is polled, so not
    ///  even timeouts fire. Use `Queued` for handlers like that.
    Inline,
    /// events are queued, and a dedicated task per connection invokes the callbacks
    Queued,
}

/// Degrades traffic artificially for testing an application's behavior on a bad network. This
///  affects only timing and loss, never the protocol logic.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSimulation {
    /// probability in `0.0..=1.0` that a datagram is dropped, applied separately when sending
    ///  and when receiving
    pub loss_probability: f64,
    pub latency: Duration,
    /// added to `latency`, uniformly distributed in `0..=jitter`
    pub jitter: Duration,
}

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub self_addr: SocketAddr,

    /// If false, ConnectReq messages from unknown endpoints are ignored, and the peer can only
    ///  initiate connections
    pub accept_incoming_connections: bool,

    /// This is the size of the pooled buffers, and it is the upper bound for datagrams that can
    ///  be received. It must be at least `limit_mtu`.
    pub max_datagram_size: usize,
    /// This is the number of buffers that will be pooled at a given time - buffers in excess of this
    ///  number are discarded when they are returned.
    pub buffer_pool_size: usize,

    /// The MTU every connection starts with. 508 bytes is the largest UDP payload that is
    ///  guaranteed to pass any IPv4 path without fragmentation (576 bytes minimal reassembly
    ///  buffer minus maximum IP header and UDP header).
    pub initial_mtu: usize,
    /// MTU discovery never proposes more than this, and a peer never accepts more than this
    pub limit_mtu: usize,
    pub mtu_discovery: bool,
    pub mtu_expand_interval: Duration,
    /// after this many failed probes, the MTU is fixed at the last confirmed value
    pub mtu_expand_max_fail_attempts: u32,

    /// A connection that receives nothing for this long is closed with reason `Timeout`
    pub connection_timeout: Duration,
    pub ping_interval: Duration,
    /// Closed connections are kept for this long so that late messages from the peer can still
    ///  be answered
    pub linger_timeout: Duration,
    pub poll_interval: Duration,

    /// lower bound for the resend delay, which is otherwise derived from measured latency
    pub min_resend_delay: Duration,
    /// latency assumed before there is a measurement
    pub default_latency: Duration,

    /// Upper bound for application messages. Incoming fragmented messages are rejected if they
    ///  have more frames than a message of this size needs at the initial MTU, so both peers
    ///  should use the same `initial_mtu`.
    pub max_message_size: usize,
    pub oversized_unreliable_policy: OversizePolicy,
    pub event_dispatch: EventDispatch,

    /// If true, connections agree on a session key during the handshake, and application
    ///  messages are AES-GCM encrypted. Both sides must agree on this setting.
    pub encryption: bool,

    pub network_simulation: Option<NetworkSimulation>,
}

impl UdpConfig {
    pub fn default_for(self_addr: SocketAddr) -> UdpConfig {
        UdpConfig {
            self_addr,
            accept_incoming_connections: true,
            max_datagram_size: 1500,
            buffer_pool_size: 1024,
            initial_mtu: 508,
            limit_mtu: 1400,
            mtu_discovery: true,
            mtu_expand_interval: Duration::from_secs(1),
            mtu_expand_max_fail_attempts: 5,
            connection_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            linger_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            min_resend_delay: Duration::from_millis(100),
            default_latency: Duration::from_millis(100),
            max_message_size: 1024*1024,
            oversized_unreliable_policy: OversizePolicy::Fail,
            event_dispatch: EventDispatch::Inline,
            encryption: false,
            network_simulation: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_mtu <= FRAGMENTED_HEADER_SIZE.max(HEADER_SIZE + 2) {
            bail!("initial MTU of {} is too small", self.initial_mtu);
        }
        if self.limit_mtu < self.initial_mtu {
            bail!("MTU limit {} is smaller than the initial MTU {}", self.limit_mtu, self.initial_mtu);
        }
        if self.limit_mtu > u16::MAX as usize {
            bail!("MTU limit {} exceeds the maximum UDP payload", self.limit_mtu);
        }
        if self.max_datagram_size < self.limit_mtu {
            bail!("maximum datagram size {} is smaller than the MTU limit {}", self.max_datagram_size, self.limit_mtu);
        }
        if self.max_message_size == 0 {
            bail!("maximum message size must be positive");
        }
        if self.max_fragments() > u16::MAX as usize {
            bail!("maximum message size {} needs {} fragments at the initial MTU, more than the maximum of {}", self.max_message_size, self.max_fragments(), u16::MAX);
        }
        if self.poll_interval.is_zero() {
            bail!("poll interval must be positive");
        }
        if self.ping_interval.is_zero() || self.ping_interval >= self.connection_timeout {
            bail!("ping interval must be positive and shorter than the connection timeout");
        }
        if let Some(simulation) = &self.network_simulation {
            if !(0.0..=1.0).contains(&simulation.loss_probability) {
                bail!("loss probability {} is not in 0..=1", simulation.loss_probability);
            }
        }
        Ok(())
    }

    /// The largest number of frames a fragmented message can legitimately have
    pub fn max_fragments(&self) -> usize {
        (self.max_message_size + ENCRYPTION_OVERHEAD).div_ceil(self.initial_mtu.saturating_sub(FRAGMENTED_HEADER_SIZE).max(1))
    }

    /// The delay before resending an unacknowledged datagram or handshake message
    pub fn resend_delay(&self, average_latency: Option<Duration>) -> Duration {
        let latency = average_latency.unwrap_or(self.default_latency);
        self.min_resend_delay.max(latency * 3)
    }
}
