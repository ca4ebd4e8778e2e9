//! A connection to one remote endpoint: handshake, keep-alive, MTU discovery, timeout and
//!  graceful close, plus routing of application messages through channels.
//!
//! Handshake (client side initiates):
//! ```ascii
//! client                          server
//!   | ---- ConnectReq [pubkey] ---> |   server consults the application's accept policy
//!   | <--- ConnectResp [pubkey] --- |   or DisconnectResp if rejected
//! ```
//! ConnectReq and DisconnectReq are resent until they are answered. The payload carries an X25519
//!  public key if encryption is enabled, and is empty otherwise.

pub mod latency;
pub mod mtu_discovery;
pub mod status;

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::encryption::{KeyAgreement, MessageCipher, NoEncryption};
use crate::channels::{create_channel, Channel, ChannelDescriptor, DatagramLink, SendOutcome};
use crate::config::{OversizePolicy, UdpConfig};
use crate::connection::latency::{LatencyEstimate, PingState};
use crate::connection::mtu_discovery::MtuDiscovery;
use crate::connection::status::{CloseReason, ConnectionInfo, ConnectionStatus};
use crate::datagram::{Datagram, DatagramHeader, DeliveryType, MessageType, HEADER_SIZE};
use crate::event_dispatcher::{ConnectionEvent, ConnectionHandler, EventDispatcher};
use crate::fragmentation::{split_message, FragmentReassembly};
use crate::send_pipeline::SendPipeline;
use crate::sequence_number::SequenceNumber;

/// The connection's implementation of [DatagramLink], shared with its channels
struct ConnectionLink {
    peer_addr: std::net::SocketAddr,
    pipeline: Arc<SendPipeline>,
    latency: Arc<LatencyEstimate>,
    config: Arc<UdpConfig>,
    /// set when a send failed in a way that makes the peer unreachable
    fatal_error: AtomicBool,
}

impl ConnectionLink {
    fn take_fatal_error(&self) -> bool {
        self.fatal_error.swap(false, Ordering::AcqRel)
    }
}

#[async_trait]
impl DatagramLink for ConnectionLink {
    async fn transmit(&self, datagram: &Datagram) -> anyhow::Result<()> {
        trace!("sending {:?} to {:?}", datagram, self.peer_addr);
        if let Err(e) = self.pipeline.send(self.peer_addr, datagram.as_bytes()).await {
            self.fatal_error.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn resend_delay(&self) -> Duration {
        self.config.resend_delay(self.latency.average())
    }
}

/// Completes when a connect or close operation finishes
pub struct PendingOperation {
    receiver: oneshot::Receiver<anyhow::Result<()>>,
}

impl PendingOperation {
    fn new() -> (oneshot::Sender<anyhow::Result<()>>, PendingOperation) {
        let (sender, receiver) = oneshot::channel();
        (sender, PendingOperation { receiver })
    }

    fn completed() -> PendingOperation {
        let (sender, result) = PendingOperation::new();
        let _ = sender.send(Ok(()));
        result
    }

    pub async fn wait(self) -> anyhow::Result<()> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => bail!("connection was discarded before the operation completed"),
        }
    }
}

struct ConnectionState {
    status: ConnectionStatus,
    close_reason: Option<CloseReason>,
    disconnected_at: Option<Instant>,
    last_received: Instant,
    /// last time ConnectReq / DisconnectReq was sent
    handshake_sent_at: Instant,
    close_payload: Option<Vec<u8>>,
    connect_waiters: Vec<oneshot::Sender<anyhow::Result<()>>>,
    close_waiters: Vec<oneshot::Sender<anyhow::Result<()>>>,
    cipher: Arc<dyn MessageCipher>,
    ping: PingState,
    mtu: MtuDiscovery,
}

impl ConnectionState {
    fn transition(&mut self, new_status: ConnectionStatus, events: &mut Vec<ConnectionEvent>) {
        let old_status = self.status;
        if old_status == new_status {
            return;
        }
        debug!("connection status {:?} -> {:?}", old_status, new_status);
        self.status = new_status;
        if new_status == ConnectionStatus::Disconnected {
            self.disconnected_at = Some(Instant::now());
        }
        events.push(ConnectionEvent::StatusChanged { old_status, new_status });
    }

    fn on_connected(&mut self, events: &mut Vec<ConnectionEvent>) {
        self.transition(ConnectionStatus::Connected, events);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        events.push(ConnectionEvent::Opened);
    }

    fn finish(&mut self, reason: CloseReason, payload: Option<Vec<u8>>, events: &mut Vec<ConnectionEvent>) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }
        info!("connection closed: {:?}", reason);

        self.transition(ConnectionStatus::Disconnected, events);
        self.close_reason = Some(reason);

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(anyhow!("connection closed before it was established: {:?}", reason)));
        }
        for waiter in self.close_waiters.drain(..) {
            let result = match reason {
                CloseReason::ClosedByThisPeer | CloseReason::ClosedByOtherPeer => Ok(()),
                CloseReason::Error | CloseReason::Timeout => Err(anyhow!("connection closed: {:?}", reason)),
            };
            let _ = waiter.send(result);
        }
        events.push(ConnectionEvent::Closed { reason, payload });
    }
}

pub struct UdpConnection {
    info: ConnectionInfo,
    connection_key: u16,
    config: Arc<UdpConfig>,
    buffer_pool: Arc<BufferPool>,
    link: Arc<ConnectionLink>,
    latency: Arc<LatencyEstimate>,
    key_agreement: Option<KeyAgreement>,
    handler: Arc<dyn ConnectionHandler>,
    events: EventDispatcher,
    state: Mutex<ConnectionState>,
    channels: RwLock<FxHashMap<ChannelDescriptor, Arc<dyn Channel>>>,
    fragments: Mutex<FragmentReassembly>,
    next_group_id: AtomicU16,
}

impl UdpConnection {
    /// NB: the connection key is fixed for the connection's lifetime. The connecting side picks
    ///  it at random, the accepting side adopts it from the ConnectReq.
    pub fn new(
        info: ConnectionInfo,
        connection_key: u16,
        config: Arc<UdpConfig>,
        buffer_pool: Arc<BufferPool>,
        pipeline: Arc<SendPipeline>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> UdpConnection {
        let latency = Arc::new(LatencyEstimate::default());
        let link = Arc::new(ConnectionLink {
            peer_addr: info.peer_addr,
            pipeline,
            latency: latency.clone(),
            config: config.clone(),
            fatal_error: AtomicBool::new(false),
        });

        let now = Instant::now();
        let state = ConnectionState {
            status: ConnectionStatus::Waiting,
            close_reason: None,
            disconnected_at: None,
            last_received: now,
            handshake_sent_at: now,
            close_payload: None,
            connect_waiters: Vec::new(),
            close_waiters: Vec::new(),
            cipher: Arc::new(NoEncryption),
            ping: PingState::new(),
            mtu: MtuDiscovery::new(&config),
        };
        let fragments = FragmentReassembly::new(config.max_fragments());

        UdpConnection {
            info,
            connection_key,
            key_agreement: config.encryption.then(KeyAgreement::new),
            events: EventDispatcher::new(config.event_dispatch, info, handler.clone()),
            handler,
            config,
            buffer_pool,
            link,
            latency,
            state: Mutex::new(state),
            channels: Default::default(),
            fragments: Mutex::new(fragments),
            next_group_id: AtomicU16::new(0),
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info
    }

    pub fn connection_key(&self) -> u16 {
        self.connection_key
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status
    }

    pub async fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().await.close_reason
    }

    pub async fn disconnected_at(&self) -> Option<Instant> {
        self.state.lock().await.disconnected_at
    }

    pub async fn mtu(&self) -> usize {
        self.state.lock().await.mtu.current()
    }

    /// smoothed round-trip time, if there was a measurement yet
    pub fn average_latency(&self) -> Option<Duration> {
        self.latency.average()
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.latency.last()
    }

    fn handshake_payload(&self) -> Vec<u8> {
        self.key_agreement.as_ref()
            .map(|k| k.public_key().to_vec())
            .unwrap_or_default()
    }

    async fn send_control(&self, message_type: MessageType, sequence: SequenceNumber, payload: &[u8]) -> anyhow::Result<()> {
        let datagram = Datagram::new(&self.buffer_pool, DatagramHeader::control(message_type, self.connection_key, sequence), payload)?;
        self.link.transmit(&datagram).await
    }

    /// control messages are best effort: lost ones are resent, and a fatal send error is picked
    ///  up by the next poll
    async fn send_control_logged(&self, message_type: MessageType, sequence: SequenceNumber, payload: &[u8]) {
        if let Err(e) = self.send_control(message_type, sequence, payload).await {
            debug!("error sending {:?} to {}: {}", message_type, self.info, e);
        }
    }

    async fn channel(&self, descriptor: ChannelDescriptor) -> Arc<dyn Channel> {
        if let Some(channel) = self.channels.read().await.get(&descriptor) {
            return channel.clone();
        }

        self.channels.write().await
            .entry(descriptor)
            .or_insert_with(|| {
                debug!("initializing channel {:?} for connection {}", descriptor, self.info);
                create_channel(descriptor, self.connection_key, self.buffer_pool.clone(), self.link.clone())
            })
            .clone()
    }

    /// Starts the handshake, returning a handle to await its completion
    pub async fn start_connect(&self) -> anyhow::Result<PendingOperation> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock().await;
            if state.status != ConnectionStatus::Waiting {
                bail!("connection {} can not connect in status {:?}", self.info, state.status);
            }

            info!("connecting to {}", self.info);
            state.transition(ConnectionStatus::Connecting, &mut events);
            let now = Instant::now();
            state.handshake_sent_at = now;
            state.last_received = now;

            let (sender, result) = PendingOperation::new();
            state.connect_waiters.push(sender);

            self.send_control_logged(MessageType::ConnectReq, SequenceNumber::ZERO, &self.handshake_payload()).await;
            result
        };
        self.events.dispatch(events).await;
        Ok(result)
    }

    pub async fn connect(&self) -> anyhow::Result<()> {
        self.start_connect().await?
            .wait().await
    }

    /// Starts a graceful close. The payload is passed to the peer's application.
    pub async fn start_close(&self, payload: Option<&[u8]>) -> anyhow::Result<PendingOperation> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock().await;
            match state.status {
                ConnectionStatus::Waiting => {
                    state.finish(CloseReason::ClosedByThisPeer, None, &mut events);
                    PendingOperation::completed()
                }
                ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                    info!("closing connection {}", self.info);
                    state.transition(ConnectionStatus::Disconnecting, &mut events);
                    state.handshake_sent_at = Instant::now();
                    state.close_payload = payload.map(|p| p.to_vec());

                    let (sender, result) = PendingOperation::new();
                    state.close_waiters.push(sender);
                    self.send_control_logged(MessageType::DisconnectReq, SequenceNumber::ZERO, payload.unwrap_or_default()).await;
                    result
                }
                ConnectionStatus::Disconnecting => {
                    let (sender, result) = PendingOperation::new();
                    state.close_waiters.push(sender);
                    result
                }
                ConnectionStatus::Disconnected => PendingOperation::completed(),
            }
        };
        self.events.dispatch(events).await;
        Ok(result)
    }

    pub async fn close(&self, payload: Option<&[u8]>) -> anyhow::Result<()> {
        self.start_close(payload).await?
            .wait().await
    }

    /// Closes the connection without waiting for the peer's confirmation
    pub async fn shutdown(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().await;
            if state.status.is_open() {
                let payload = state.close_payload.clone().unwrap_or_default();
                self.send_control_logged(MessageType::DisconnectReq, SequenceNumber::ZERO, &payload).await;
            }
            state.finish(CloseReason::ClosedByThisPeer, None, &mut events);
        }
        self.events.dispatch(events).await;
    }

    /// Sends an application message. Messages that do not fit into a single datagram are
    ///  fragmented on reliable channels, and handled according to the configured
    ///  [OversizePolicy] on unreliable channels.
    pub async fn send(&self, message: &[u8], delivery_type: DeliveryType, channel: u8) -> anyhow::Result<SendOutcome> {
        let descriptor = ChannelDescriptor::new(channel, delivery_type)?;
        if message.len() > self.config.max_message_size {
            bail!("message of {} bytes exceeds the maximum message size of {}", message.len(), self.config.max_message_size);
        }

        let (cipher, mtu) = {
            let state = self.state.lock().await;
            if state.status != ConnectionStatus::Connected {
                bail!("connection {} is not connected ({:?})", self.info, state.status);
            }
            (state.cipher.clone(), state.mtu.current())
        };

        let mut buf = BytesMut::from(message);
        cipher.encrypt_buffer(&mut buf)?;

        let channel = self.channel(descriptor).await;

        if buf.len() + HEADER_SIZE <= mtu {
            let datagram = Datagram::new(&self.buffer_pool, DatagramHeader::user_data(descriptor, self.connection_key, None), &buf)?;
            return channel.send_datagram(datagram).await;
        }

        if !delivery_type.is_reliable() {
            match self.config.oversized_unreliable_policy {
                OversizePolicy::Fail => {
                    bail!("message of {} bytes exceeds the MTU of {} on unreliable channel {:?}", message.len(), mtu, descriptor);
                }
                OversizePolicy::Drop => {
                    warn!("dropping message of {} bytes exceeding the MTU of {} on unreliable channel {:?}", message.len(), mtu, descriptor);
                    return Ok(SendOutcome::Dropped);
                }
            }
        }

        let group_id = self.next_group_id.fetch_add(1, Ordering::Relaxed);
        let frames = split_message(&buf, mtu, group_id)?;
        debug!("fragmenting message of {} bytes into {} frames on {:?}", buf.len(), frames.len(), descriptor);

        let mut outcome = SendOutcome::Sent;
        for (info, chunk) in frames {
            let datagram = Datagram::new(&self.buffer_pool, DatagramHeader::user_data(descriptor, self.connection_key, Some(info)), chunk)?;
            if channel.send_datagram(datagram).await? == SendOutcome::Queued {
                outcome = SendOutcome::Queued;
            }
        }
        Ok(outcome)
    }

    /// Handles a datagram from the peer. Protocol violations and datagrams that do not fit the
    ///  connection's state are logged and dropped.
    pub async fn on_datagram(&self, datagram: Datagram) {
        if datagram.connection_key() != self.connection_key {
            debug!("dropping datagram with connection key {} for connection {} with key {}", datagram.connection_key(), self.info, self.connection_key);
            return;
        }
        trace!("received {:?} on connection {}", datagram, self.info);

        let message_type = datagram.message_type();
        let status = {
            let mut state = self.state.lock().await;
            state.last_received = Instant::now();
            state.status
        };

        if status == ConnectionStatus::Disconnected {
            if message_type != MessageType::DisconnectResp {
                debug!("received {:?} on closed connection {} - re-sending DisconnectResp", message_type, self.info);
                self.send_control_logged(MessageType::DisconnectResp, SequenceNumber::ZERO, &[]).await;
            }
            return;
        }

        let mut events = Vec::new();
        let result = match message_type {
            MessageType::UserData => self.on_user_data(datagram, &mut events).await,
            MessageType::DeliveryAck => self.on_delivery_ack(datagram).await,
            _ => self.on_control_datagram(datagram, &mut events).await,
        };
        if let Err(e) = result {
            debug!("dropping {:?} on connection {}: {}", message_type, self.info, e);
        }

        self.events.dispatch(events).await;
    }

    async fn on_user_data(&self, datagram: Datagram, events: &mut Vec<ConnectionEvent>) -> anyhow::Result<()> {
        let cipher = {
            let state = self.state.lock().await;
            if state.status != ConnectionStatus::Connected {
                bail!("not connected ({:?})", state.status);
            }
            state.cipher.clone()
        };

        let descriptor = datagram.descriptor();
        if datagram.fragment().is_some() && !descriptor.delivery_type.is_reliable() {
            bail!("fragmented datagram on unreliable channel {:?}", descriptor);
        }
        let channel = self.channel(descriptor).await;

        for accepted in channel.on_datagram(datagram).await? {
            let message = if accepted.fragment().is_some() {
                match self.fragments.lock().await.add_frame(accepted) {
                    Ok(Some(message)) => message,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("dropping invalid frame on connection {}: {}", self.info, e);
                        continue;
                    }
                }
            }
            else {
                accepted.payload().to_vec()
            };

            let mut buf = BytesMut::from(message.as_slice());
            if let Err(e) = cipher.decrypt_buffer(&mut buf) {
                warn!("dropping message on connection {} that can not be decrypted: {}", self.info, e);
                continue;
            }

            events.push(ConnectionEvent::MessageReceived {
                message: buf.to_vec(),
                delivery_type: descriptor.delivery_type,
                channel: descriptor.channel,
            });
        }
        Ok(())
    }

    async fn on_delivery_ack(&self, ack: Datagram) -> anyhow::Result<()> {
        let status = self.status().await;
        if !matches!(status, ConnectionStatus::Connected | ConnectionStatus::Disconnecting) {
            bail!("ack in status {:?}", status);
        }

        let channel = self.channels.read().await
            .get(&ack.descriptor())
            .cloned();
        match channel {
            Some(channel) => channel.on_ack_received(&ack).await,
            None => bail!("ack for channel {:?} that was never used", ack.descriptor()),
        }
    }

    async fn on_control_datagram(&self, datagram: Datagram, events: &mut Vec<ConnectionEvent>) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;

        match (datagram.message_type(), state.status) {
            (MessageType::ConnectReq, ConnectionStatus::Waiting) => {
                self.on_connect_request(&mut state, &datagram, events).await;
            }
            (MessageType::ConnectReq, ConnectionStatus::Connected) => {
                debug!("duplicate ConnectReq on {} - re-sending ConnectResp", self.info);
                self.send_control_logged(MessageType::ConnectResp, SequenceNumber::ZERO, &self.handshake_payload()).await;
            }
            (MessageType::ConnectResp, ConnectionStatus::Connecting) => {
                if let Some(key_agreement) = &self.key_agreement {
                    match key_agreement.session_cipher(datagram.payload()) {
                        Ok(cipher) => state.cipher = Arc::new(cipher),
                        Err(e) => {
                            warn!("key agreement with {} failed: {}", self.info, e);
                            self.send_control_logged(MessageType::DisconnectReq, SequenceNumber::ZERO, &[]).await;
                            state.finish(CloseReason::Error, None, events);
                            return Ok(());
                        }
                    }
                }
                info!("connection {} established", self.info);
                state.on_connected(events);
            }
            (MessageType::DisconnectReq, ConnectionStatus::Connecting | ConnectionStatus::Connected) => {
                self.send_control_logged(MessageType::DisconnectResp, SequenceNumber::ZERO, &[]).await;
                let payload = Some(datagram.payload().to_vec())
                    .filter(|p| !p.is_empty());
                state.finish(CloseReason::ClosedByOtherPeer, payload, events);
            }
            (MessageType::DisconnectReq, ConnectionStatus::Disconnecting) => {
                // both sides closed at the same time
                self.send_control_logged(MessageType::DisconnectResp, SequenceNumber::ZERO, &[]).await;
                state.finish(CloseReason::ClosedByThisPeer, None, events);
            }
            (MessageType::DisconnectResp, ConnectionStatus::Disconnecting) => {
                state.finish(CloseReason::ClosedByThisPeer, None, events);
            }
            (MessageType::DisconnectResp, ConnectionStatus::Connecting) => {
                info!("connection request to {} was rejected", self.info);
                state.finish(CloseReason::ClosedByOtherPeer, None, events);
            }
            (MessageType::Ping, ConnectionStatus::Connected | ConnectionStatus::Disconnecting) => {
                self.send_control_logged(MessageType::Pong, datagram.sequence(), &[]).await;
            }
            (MessageType::Pong, _) => {
                if let Some(rtt) = state.ping.on_pong(datagram.sequence(), Instant::now()) {
                    self.latency.record_sample(rtt);
                }
            }
            (MessageType::ExpandMtuRequest, ConnectionStatus::Connected) => {
                let proposed = mtu_discovery::parse_probe(datagram.payload(), datagram.len())?;
                let (accepted, fix) = state.mtu.on_request(proposed);
                self.send_control_logged(MessageType::ExpandMtuSuccess, SequenceNumber::ZERO, &mtu_discovery::success_payload(accepted, fix)).await;
            }
            (MessageType::ExpandMtuSuccess, ConnectionStatus::Connected) => {
                let (size, fix) = mtu_discovery::parse_success(datagram.payload())?;
                state.mtu.on_success(size, fix);
            }
            (message_type, status) => {
                trace!("ignoring {:?} in status {:?}", message_type, status);
            }
        }
        Ok(())
    }

    async fn on_connect_request(&self, state: &mut ConnectionState, request: &Datagram, events: &mut Vec<ConnectionEvent>) {
        if !self.handler.accept_connection(self.info.peer_addr) {
            info!("rejecting connection request from {}", self.info);
            self.send_control_logged(MessageType::DisconnectResp, SequenceNumber::ZERO, &[]).await;
            state.finish(CloseReason::ClosedByThisPeer, None, events);
            return;
        }

        if let Some(key_agreement) = &self.key_agreement {
            match key_agreement.session_cipher(request.payload()) {
                Ok(cipher) => state.cipher = Arc::new(cipher),
                Err(e) => {
                    warn!("rejecting connection request from {}: key agreement failed: {}", self.info, e);
                    self.send_control_logged(MessageType::DisconnectResp, SequenceNumber::ZERO, &[]).await;
                    state.finish(CloseReason::Error, None, events);
                    return;
                }
            }
        }

        info!("accepted connection from {}", self.info);
        state.on_connected(events);
        self.send_control_logged(MessageType::ConnectResp, SequenceNumber::ZERO, &self.handshake_payload()).await;
    }

    /// Periodic housekeeping: handshake resends, timeout, keep-alive, MTU discovery and
    ///  channel retransmissions
    pub async fn poll_events(&self) -> anyhow::Result<()> {
        let mut events = Vec::new();
        let status = {
            let mut state = self.state.lock().await;
            if self.link.take_fatal_error() {
                warn!("closing connection {} after a fatal send error", self.info);
                state.finish(CloseReason::Error, None, &mut events);
            }
            else {
                self.poll_state(&mut state, &mut events).await?;
            }
            state.status
        };
        self.events.dispatch(events).await;

        if matches!(status, ConnectionStatus::Connected | ConnectionStatus::Disconnecting) {
            let channels: Vec<Arc<dyn Channel>> = self.channels.read().await
                .values()
                .cloned()
                .collect();
            for channel in channels {
                if let Err(e) = channel.poll_events().await {
                    debug!("error polling channel {:?} of connection {}: {}", channel.descriptor(), self.info, e);
                }
            }
        }
        Ok(())
    }

    async fn poll_state(&self, state: &mut ConnectionState, events: &mut Vec<ConnectionEvent>) -> anyhow::Result<()> {
        let now = Instant::now();
        let resend_delay = self.link.resend_delay();

        if state.status.is_open() && now.duration_since(state.last_received) >= self.config.connection_timeout {
            info!("connection {} timed out", self.info);
            state.finish(CloseReason::Timeout, None, events);
            return Ok(());
        }

        match state.status {
            ConnectionStatus::Connecting => {
                if now.duration_since(state.handshake_sent_at) >= resend_delay {
                    debug!("re-sending ConnectReq to {}", self.info);
                    state.handshake_sent_at = now;
                    self.send_control_logged(MessageType::ConnectReq, SequenceNumber::ZERO, &self.handshake_payload()).await;
                }
            }
            ConnectionStatus::Disconnecting => {
                if now.duration_since(state.handshake_sent_at) >= resend_delay {
                    debug!("re-sending DisconnectReq to {}", self.info);
                    state.handshake_sent_at = now;
                    let payload = state.close_payload.clone().unwrap_or_default();
                    self.send_control_logged(MessageType::DisconnectReq, SequenceNumber::ZERO, &payload).await;
                }
            }
            ConnectionStatus::Connected => {
                if let Some(ping_id) = state.ping.ping_due(now, self.config.ping_interval) {
                    self.send_control_logged(MessageType::Ping, ping_id, &[]).await;
                }

                if let Some(size) = state.mtu.poll(now, resend_delay) {
                    debug!("probing MTU of {} bytes on connection {}", size, self.info);
                    let probe = Datagram::new(
                        &self.buffer_pool,
                        DatagramHeader::control(MessageType::ExpandMtuRequest, self.connection_key, SequenceNumber::ZERO),
                        &mtu_discovery::probe_payload(size),
                    )?;
                    if let Err(e) = self.link.transmit(&probe).await {
                        debug!("sending MTU probe failed: {}", e);
                        state.mtu.on_probe_failed(size);
                    }
                }
            }
            ConnectionStatus::Waiting | ConnectionStatus::Disconnected => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
