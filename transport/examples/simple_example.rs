use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{info, span, Instrument, Level};
use udp_transport::config::UdpConfig;
use udp_transport::connection::status::{CloseReason, ConnectionInfo, ConnectionStatus};
use udp_transport::datagram::DeliveryType;
use udp_transport::event_dispatcher::ConnectionHandler;
use udp_transport::peer::UdpPeer;

fn init_logging() {
    tracing_subscriber::fmt()
        // .with_max_level(Level::TRACE)
        .with_max_level(Level::DEBUG)
        .with_thread_ids(true)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let addr_a = SocketAddr::from_str("127.0.0.1:9100")?;
    let addr_b = SocketAddr::from_str("127.0.0.1:9101")?;

    let mut config_a = UdpConfig::default_for(addr_a);
    config_a.encryption = true;
    let mut config_b = UdpConfig::default_for(addr_b);
    config_b.encryption = true;

    let a = UdpPeer::new(config_a, Arc::new(LoggingHandler)).await?;
    let b = UdpPeer::new(config_b, Arc::new(LoggingHandler)).await?;

    let cloned_a = a.clone();
    let cloned_b = b.clone();
    tokio::spawn(async move {
        let span = span!(Level::TRACE, "node a");
        cloned_a.run().instrument(span).await
    });
    tokio::spawn(async move {
        let span = span!(Level::TRACE, "node b");
        cloned_b.run().instrument(span).await
    });

    let connection = a.connect(addr_b).await?;

    a.send_to(addr_b, &[1, 2, 3], DeliveryType::ReliableOrdered, 4).await?;
    a.send_to(addr_b, &[2, 3, 4, 5], DeliveryType::ReliableOrdered, 4).await?;
    a.send_to(addr_b, &[7], DeliveryType::Unreliable, 0).await?;
    a.send_to(addr_b, &vec![9; 3000], DeliveryType::ReliableUnordered, 1).await?;

    sleep(Duration::from_secs(2)).await;
    info!("latency: {:?}, MTU: {}", connection.average_latency(), connection.mtu().await);

    connection.close(Some(b"bye")).await?;

    a.shutdown();
    b.shutdown();
    sleep(Duration::from_millis(100)).await;
    Ok(())
}

struct LoggingHandler;

#[async_trait]
impl ConnectionHandler for LoggingHandler {
    fn accept_connection(&self, peer_addr: SocketAddr) -> bool {
        info!("accepting connection from {:?}", peer_addr);
        true
    }

    async fn on_connection_opened(&self, connection: ConnectionInfo) {
        info!("connection {} opened", connection);
    }

    async fn on_message_received(&self, connection: ConnectionInfo, message: &[u8], delivery_type: DeliveryType, channel: u8) {
        info!("received {} bytes on {}, {:?} channel {}", message.len(), connection, delivery_type, channel);
    }

    async fn on_status_changed(&self, connection: ConnectionInfo, old_status: ConnectionStatus, new_status: ConnectionStatus) {
        info!("connection {}: {:?} -> {:?}", connection, old_status, new_status);
    }

    async fn on_connection_closed(&self, connection: ConnectionInfo, reason: CloseReason, payload: Option<Vec<u8>>) {
        info!("connection {} closed: {:?} {:?}", connection, reason, payload);
    }
}
