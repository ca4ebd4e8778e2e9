use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, Instrument};
use crate::config::EventDispatch;
use crate::connection::status::{CloseReason, ConnectionInfo, ConnectionStatus};
use crate::datagram::DeliveryType;

/// The application's side of a peer: it decides on incoming connections and receives messages
///  and lifecycle notifications
///
/// NB: With [EventDispatch::Inline], callbacks run inside the peer's receive loop and must not
///  await operations that depend on the peer making progress, like `UdpConnection::close()` or
///  `connect()`. Doing so blocks the peer for good. Handlers that need this must be used with
///  [EventDispatch::Queued].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Policy for incoming connection requests
    fn accept_connection(&self, peer_addr: SocketAddr) -> bool;

    async fn on_connection_opened(&self, connection: ConnectionInfo);

    async fn on_message_received(&self, connection: ConnectionInfo, message: &[u8], delivery_type: DeliveryType, channel: u8);

    async fn on_status_changed(&self, connection: ConnectionInfo, old_status: ConnectionStatus, new_status: ConnectionStatus);

    async fn on_connection_closed(&self, connection: ConnectionInfo, reason: CloseReason, payload: Option<Vec<u8>>);
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Opened,
    MessageReceived {
        message: Vec<u8>,
        delivery_type: DeliveryType,
        channel: u8,
    },
    StatusChanged {
        old_status: ConnectionStatus,
        new_status: ConnectionStatus,
    },
    Closed {
        reason: CloseReason,
        payload: Option<Vec<u8>>,
    },
}

async fn deliver(handler: &dyn ConnectionHandler, connection: ConnectionInfo, event: ConnectionEvent) {
    trace!("dispatching {:?} for connection {}", event, connection);
    match event {
        ConnectionEvent::Opened =>
            handler.on_connection_opened(connection).await,
        ConnectionEvent::MessageReceived { message, delivery_type, channel } =>
            handler.on_message_received(connection, &message, delivery_type, channel).await,
        ConnectionEvent::StatusChanged { old_status, new_status } =>
            handler.on_status_changed(connection, old_status, new_status).await,
        ConnectionEvent::Closed { reason, payload } =>
            handler.on_connection_closed(connection, reason, payload).await,
    }
}

/// Delivers a connection's events to the application. Callbacks for one connection never run
///  concurrently, regardless of the dispatch mode.
pub enum EventDispatcher {
    Inline {
        connection: ConnectionInfo,
        handler: Arc<dyn ConnectionHandler>,
        serializer: Mutex<()>,
    },
    Queued {
        sender: mpsc::UnboundedSender<(ConnectionInfo, ConnectionEvent)>,
        connection: ConnectionInfo,
    },
}

impl EventDispatcher {
    /// NB: In `Queued` mode, this spawns the dispatch task, so it must be called in the context
    ///  of a Tokio runtime. The task terminates when the dispatcher is dropped.
    pub fn new(mode: EventDispatch, connection: ConnectionInfo, handler: Arc<dyn ConnectionHandler>) -> EventDispatcher {
        match mode {
            EventDispatch::Inline => EventDispatcher::Inline {
                connection,
                handler,
                serializer: Mutex::new(()),
            },
            EventDispatch::Queued => {
                let (sender, mut receiver) = mpsc::unbounded_channel::<(ConnectionInfo, ConnectionEvent)>();
                tokio::spawn(async move {
                    while let Some((connection, event)) = receiver.recv().await {
                        deliver(handler.as_ref(), connection, event).await;
                    }
                    debug!("event dispatch task for connection {} terminated", connection);
                }.in_current_span());

                EventDispatcher::Queued {
                    sender,
                    connection,
                }
            }
        }
    }

    pub async fn dispatch(&self, events: Vec<ConnectionEvent>) {
        if events.is_empty() {
            return;
        }

        match self {
            EventDispatcher::Inline { connection, handler, serializer } => {
                let _serialized = serializer.lock().await;
                for event in events {
                    deliver(handler.as_ref(), *connection, event).await;
                }
            }
            EventDispatcher::Queued { sender, connection } => {
                for event in events {
                    if sender.send((*connection, event)).is_err() {
                        debug!("event dispatch task for connection {} is gone, discarding event", connection);
                    }
                }
            }
        }
    }
}
