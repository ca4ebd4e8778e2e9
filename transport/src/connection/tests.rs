use std::collections::HashSet;
use std::io;
use rstest::rstest;
use tokio::runtime::Builder;
use crate::datagram::FragmentInfo;
use crate::test_util::{client_addr, server_addr, test_config, ConnectionPair, Direction};
use super::*;

fn run(f: impl std::future::Future<Output = ()>) {
    let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
    rt.block_on(f);
}

fn status_changed(old_status: ConnectionStatus, new_status: ConnectionStatus) -> ConnectionEvent {
    ConnectionEvent::StatusChanged { old_status, new_status }
}

#[test]
fn test_handshake() {
    run(async {
        let pair = ConnectionPair::default_pair();
        let pending = pair.client.start_connect().await.unwrap();
        assert_eq!(pair.client.status().await, ConnectionStatus::Connecting);
        assert_eq!(pair.message_types(&pair.client_socket.take()), vec![MessageType::ConnectReq]);

        // re-deliver the ConnectReq that was just taken
        pair.server.on_datagram(pair.datagram(DatagramHeader::control(MessageType::ConnectReq, 4711, SequenceNumber::ZERO), &[])).await;
        pair.pump().await;
        pending.wait().await.unwrap();

        assert_eq!(pair.client.status().await, ConnectionStatus::Connected);
        assert_eq!(pair.server.status().await, ConnectionStatus::Connected);
        assert_eq!(pair.client_handler.events(), vec![
            status_changed(ConnectionStatus::Waiting, ConnectionStatus::Connecting),
            status_changed(ConnectionStatus::Connecting, ConnectionStatus::Connected),
            ConnectionEvent::Opened,
        ]);
        assert_eq!(pair.server_handler.events(), vec![
            status_changed(ConnectionStatus::Waiting, ConnectionStatus::Connected),
            ConnectionEvent::Opened,
        ]);
    });
}

#[test]
fn test_handshake_survives_lost_connect_request() {
    run(async {
        let pair = ConnectionPair::default_pair();
        let pending = pair.client.start_connect().await.unwrap();

        let mut num_connect_requests = 0;
        pair.pump_with(|direction, datagram| {
            if direction == Direction::ToServer && datagram.message_type() == MessageType::ConnectReq {
                num_connect_requests += 1;
                return false;
            }
            true
        }, false).await;
        assert_eq!(num_connect_requests, 1);
        assert_eq!(pair.server.status().await, ConnectionStatus::Waiting);

        // not yet due for resending
        pair.tick(Duration::from_millis(200)).await;
        assert_eq!(pair.client.status().await, ConnectionStatus::Connecting);

        pair.tick(Duration::from_millis(100)).await;
        pending.wait().await.unwrap();
        assert_eq!(pair.client.status().await, ConnectionStatus::Connected);
        assert_eq!(pair.server.status().await, ConnectionStatus::Connected);
    });
}

#[test]
fn test_connect_twice_fails() {
    run(async {
        let pair = ConnectionPair::connected_pair().await;
        assert!(pair.client.start_connect().await.is_err());
    });
}

#[test]
fn test_rejected_connection() {
    run(async {
        let pair = ConnectionPair::with_server_policy(test_config(client_addr()), test_config(server_addr()), false);
        let pending = pair.client.start_connect().await.unwrap();
        pair.pump().await;

        assert!(pending.wait().await.is_err());
        assert_eq!(pair.client.status().await, ConnectionStatus::Disconnected);
        assert_eq!(pair.client.close_reason().await, Some(CloseReason::ClosedByOtherPeer));
        assert_eq!(pair.client_handler.closed(), Some((CloseReason::ClosedByOtherPeer, None)));
        assert!(!pair.server_handler.events().contains(&ConnectionEvent::Opened));

        // a late ConnectReq is answered with another DisconnectResp
        pair.server.on_datagram(pair.datagram(DatagramHeader::control(MessageType::ConnectReq, 4711, SequenceNumber::ZERO), &[])).await;
        assert_eq!(pair.message_types(&pair.server_socket.take()), vec![MessageType::DisconnectResp]);
    });
}

#[test]
fn test_duplicate_connect_request_is_answered() {
    run(async {
        let pair = ConnectionPair::connected_pair().await;
        pair.server.on_datagram(pair.datagram(DatagramHeader::control(MessageType::ConnectReq, 4711, SequenceNumber::ZERO), &[])).await;
        assert_eq!(pair.message_types(&pair.server_socket.take()), vec![MessageType::ConnectResp]);
        assert_eq!(pair.server.status().await, ConnectionStatus::Connected);
    });
}

#[test]
fn test_datagram_with_wrong_key_is_ignored() {
    run(async {
        let pair = ConnectionPair::default_pair();
        pair.server.on_datagram(pair.datagram(DatagramHeader::control(MessageType::ConnectReq, 1234, SequenceNumber::ZERO), &[])).await;
        assert_eq!(pair.server.status().await, ConnectionStatus::Waiting);
        assert!(pair.server_socket.take().is_empty());
    });
}

#[rstest]
#[case::ordered(DeliveryType::ReliableOrdered)]
#[case::unordered(DeliveryType::ReliableUnordered)]
fn test_reliable_delivery_with_loss_and_reordering(#[case] delivery_type: DeliveryType) {
    run(async {
        let pair = ConnectionPair::connected_pair().await;

        let messages: Vec<Vec<u8>> = (0..20)
            .map(|i| format!("message {}", i).into_bytes())
            .collect();
        for message in &messages {
            assert_eq!(pair.client.send(message, delivery_type, 3).await.unwrap(), SendOutcome::Sent);
        }

        let mut dropped = HashSet::new();
        pair.pump_with(|direction, datagram| {
            let sequence = datagram.sequence().to_raw();
            !(direction == Direction::ToServer
                && datagram.message_type() == MessageType::UserData
                && sequence % 3 == 0
                && dropped.insert(sequence))
        }, true).await;
        assert_eq!(dropped.len(), 7);

        for _ in 0..5 {
            pair.tick(Duration::from_millis(300)).await;
        }

        let mut received = pair.server_handler.messages();
        assert_eq!(received.len(), messages.len());
        if delivery_type == DeliveryType::ReliableUnordered {
            received.sort();
            let mut expected = messages.clone();
            expected.sort();
            assert_eq!(received, expected);
        }
        else {
            assert_eq!(received, messages);
        }
    });
}

#[rstest]
#[case::ordered_in_sequence(DeliveryType::ReliableOrdered, false)]
#[case::ordered_reversed(DeliveryType::ReliableOrdered, true)]
#[case::unordered_reversed(DeliveryType::ReliableUnordered, true)]
fn test_fragmented_message(#[case] delivery_type: DeliveryType, #[case] reverse: bool) {
    run(async {
        let pair = ConnectionPair::connected_pair().await;

        let message: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        pair.client.send(&message, delivery_type, 0).await.unwrap();

        let mut num_frames = 0;
        pair.pump_with(|direction, datagram| {
            if direction == Direction::ToServer && datagram.fragment().is_some() {
                num_frames += 1;
            }
            true
        }, reverse).await;
        assert_eq!(num_frames, 11);

        assert_eq!(pair.server_handler.messages(), vec![message]);
    });
}

#[rstest]
#[case::unreliable(DeliveryType::Unreliable, u16::MAX)]
#[case::unreliable_sequenced(DeliveryType::UnreliableSequenced, 3)]
#[case::too_many_frames(DeliveryType::ReliableUnordered, u16::MAX)]
fn test_unexpected_fragments_are_not_buffered(#[case] delivery_type: DeliveryType, #[case] frames: u16) {
    run(async {
        let pair = ConnectionPair::connected_pair().await;
        let descriptor = ChannelDescriptor::new(0, delivery_type).unwrap();

        for group_id in 0..200 {
            let fragment = FragmentInfo { group_id, frame: 1, frames };
            pair.server.on_datagram(pair.datagram(DatagramHeader::user_data(descriptor, 4711, Some(fragment)), b"x")).await;
        }
        for _ in 0..20 {
            pair.tick(Duration::from_secs(1)).await;
        }

        assert_eq!(pair.server.fragments.lock().await.num_incomplete(), 0);
        assert!(pair.server_handler.messages().is_empty());
        assert_eq!(pair.server.status().await, ConnectionStatus::Connected);
    });
}

#[rstest]
#[case::fail(OversizePolicy::Fail)]
#[case::drop(OversizePolicy::Drop)]
fn test_oversized_unreliable_message(#[case] policy: OversizePolicy) {
    run(async {
        let mut client_config = test_config(client_addr());
        client_config.oversized_unreliable_policy = policy;
        let pair = ConnectionPair::new(client_config, test_config(server_addr()));
        pair.establish().await;

        let result = pair.client.send(&[1u8; 600], DeliveryType::Unreliable, 0).await;
        match policy {
            OversizePolicy::Fail => assert!(result.is_err()),
            OversizePolicy::Drop => assert_eq!(result.unwrap(), SendOutcome::Dropped),
        }
        assert!(pair.client_socket.take().is_empty());
    });
}

#[test]
fn test_unreliable_message() {
    run(async {
        let pair = ConnectionPair::connected_pair().await;
        pair.client.send(b"fire and forget", DeliveryType::UnreliableSequenced, 5).await.unwrap();
        pair.pump().await;

        assert_eq!(pair.server_handler.events().last(), Some(&ConnectionEvent::MessageReceived {
            message: b"fire and forget".to_vec(),
            delivery_type: DeliveryType::UnreliableSequenced,
            channel: 5,
        }));
    });
}

#[test]
fn test_send_preconditions() {
    run(async {
        let pair = ConnectionPair::default_pair();
        assert!(pair.client.send(b"too early", DeliveryType::ReliableOrdered, 0).await.is_err());

        pair.establish().await;
        assert!(pair.client.send(b"invalid channel", DeliveryType::ReliableOrdered, 8).await.is_err());
        assert!(pair.client.send(b"valid channel", DeliveryType::ReliableOrdered, 7).await.is_ok());
        assert!(pair.client.send(&vec![0u8; 1024*1024 + 1], DeliveryType::ReliableOrdered, 0).await.is_err());
    });
}

#[test]
fn test_ping_measures_latency() {
    run(async {
        let pair = ConnectionPair::connected_pair().await;
        assert_eq!(pair.client.average_latency(), None);

        pair.client.poll_events().await.unwrap();
        assert!(pair.message_types(&pair.client_socket.take()).contains(&MessageType::Ping));

        // deliver the ping again, with a delay
        tokio::time::advance(Duration::from_millis(20)).await;
        pair.server.on_datagram(pair.datagram(DatagramHeader::control(MessageType::Ping, 4711, SequenceNumber::ZERO), &[])).await;
        pair.pump().await;

        assert_eq!(pair.client.average_latency(), Some(Duration::from_millis(20)));
        assert_eq!(pair.client.last_latency(), Some(Duration::from_millis(20)));
    });
}

#[test]
fn test_mtu_discovery_converges_on_smaller_limit() {
    run(async {
        let mut server_config = test_config(server_addr());
        server_config.limit_mtu = 1200;
        let pair = ConnectionPair::new(test_config(client_addr()), server_config);
        pair.establish().await;
        assert_eq!(pair.client.mtu().await, 508);

        for _ in 0..10 {
            pair.tick(Duration::from_secs(1)).await;
        }
        assert_eq!(pair.client.mtu().await, 1200);
        assert_eq!(pair.server.mtu().await, 1200);

        // a message that needed fragmentation before now fits into a single datagram
        assert_eq!(pair.client.send(&[7u8; 1100], DeliveryType::Unreliable, 0).await.unwrap(), SendOutcome::Sent);
        assert_eq!(pair.client_socket.take().len(), 1);
    });
}

#[test]
fn test_timeout() {
    run(async {
        let pair = ConnectionPair::connected_pair().await;

        tokio::time::advance(Duration::from_millis(4999)).await;
        pair.client.poll_events().await.unwrap();
        assert_eq!(pair.client.status().await, ConnectionStatus::Connected);

        tokio::time::advance(Duration::from_millis(1)).await;
        pair.client.poll_events().await.unwrap();
        assert_eq!(pair.client.status().await, ConnectionStatus::Disconnected);
        assert_eq!(pair.client_handler.closed(), Some((CloseReason::Timeout, None)));
    });
}

#[test]
fn test_keep_alive_prevents_timeout() {
    run(async {
        let pair = ConnectionPair::connected_pair().await;
        for _ in 0..20 {
            pair.tick(Duration::from_millis(500)).await;
        }
        assert_eq!(pair.client.status().await, ConnectionStatus::Connected);
        assert_eq!(pair.server.status().await, ConnectionStatus::Connected);
    });
}

#[test]
fn test_close_with_payload() {
    run(async {
        let pair = ConnectionPair::connected_pair().await;
        let pending = pair.client.start_close(Some(b"bye")).await.unwrap();
        assert_eq!(pair.client.status().await, ConnectionStatus::Disconnecting);
        assert!(pair.client.send(b"too late", DeliveryType::ReliableOrdered, 0).await.is_err());

        pair.pump().await;
        pending.wait().await.unwrap();

        assert_eq!(pair.client.close_reason().await, Some(CloseReason::ClosedByThisPeer));
        assert_eq!(pair.server.close_reason().await, Some(CloseReason::ClosedByOtherPeer));
        assert_eq!(pair.client_handler.closed(), Some((CloseReason::ClosedByThisPeer, None)));
        assert_eq!(pair.server_handler.closed(), Some((CloseReason::ClosedByOtherPeer, Some(b"bye".to_vec()))));
        assert!(pair.client.disconnected_at().await.is_some());
    });
}

#[test]
fn test_close_survives_lost_disconnect_response() {
    run(async {
        let pair = ConnectionPair::connected_pair().await;
        let pending = pair.client.start_close(None).await.unwrap();

        pair.pump_with(|direction, datagram| {
            !(direction == Direction::ToClient && datagram.message_type() == MessageType::DisconnectResp)
        }, false).await;
        assert_eq!(pair.client.status().await, ConnectionStatus::Disconnecting);
        assert_eq!(pair.server.status().await, ConnectionStatus::Disconnected);

        // the server re-sends DisconnectResp for the re-sent DisconnectReq
        pair.tick(Duration::from_millis(300)).await;
        pending.wait().await.unwrap();
        assert_eq!(pair.client.close_reason().await, Some(CloseReason::ClosedByThisPeer));
    });
}

#[test]
fn test_close_before_connect() {
    run(async {
        let pair = ConnectionPair::default_pair();
        pair.client.close(None).await.unwrap();
        assert_eq!(pair.client.status().await, ConnectionStatus::Disconnected);
        assert!(pair.client_socket.take().is_empty());
    });
}

#[test]
fn test_encrypted_connection() {
    run(async {
        let mut client_config = test_config(client_addr());
        client_config.encryption = true;
        let mut server_config = test_config(server_addr());
        server_config.encryption = true;
        let pair = ConnectionPair::new(client_config, server_config);
        pair.establish().await;

        pair.client.send(b"secret message", DeliveryType::ReliableOrdered, 0).await.unwrap();
        let sent = pair.client_socket.take();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].1.windows(6).any(|w| w == b"secret"));

        for (_, bytes) in sent {
            pair.server.on_datagram(pair.decode(&bytes)).await;
        }
        assert_eq!(pair.server_handler.messages(), vec![b"secret message".to_vec()]);
    });
}

#[test]
fn test_fatal_send_error_closes_connection() {
    run(async {
        let pair = ConnectionPair::connected_pair().await;
        pair.client_socket.fail_with(Some(io::ErrorKind::ConnectionRefused));

        assert!(pair.client.send(b"unreachable", DeliveryType::Unreliable, 0).await.is_err());
        pair.client.poll_events().await.unwrap();

        assert_eq!(pair.client.status().await, ConnectionStatus::Disconnected);
        assert_eq!(pair.client_handler.closed(), Some((CloseReason::Error, None)));
    });
}

#[test]
fn test_benign_send_error_is_ignored() {
    run(async {
        let pair = ConnectionPair::connected_pair().await;
        pair.client_socket.fail_with(Some(io::ErrorKind::WouldBlock));

        assert!(pair.client.send(b"lost", DeliveryType::Unreliable, 0).await.is_ok());
        pair.client.poll_events().await.unwrap();
        assert_eq!(pair.client.status().await, ConnectionStatus::Connected);
    });
}

#[test]
fn test_queued_event_dispatch() {
    run(async {
        let mut server_config = test_config(server_addr());
        server_config.event_dispatch = crate::config::EventDispatch::Queued;
        let pair = ConnectionPair::new(test_config(client_addr()), server_config);
        pair.establish().await;

        pair.client.send(b"queued", DeliveryType::ReliableOrdered, 1).await.unwrap();
        pair.pump().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(pair.server_handler.events(), vec![
            status_changed(ConnectionStatus::Waiting, ConnectionStatus::Connected),
            ConnectionEvent::Opened,
            ConnectionEvent::MessageReceived { message: b"queued".to_vec(), delivery_type: DeliveryType::ReliableOrdered, channel: 1 },
        ]);
    });
}
