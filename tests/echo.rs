//! End-to-end exchanges between a server and clients over loopback.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::*;
use kcp_transport::prelude::*;
use rstest::rstest;

#[tokio::test]
async fn test_ping_echo_over_stream_handshake() {
    let mut server = started_server(4).await;
    let control = server.control_addr().unwrap();

    let mut client = KcpClient::new(client_config(HandshakeMode::Stream));
    client.start(control).await.unwrap();
    let id = wait_connected(&mut client, &mut server).await;

    let connect = wait_for(|| server.receive(), || client.poll(), EventKind::Connect).await;
    assert_eq!(connect.connection_id(), Some(id));

    client.send(b"PING").unwrap();
    let ping = wait_for(|| server.receive(), || client.poll(), EventKind::Data).await;
    assert_eq!(ping.connection_id(), Some(id));
    assert_eq!(ping.payload().unwrap().as_ref(), b"PING");

    server.send(id, b"ping").unwrap();
    let pong = wait_for(|| client.receive(), || server.poll(), EventKind::Data).await;
    assert_eq!(pong.payload().unwrap().as_ref(), b"ping");

    client.stop().await;
    server.stop().await;
}

#[rstest]
#[case::empty(0)]
#[case::single_byte(1)]
#[case::mtu_minus_one(EngineSettings::default().mtu - 1)]
#[tokio::test]
async fn test_payload_sizes_survive_round_trip(#[case] size: usize) {
    let mut server = started_server(4).await;
    let mut client = KcpClient::new(client_config(HandshakeMode::Stream));
    client.start(server.control_addr().unwrap()).await.unwrap();
    let id = wait_connected(&mut client, &mut server).await;

    let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    client.send(&payload).unwrap();
    let echoed = wait_for(|| server.receive(), || client.poll(), EventKind::Data).await;
    assert_eq!(echoed.payload().unwrap().as_ref(), payload.as_slice());

    server.send(id, &payload).unwrap();
    let back = wait_for(|| client.receive(), || server.poll(), EventKind::Data).await;
    assert_eq!(back.into_payload(), Some(Bytes::from(payload)));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_messages_arrive_in_order() {
    let mut server = started_server(4).await;
    let mut client = KcpClient::new(client_config(HandshakeMode::Stream));
    client.start(server.control_addr().unwrap()).await.unwrap();
    wait_connected(&mut client, &mut server).await;

    for i in 0u32..50 {
        client.send(&i.to_le_bytes()).unwrap();
    }
    let mut received = Vec::new();
    while received.len() < 50 {
        let event = wait_for(|| server.receive(), || client.poll(), EventKind::Data).await;
        let bytes: [u8; 4] = event.payload().unwrap().as_ref().try_into().unwrap();
        received.push(u32::from_le_bytes(bytes));
    }
    assert_eq!(received, (0u32..50).collect::<Vec<_>>());

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_datagram_handshake() {
    let mut server = started_server(4).await;
    let data = server.local_addr().unwrap();

    let mut client = KcpClient::new(client_config(HandshakeMode::Datagram));
    client.start(data).await.unwrap();
    let id = wait_connected(&mut client, &mut server).await;

    let connect = wait_for(|| server.receive(), || client.poll(), EventKind::Connect).await;
    assert_eq!(connect.connection_id(), Some(id));
    assert_eq!(server.connection_count(), 1);

    client.send(b"hello").unwrap();
    let event = wait_for(|| server.receive(), || client.poll(), EventKind::Data).await;
    assert_eq!(event.payload().unwrap().as_ref(), b"hello");

    // Repeated hellos must not register further connections.
    drain_for(|| server.receive(), || client.poll(), Duration::from_millis(100)).await;
    assert_eq!(server.connection_count(), 1);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_server_speaks_first_after_stream_handshake() {
    let mut server = started_server(4).await;
    let mut client = KcpClient::new(client_config(HandshakeMode::Stream));
    client.start(server.control_addr().unwrap()).await.unwrap();
    let id = wait_connected(&mut client, &mut server).await;
    wait_for(|| server.receive(), || client.poll(), EventKind::Connect).await;

    // The client has sent no application data, so only its announce tells the server where
    // its data socket lives.
    let deadline = std::time::Instant::now() + TIMEOUT;
    while server.send(id, b"welcome").is_err() {
        assert!(std::time::Instant::now() < deadline, "server never accepted the send");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let welcome = wait_for(|| client.receive(), || server.poll(), EventKind::Data).await;
    assert_eq!(welcome.connection_id(), Some(id));
    assert_eq!(welcome.payload().unwrap().as_ref(), b"welcome");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_clients_get_distinct_ids() {
    let mut server = started_server(4).await;
    let control = server.control_addr().unwrap();

    let mut first = KcpClient::new(client_config(HandshakeMode::Stream));
    first.start(control).await.unwrap();
    let a = wait_connected(&mut first, &mut server).await;

    let mut second = KcpClient::new(client_config(HandshakeMode::Stream));
    second.start(control).await.unwrap();
    let b = wait_connected(&mut second, &mut server).await;

    assert_ne!(a, b);
    assert!(b > a);

    first.send(b"from-a").unwrap();
    second.send(b"from-b").unwrap();
    let mut seen = Vec::new();
    while seen.len() < 2 {
        let event = wait_for(
            || server.receive(),
            || {
                first.poll();
                second.poll();
            },
            EventKind::Data,
        )
        .await;
        seen.push((event.connection_id().unwrap(), event.into_payload().unwrap()));
    }
    seen.sort_by_key(|(id, _)| *id);
    assert_eq!(
        seen,
        vec![
            (a, Bytes::from_static(b"from-a")),
            (b, Bytes::from_static(b"from-b"))
        ]
    );

    first.stop().await;
    second.stop().await;
    server.stop().await;
}
