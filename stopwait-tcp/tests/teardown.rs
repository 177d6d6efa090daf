//! Integration tests for the 4-way teardown.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stopwait_tcp::{
    simulator::Fault, ConnError, Connection, ConnectionConfig, ConnectionState, Flag,
    PortRegistry, SimNetwork,
};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

type Conn = Connection<SimNetwork>;

fn fast() -> ConnectionConfig {
    ConnectionConfig::default()
        .with_timeout(Duration::from_millis(20))
        .with_max_attempts(10)
}

/// Returns `(client, accepted)`; both share `registry`.
async fn establish(
    net: &SimNetwork,
    registry: &PortRegistry,
    config: ConnectionConfig,
) -> (Conn, Conn) {
    let mut listener = Connection::new(net.clone(), registry.clone(), addr(9000), config.clone())
        .await
        .expect("bind listener");
    let mut client = Connection::new(net.clone(), registry.clone(), addr(9001), config)
        .await
        .expect("bind client");

    let server_task = tokio::spawn(async move { listener.accept().await });
    client.connect(addr(9000)).await.expect("connect");
    let server = server_task.await.expect("server task").expect("accept");
    (client, server)
}

/// Record `(flag, src)` of every datagram the network carries.
fn record_wire(net: &SimNetwork) -> Arc<Mutex<Vec<(Flag, SocketAddr)>>> {
    let wire = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&wire);
    net.set_rule(move |d| {
        sink.lock().unwrap().push((d.flag(), d.src()));
        None
    });
    wire
}

/// Client closes first: FIN_WAIT_1 → FIN_WAIT_2 → TIME_WAIT → CLOSED, while
/// the server sits in CLOSE_WAIT until its own `close`.
#[tokio::test]
async fn active_and_passive_close() {
    let net = SimNetwork::reliable();
    let registry = PortRegistry::new();
    let (mut client, mut server) = establish(&net, &registry, fast()).await;
    let (client_addr, server_addr) = (client.local_addr(), server.local_addr());
    let wire = record_wire(&net);

    let server_task = tokio::spawn(async move {
        assert!(matches!(server.receive().await, Err(ConnError::Eof)));
        assert_eq!(server.state(), ConnectionState::CloseWait);

        // Nothing moves the passive side until the application closes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.state(), ConnectionState::CloseWait);
        assert!(matches!(server.receive().await, Err(ConnError::Eof)));

        server.close().await.expect("server close");
        server
    });

    client.close().await.expect("client close");
    let server = server_task.await.unwrap();

    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(server.state(), ConnectionState::Closed);
    assert_eq!(client.remote_addr(), None);
    assert_eq!(server.remote_addr(), None);

    let wire = wire.lock().unwrap().clone();
    assert_eq!(
        wire,
        vec![
            (Flag::Fin, client_addr),
            (Flag::Ack, server_addr),
            (Flag::Fin, server_addr),
            (Flag::Ack, client_addr),
        ]
    );
}

#[tokio::test]
async fn ports_are_released_after_close() {
    let net = SimNetwork::reliable();
    let registry = PortRegistry::new();
    let (mut client, mut server) = establish(&net, &registry, fast()).await;
    let (client_port, server_port) = (client.local_addr().port(), server.local_addr().port());

    let server_task = tokio::spawn(async move {
        let _ = server.receive().await;
        server.close().await.map(|()| server)
    });
    client.close().await.unwrap();
    let server = server_task.await.unwrap().unwrap();

    assert!(!registry.is_bound(client_port));
    assert!(!registry.is_bound(server_port));
    // Both handles are still alive; release happened at CLOSED, not at drop.
    assert_eq!(server.state(), ConnectionState::Closed);
    assert!(registry.bind(client_port).is_ok());
}

#[tokio::test]
async fn finished_connection_rejects_everything() {
    let net = SimNetwork::reliable();
    let registry = PortRegistry::new();
    let (mut client, mut server) = establish(&net, &registry, fast()).await;

    let server_task = tokio::spawn(async move {
        let _ = server.receive().await;
        server.close().await
    });
    client.close().await.unwrap();
    server_task.await.unwrap().unwrap();

    assert!(matches!(client.connect(addr(9000)).await, Err(ConnError::Finished)));
    assert!(matches!(client.send(b"late").await, Err(ConnError::Finished)));
    assert!(matches!(client.receive().await, Err(ConnError::Finished)));
    assert!(matches!(client.close().await, Err(ConnError::Finished)));
    assert_eq!(client.state(), ConnectionState::Closed);
}

/// The active closer's final ACK is lost; TIME_WAIT re-ACKs the peer's
/// retransmitted FIN so the passive side still closes cleanly.
#[tokio::test]
async fn time_wait_answers_retransmitted_fin() {
    let net = SimNetwork::reliable();
    let registry = PortRegistry::new();
    let config = fast().with_time_wait(Duration::from_millis(300));
    let (mut client, mut server) = establish(&net, &registry, config).await;
    let client_addr = client.local_addr();

    // Drop the client's first ACK of the server's FIN.
    let mut fins_seen = 0;
    let mut dropped = false;
    net.set_rule(move |d| {
        if d.flag() == Flag::Fin {
            fins_seen += 1;
        }
        if d.flag() == Flag::Ack && d.src() == client_addr && fins_seen >= 2 && !dropped {
            dropped = true;
            return Some(Fault::Drop);
        }
        None
    });

    let server_task = tokio::spawn(async move {
        let _ = server.receive().await;
        server.close().await
    });
    client.close().await.unwrap();
    server_task.await.unwrap().expect("passive close should still succeed");
    assert_eq!(net.stats().dropped, 1);
}

/// A passive closer whose FIN is never acknowledged gives up after the retry
/// bound and is forced to CLOSED with its port released.
#[tokio::test]
async fn unanswered_last_ack_forces_closed() {
    let net = SimNetwork::reliable();
    let registry = PortRegistry::new();
    let config = fast()
        .with_max_attempts(3)
        .with_fin_wait_timeout(Duration::from_millis(50));
    let (mut client, mut server) = establish(&net, &registry, config).await;
    let server_port = server.local_addr().port();

    // The client closes and vanishes after FIN_WAIT_2 expires.
    let client_task = tokio::spawn(async move {
        let result = client.close().await;
        drop(client);
        result
    });

    assert!(matches!(server.receive().await, Err(ConnError::Eof)));
    // Let the client give up on our FIN and go away.
    let client_result = client_task.await.unwrap();
    assert!(matches!(
        client_result,
        Err(ConnError::Timeout { waiting_for: Flag::Fin, .. })
    ));

    let err = server.close().await.unwrap_err();
    assert!(matches!(err, ConnError::Timeout { waiting_for: Flag::Ack, attempts: 3 }));
    assert_eq!(server.state(), ConnectionState::Closed);
    assert!(!registry.is_bound(server_port));
}

/// An active closer whose peer never answers the FIN is forced to CLOSED.
#[tokio::test]
async fn unanswered_fin_forces_closed() {
    let net = SimNetwork::reliable();
    let registry = PortRegistry::new();
    let (mut client, server) = establish(&net, &registry, fast().with_max_attempts(3)).await;
    let client_port = client.local_addr().port();
    drop(server);

    let err = client.close().await.unwrap_err();
    assert!(matches!(err, ConnError::Timeout { waiting_for: Flag::Ack, attempts: 3 }));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(!registry.is_bound(client_port));
}

#[tokio::test]
async fn close_before_handshake_is_invalid() {
    let net = SimNetwork::reliable();
    let registry = PortRegistry::new();
    let mut conn = Connection::new(net, registry.clone(), addr(9000), fast())
        .await
        .unwrap();

    assert!(matches!(
        conn.close().await,
        Err(ConnError::InvalidState { op: "close", state: ConnectionState::Closed })
    ));
    assert!(registry.is_bound(9000));
    drop(conn);
    assert!(!registry.is_bound(9000));
}
