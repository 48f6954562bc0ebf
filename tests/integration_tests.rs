//! End-to-end tests on a private loopback swarm.
//!
//! Every test starts its own [`Testnet`] so nodes never share state across
//! tests.

use spaceswarm_core::{
    ConnectOptions, Connection, ConnectionMode, FirewallClass, FirewallPolicy, HolepunchInfo,
    KeyPair, Node, NodeConfig, NodeError, PublicKey, Server, ServerOptions,
};
use spaceswarm_dht::HolepunchConfig;
use spaceswarm_integration_tests::Testnet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any single connect in these tests
const CONNECT_DEADLINE: Duration = Duration::from_secs(20);

async fn listening(node: &Node, options: ServerOptions) -> Server {
    let server = node.create_server(options);
    server.listen().await.unwrap();
    server
}

/// Echo every message on accepted connections until the server closes.
fn spawn_echo(server: &Server) {
    let server = server.clone();
    tokio::spawn(async move {
        while let Ok(connection) = server.accept().await {
            tokio::spawn(async move {
                while let Ok(Some(message)) = connection.read().await {
                    if connection.write(&message).await.is_err() {
                        break;
                    }
                }
                let _ = connection.end().await;
            });
        }
    });
}

async fn connect(node: &Node, key: PublicKey, options: ConnectOptions) -> Connection {
    let handle = node.connect(key, options).unwrap();
    tokio::time::timeout(CONNECT_DEADLINE, handle)
        .await
        .expect("connect deadline")
        .unwrap()
}

async fn roundtrip(connection: &Connection, message: &[u8]) {
    connection.write(message).await.unwrap();
    let reply = connection.read().await.unwrap();
    assert_eq!(reply.as_deref(), Some(message));
}

// ============================================================================
// Basic Connectivity
// ============================================================================

#[tokio::test]
async fn test_hi_end_to_end() {
    let testnet = Testnet::new(2).await;
    let (a, b) = (&testnet.nodes[0], &testnet.nodes[1]);

    let server = listening(a, ServerOptions::default()).await;
    let (tx, rx) = tokio::sync::oneshot::channel();
    {
        let server = server.clone();
        tokio::spawn(async move {
            let connection = server.accept().await.unwrap();
            connection.write(b"hi").await.unwrap();
            let _ = tx.send(connection.remote_public_key());
            connection.end().await.unwrap();
        });
    }

    let client = connect(b, server.public_key(), ConnectOptions::default()).await;
    assert_eq!(client.remote_public_key(), server.public_key());
    assert_eq!(client.public_key(), b.public_key());
    assert_eq!(client.mode(), ConnectionMode::Direct);

    assert_eq!(client.read().await.unwrap().as_deref(), Some(b"hi".as_slice()));
    assert_eq!(client.read().await.unwrap(), None);
    assert_eq!(rx.await.unwrap(), b.public_key());

    server.close().await;
    testnet.destroy().await;
}

#[tokio::test]
async fn test_connect_by_encoded_key() {
    let testnet = Testnet::new(2).await;
    let server = listening(&testnet.nodes[0], ServerOptions::default()).await;
    spawn_echo(&server);

    let encoded = server.public_key().to_z32();
    assert_eq!(encoded.len(), 52);
    let client = testnet.nodes[1]
        .connect(encoded.as_str(), ConnectOptions::default())
        .unwrap()
        .await
        .unwrap();
    roundtrip(&client, b"by text").await;

    server.close().await;
    testnet.destroy().await;
}

#[tokio::test]
async fn test_invalid_keys_fail_synchronously() {
    let testnet = Testnet::new(1).await;
    let node = &testnet.nodes[0];

    let missing: Option<PublicKey> = None;
    assert!(matches!(
        node.connect(missing, ConnectOptions::default()),
        Err(NodeError::InvalidKey(_))
    ));
    assert!(matches!(
        node.connect("not a key", ConnectOptions::default()),
        Err(NodeError::InvalidKey(_))
    ));
    assert!(matches!(
        node.connect(vec![1u8; 31], ConnectOptions::default()),
        Err(NodeError::InvalidKey(_))
    ));

    testnet.destroy().await;
}

#[tokio::test]
async fn test_unknown_server_not_found() {
    let testnet = Testnet::new(2).await;
    let stranger = KeyPair::generate().public_key();
    let err = testnet.nodes[0]
        .connect(stranger, ConnectOptions::default())
        .unwrap()
        .await
        .unwrap_err();
    assert_eq!(err, NodeError::PeerNotFound(stranger.to_bytes()));
    testnet.destroy().await;
}

#[tokio::test]
async fn test_server_with_custom_key_pair() {
    let testnet = Testnet::new(2).await;
    let key_pair = Node::key_pair(Some([9u8; 32]));
    let server = listening(
        &testnet.nodes[0],
        ServerOptions {
            key_pair: Some(key_pair.clone()),
            ..ServerOptions::default()
        },
    )
    .await;
    spawn_echo(&server);
    assert_eq!(server.public_key(), key_pair.public_key());

    let address = server.address().unwrap();
    assert_eq!(address.public_key, key_pair.public_key());
    assert_eq!(address.port, testnet.nodes[0].address().port);

    let client = connect(&testnet.nodes[1], key_pair.public_key(), ConnectOptions::default()).await;
    roundtrip(&client, b"custom").await;

    server.close().await;
    testnet.destroy().await;
}

#[tokio::test]
async fn test_client_with_custom_key_pair() {
    let testnet = Testnet::new(2).await;
    let server = listening(&testnet.nodes[0], ServerOptions::default()).await;
    let accepted = {
        let server = server.clone();
        tokio::spawn(async move { server.accept().await.unwrap() })
    };

    let identity = KeyPair::generate();
    let client = connect(
        &testnet.nodes[1],
        server.public_key(),
        ConnectOptions {
            key_pair: Some(identity.clone()),
            ..ConnectOptions::default()
        },
    )
    .await;
    assert_eq!(client.public_key(), identity.public_key());
    assert_eq!(accepted.await.unwrap().remote_public_key(), identity.public_key());

    server.close().await;
    testnet.destroy().await;
}

#[tokio::test]
async fn test_same_node_connection() {
    let testnet = Testnet::new(1).await;
    let node = &testnet.nodes[0];
    let server = listening(node, ServerOptions::default()).await;
    spawn_echo(&server);

    let client = connect(node, server.public_key(), ConnectOptions::default()).await;
    assert_eq!(client.mode(), ConnectionMode::Local);
    roundtrip(&client, b"loopback").await;

    server.close().await;
    testnet.destroy().await;
}

// ============================================================================
// Keep-Alive
// ============================================================================

#[tokio::test]
async fn test_keep_alive_default_and_disabled() {
    let testnet = Testnet::new(2).await;
    let server = listening(&testnet.nodes[0], ServerOptions::default()).await;
    spawn_echo(&server);

    let default = connect(&testnet.nodes[1], server.public_key(), ConnectOptions::default()).await;
    assert_eq!(default.keep_alive(), Some(Duration::from_millis(5000)));

    let off = connect(
        &testnet.nodes[1],
        server.public_key(),
        ConnectOptions {
            keep_alive: Some(Duration::ZERO),
            ..ConnectOptions::default()
        },
    )
    .await;
    assert_eq!(off.keep_alive(), None);
    roundtrip(&off, b"still works").await;

    server.close().await;
    testnet.destroy().await;
}

#[tokio::test]
async fn test_node_wide_keep_alive_off() {
    let testnet = Testnet::with_config(2, |config| config.connection_keep_alive = None).await;
    let server = listening(&testnet.nodes[0], ServerOptions::default()).await;
    spawn_echo(&server);

    let client = connect(&testnet.nodes[1], server.public_key(), ConnectOptions::default()).await;
    assert_eq!(client.keep_alive(), None);

    server.close().await;
    testnet.destroy().await;
}

// ============================================================================
// Holepunching
// ============================================================================

async fn firewalled_node(testnet: &mut Testnet) -> Node {
    let config = NodeConfig {
        firewall: Some(FirewallClass::Consistent),
        ..testnet.config()
    };
    testnet.spawn(config).await
}

fn hidden_server() -> ServerOptions {
    ServerOptions {
        share_local_address: false,
        ..ServerOptions::default()
    }
}

fn no_lan() -> ConnectOptions {
    ConnectOptions {
        local_connection: false,
        ..ConnectOptions::default()
    }
}

#[tokio::test]
async fn test_forced_holepunch() {
    let mut testnet = Testnet::new(1).await;
    let server_node = firewalled_node(&mut testnet).await;
    assert_eq!(server_node.firewall(), FirewallClass::Consistent);

    let server = listening(&server_node, hidden_server()).await;
    spawn_echo(&server);

    let client = connect(&testnet.nodes[0], server.public_key(), no_lan()).await;
    assert_eq!(client.mode(), ConnectionMode::Holepunched);
    roundtrip(&client, b"punched").await;

    server.close().await;
    testnet.destroy().await;
}

#[tokio::test]
async fn test_lan_path_when_sharing_addresses() {
    let mut testnet = Testnet::new(1).await;
    let server_node = firewalled_node(&mut testnet).await;
    let server = listening(&server_node, ServerOptions::default()).await;
    spawn_echo(&server);

    let client = connect(&testnet.nodes[0], server.public_key(), ConnectOptions::default()).await;
    assert!(matches!(
        client.mode(),
        ConnectionMode::Local | ConnectionMode::Holepunched
    ));
    roundtrip(&client, b"lan").await;

    server.close().await;
    testnet.destroy().await;
}

#[tokio::test]
async fn test_server_firewall_policy_aborts() {
    let testnet = Testnet::new(2).await;
    let server = listening(
        &testnet.nodes[0],
        ServerOptions {
            policy: Arc::new(FirewallPolicy(|_: &PublicKey, _: &[SocketAddr]| false)),
            ..ServerOptions::default()
        },
    )
    .await;

    let err = testnet.nodes[1]
        .connect(server.public_key(), ConnectOptions::default())
        .unwrap()
        .await
        .unwrap_err();
    assert_eq!(err, NodeError::HolepunchAborted);
    assert_eq!(server.connection_count(), 0);

    server.close().await;
    testnet.destroy().await;
}

#[tokio::test]
async fn test_client_holepunch_policy_aborts() {
    let mut testnet = Testnet::new(1).await;
    let server_node = firewalled_node(&mut testnet).await;
    let server = listening(&server_node, hidden_server()).await;

    let relay = KeyPair::generate().public_key();
    let err = testnet.nodes[0]
        .connect(
            server.public_key(),
            ConnectOptions {
                policy: Arc::new(|_: &HolepunchInfo| false),
                relay_through: Some(relay),
                ..no_lan()
            },
        )
        .unwrap()
        .await
        .unwrap_err();
    // An abort never falls back to the relay.
    assert_eq!(err, NodeError::HolepunchAborted);

    server.close().await;
    testnet.destroy().await;
}

#[tokio::test]
async fn test_server_holepunch_policy_aborts() {
    let mut testnet = Testnet::new(1).await;
    let server_node = firewalled_node(&mut testnet).await;
    let server = listening(
        &server_node,
        ServerOptions {
            policy: Arc::new(|_: &HolepunchInfo| false),
            ..hidden_server()
        },
    )
    .await;

    let err = testnet.nodes[0]
        .connect(server.public_key(), no_lan())
        .unwrap()
        .await
        .unwrap_err();
    assert_eq!(err, NodeError::HolepunchAborted);

    server.close().await;
    testnet.destroy().await;
}

// ============================================================================
// Relaying
// ============================================================================

#[tokio::test]
async fn test_relay_when_punching_is_skipped() {
    let mut testnet = Testnet::new(0).await;
    let relay_config = NodeConfig {
        relay: true,
        ..testnet.config()
    };
    let relay_node = testnet.spawn(relay_config).await;
    let relay_key = relay_node.relay_key().unwrap();
    assert_eq!(relay_key, relay_node.public_key());

    let server_node = firewalled_node(&mut testnet).await;
    let server = listening(&server_node, hidden_server()).await;
    spawn_echo(&server);

    let client_config = NodeConfig {
        holepunch: HolepunchConfig {
            max_rounds: 0,
            ..HolepunchConfig::default()
        },
        ..testnet.config()
    };
    let client_node = testnet.spawn(client_config).await;
    let client = connect(
        &client_node,
        server.public_key(),
        ConnectOptions {
            relay_through: Some(relay_key),
            ..no_lan()
        },
    )
    .await;
    assert_eq!(client.mode(), ConnectionMode::Relayed);
    assert_eq!(client.remote_public_key(), server.public_key());
    roundtrip(&client, b"through the relay").await;
    roundtrip(&client, b"twice").await;

    server.close().await;
    testnet.destroy().await;
}

#[tokio::test]
async fn test_punch_failure_without_relay() {
    let mut testnet = Testnet::new(1).await;
    let server_node = firewalled_node(&mut testnet).await;
    let server = listening(&server_node, hidden_server()).await;

    let client_config = NodeConfig {
        holepunch: HolepunchConfig {
            max_rounds: 0,
            ..HolepunchConfig::default()
        },
        ..testnet.config()
    };
    let client_node = testnet.spawn(client_config).await;
    let err = client_node
        .connect(server.public_key(), no_lan())
        .unwrap()
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::ConnectionFailed(_)));

    server.close().await;
    testnet.destroy().await;
}

// ============================================================================
// Socket Reuse And Raw Streams
// ============================================================================

#[tokio::test]
async fn test_reusable_sockets_shared() {
    let testnet = Testnet::new(3).await;
    let first = listening(&testnet.nodes[0], ServerOptions::default()).await;
    let second = listening(&testnet.nodes[1], ServerOptions::default()).await;
    spawn_echo(&first);
    spawn_echo(&second);

    let client_node = &testnet.nodes[2];
    let reusable = || ConnectOptions {
        reusable_socket: true,
        ..ConnectOptions::default()
    };
    let a = connect(client_node, first.public_key(), reusable()).await;
    let b = connect(client_node, second.public_key(), reusable()).await;
    assert!(a.raw_socket_id().is_some());
    assert_eq!(a.raw_socket_id(), b.raw_socket_id());

    let c = connect(client_node, first.public_key(), ConnectOptions::default()).await;
    assert_ne!(c.raw_socket_id(), a.raw_socket_id());

    roundtrip(&a, b"a").await;
    roundtrip(&b, b"b").await;

    first.close().await;
    second.close().await;
    testnet.destroy().await;
}

#[tokio::test]
async fn test_raw_stream_alongside_connection() {
    let testnet = Testnet::new(2).await;
    let (server_node, client_node) = (&testnet.nodes[0], &testnet.nodes[1]);
    let server = listening(server_node, ServerOptions::default()).await;
    let accepted = {
        let server = server.clone();
        tokio::spawn(async move { server.accept().await.unwrap() })
    };
    let client = connect(client_node, server.public_key(), ConnectOptions::default()).await;
    let served = accepted.await.unwrap();

    let client_raw = client_node.create_raw_stream();
    let server_raw = server_node.create_raw_stream();
    client.connect_raw_stream(&client_raw, server_raw.id()).await.unwrap();
    served.connect_raw_stream(&server_raw, client_raw.id()).await.unwrap();

    client_raw.send(b"plain bytes").await.unwrap();
    assert_eq!(
        server_raw.recv().await.unwrap().as_deref(),
        Some(b"plain bytes".as_slice())
    );
    server_raw.send(b"back").await.unwrap();
    assert_eq!(client_raw.recv().await.unwrap().as_deref(), Some(b"back".as_slice()));

    // The encrypted stream is unaffected.
    served.write(b"secret").await.unwrap();
    assert_eq!(client.read().await.unwrap().as_deref(), Some(b"secret".as_slice()));

    server.close().await;
    testnet.destroy().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_destroy_closes_connections() {
    let testnet = Testnet::new(2).await;
    let server = listening(&testnet.nodes[0], ServerOptions::default()).await;
    spawn_echo(&server);
    let client = connect(&testnet.nodes[1], server.public_key(), ConnectOptions::default()).await;

    client.destroy().await;
    assert!(client.is_closed());
    tokio::time::timeout(Duration::from_secs(1), client.closed())
        .await
        .unwrap();
    assert_eq!(client.write(b"late").await, Err(NodeError::ConnectionClosed));

    testnet.nodes[1].destroy().await;
    assert!(testnet.nodes[1].is_destroyed());
    assert!(matches!(
        testnet.nodes[1].connect(server.public_key(), ConnectOptions::default()),
        Err(NodeError::Destroyed)
    ));

    server.close().await;
    testnet.destroy().await;
}

#[tokio::test]
async fn test_server_close_ends_accept() {
    let testnet = Testnet::new(1).await;
    let server = listening(&testnet.nodes[0], ServerOptions::default()).await;
    assert!(server.is_listening());
    server.close().await;
    assert!(!server.is_listening());
    assert_eq!(server.accept().await.unwrap_err(), NodeError::ServerClosed);
    testnet.destroy().await;
}

// ============================================================================
// Bootstrap
// ============================================================================

#[tokio::test]
async fn test_bootstrap_with_suggested_ip() {
    let mut testnet = Testnet::new(1).await;
    let port = testnet.bootstrap.address().port;
    let config = NodeConfig {
        bootstrap: vec![format!("127.0.0.1@unresolvable.invalid:{port}")],
        ..testnet.config()
    };
    let node = testnet.spawn(config).await;
    assert!(!node.to_array().is_empty());
    testnet.destroy().await;
}

#[tokio::test]
async fn test_bootstrap_from_known_nodes() {
    let mut testnet = Testnet::new(1).await;
    let seed: SocketAddr = format!("127.0.0.1:{}", testnet.bootstrap.address().port)
        .parse()
        .unwrap();
    let config = NodeConfig {
        bootstrap: Vec::new(),
        known_nodes: vec![seed],
        ..testnet.config()
    };
    let node = testnet.spawn(config).await;
    assert!(node.to_array().iter().any(|peer| peer.addr == seed));
    testnet.destroy().await;
}

#[tokio::test]
async fn test_observed_address() {
    let testnet = Testnet::new(2).await;
    let address = testnet.nodes[0].address();
    assert_eq!(address.host, std::net::IpAddr::from([127, 0, 0, 1]));
    assert_eq!(address.public_key, testnet.nodes[0].public_key());
    assert_eq!(testnet.nodes[0].firewall(), FirewallClass::Open);
    testnet.destroy().await;
}

// ============================================================================
// Records
// ============================================================================

#[tokio::test]
async fn test_immutable_records() {
    let testnet = Testnet::new(3).await;
    let key = testnet.nodes[0].immutable_put(b"testing").await.unwrap();
    assert_eq!(key, Node::hash(b"testing"));

    let value = testnet.nodes[2].immutable_get(key).await.unwrap();
    assert_eq!(value.as_deref(), Some(b"testing".as_slice()));
    assert_eq!(testnet.nodes[2].immutable_get(Node::hash(b"absent")).await.unwrap(), None);

    let err = testnet.nodes[0].immutable_put(&[0u8; 1001]).await.unwrap_err();
    assert!(matches!(err, NodeError::ValueTooLarge { .. }));
    testnet.destroy().await;
}

#[tokio::test]
async fn test_mutable_records() {
    let testnet = Testnet::new(3).await;
    let key_pair = Node::key_pair(None);
    let writer = &testnet.nodes[0];

    writer.mutable_put(&key_pair, b"first", 1, None).await.unwrap();
    writer.mutable_put(&key_pair, b"second", 2, None).await.unwrap();

    let got = testnet.nodes[1]
        .mutable_get(key_pair.public_key(), None, 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.seq, 2);
    assert_eq!(got.value, b"second");
    assert!(
        testnet.nodes[1]
            .mutable_get(key_pair.public_key(), None, 3)
            .await
            .unwrap()
            .is_none()
    );

    assert_eq!(
        writer.mutable_put(&key_pair, b"stale", 1, None).await,
        Err(NodeError::SeqTooLow)
    );
    assert_eq!(
        writer.mutable_put(&key_pair, b"forked", 2, None).await,
        Err(NodeError::SeqReused)
    );
    testnet.destroy().await;
}

#[tokio::test]
async fn test_mutable_salts_are_separate_records() {
    let testnet = Testnet::new(3).await;
    let key_pair = Node::key_pair(None);
    let writer = &testnet.nodes[0];

    writer.mutable_put(&key_pair, b"profile", 1, Some(b"profile")).await.unwrap();
    writer.mutable_put(&key_pair, b"status", 1, Some(b"status")).await.unwrap();

    let reader = &testnet.nodes[2];
    let profile = reader
        .mutable_get(key_pair.public_key(), Some(b"profile"), 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile.value, b"profile");
    let status = reader
        .mutable_get(key_pair.public_key(), Some(b"status"), 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.value, b"status");
    assert!(reader.mutable_get(key_pair.public_key(), None, 0).await.unwrap().is_none());
    testnet.destroy().await;
}

#[tokio::test]
async fn test_announce_lookup_unannounce() {
    let testnet = Testnet::new(4).await;
    let topic = Node::hash(b"swarm topic");
    let peers = [Node::key_pair(None), Node::key_pair(None)];

    for (node, key_pair) in testnet.nodes.iter().zip(&peers) {
        let stored = node.announce(topic, key_pair).await.unwrap();
        assert!(!stored.is_empty());
    }

    let replies = testnet.nodes[3].lookup(topic).await.unwrap();
    let mut found: Vec<PublicKey> = replies
        .iter()
        .flat_map(|reply| reply.peers.iter().map(|peer| peer.public_key))
        .collect();
    found.sort();
    found.dedup();
    let mut expected: Vec<PublicKey> = peers.iter().map(KeyPair::public_key).collect();
    expected.sort();
    assert_eq!(found, expected);

    testnet.nodes[0].unannounce(topic, &peers[0]).await.unwrap();
    let remaining: Vec<PublicKey> = testnet.nodes[3]
        .lookup(topic)
        .await
        .unwrap()
        .iter()
        .flat_map(|reply| reply.peers.iter().map(|peer| peer.public_key))
        .collect();
    assert!(!remaining.contains(&peers[0].public_key()));
    assert!(remaining.contains(&peers[1].public_key()));
    testnet.destroy().await;
}

#[tokio::test]
async fn test_find_peer_for_listening_server() {
    let testnet = Testnet::new(3).await;
    let server = listening(&testnet.nodes[0], ServerOptions::default()).await;

    let found = testnet.nodes[2].find_peer(server.public_key()).await.unwrap().unwrap();
    assert_eq!(found.record.public_key, server.public_key());
    assert!(!found.rendezvous.is_empty());

    server.close().await;
    assert!(
        testnet.nodes[2]
            .find_peer(server.public_key())
            .await
            .unwrap()
            .is_none()
    );
    testnet.destroy().await;
}
