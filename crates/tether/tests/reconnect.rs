//! The reconnect protocol, with one side scripted message by message.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tether::Hub;
use tether::PeerRef;
use tether::Transport;
use tether::Value;
use tether::mock_transport::Acceptor;
use tether::mock_transport::MockNetwork;
use tether::transport::Connector;
use tetherrpc::ArgumentCodec;
use tetherrpc::Handshake;
use tetherrpc::Message;
use tetherrpc::MethodRef;
use tetherrpc::PackCodec;
use tetherrpc::ReconnectRequest;
use tetherrpc::RemoteErrorKind;
use tetherrpc::SystemCall;
use tetherrpc::message::call_kind;
use tetherrpc::seq;

use common::calc_client;
use common::calc_service;
use common::eventually;
use common::fast_config;
use common::pair;

// --- Script helpers ---

async fn next(transport: &dyn Transport) -> Arc<Message> {
    tokio::time::timeout(Duration::from_secs(5), transport.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("transport failed")
        .expect("transport closed")
}

async fn assert_silent(transport: &dyn Transport) {
    let quiet = tokio::time::timeout(Duration::from_millis(150), transport.recv()).await;
    assert!(quiet.is_err(), "unexpected message: {:?}", quiet);
}

async fn send(transport: &dyn Transport, call: SystemCall, id: i64) {
    transport.send(Arc::new(call.to_message(id).unwrap())).await.unwrap();
}

fn handshake(peer_id: u64, index: u32) -> SystemCall {
    SystemCall::Handshake(Handshake { peer_id, protocol_version: 1, index })
}

/// Answers the handshake the hub opens with and returns it.
async fn accept_handshake(transport: &dyn Transport, peer_id: u64, index: u32) -> Handshake {
    let theirs = expect_system(transport).await.0;
    let SystemCall::Handshake(theirs) = theirs else {
        panic!("expected a handshake, got {:?}", theirs);
    };
    send(transport, handshake(peer_id, index), 0).await;
    theirs
}

async fn expect_system(transport: &dyn Transport) -> (SystemCall, i64) {
    let msg = next(transport).await;
    let call = SystemCall::decode(&msg).unwrap_or_else(|e| panic!("{} is not a system call: {}", msg, e));
    (call, msg.related_id)
}

fn calc_call(method: &str, id: i64) -> Arc<Message> {
    let data = PackCodec.serialize(&[]).unwrap();
    Arc::new(Message::new(call_kind::REGULAR, id, MethodRef::new("Calc", method), data, Vec::new()))
}

/// A client hub dialing a scripted "server" over `network`.
fn dialing_hub(network: &Arc<MockNetwork>) -> Hub {
    Hub::builder().config(fast_config()).peer_connector("server", network.clone()).build().unwrap()
}

/// Connects to the scripted server, parks an `Add` call on it and severs
/// the connection. Returns the call's id and the running call.
async fn park_and_sever(
    hub: &Hub,
    network: &MockNetwork,
    acceptor: &Acceptor,
) -> (i64, tokio::task::JoinHandle<tether::client::Result<Value>>) {
    let calc = hub.client_for("server", calc_client());
    hub.peer("server").unwrap();

    let first = acceptor.accept().await.unwrap();
    accept_handshake(first.as_ref(), 77, 1).await;

    let running = tokio::spawn(async move { calc.call("Add", vec![Value::I64(2), Value::I64(3)]).await });
    let call = next(first.as_ref()).await;
    assert_eq!(call.method, MethodRef::new("Calc", "Add"));

    network.sever_all();
    (call.related_id, running)
}

// --- Outbound side ---

#[tokio::test]
async fn test_same_peer_resends_only_requested_calls() {
    common::init_tracing();
    let (network, acceptor) = MockNetwork::new();
    let hub = dialing_hub(&network);
    let (id, running) = park_and_sever(&hub, &network, &acceptor).await;

    let second = acceptor.accept().await.unwrap();
    let theirs = accept_handshake(second.as_ref(), 77, 2).await;
    assert_eq!(theirs.index, 2);

    let (query, query_id) = expect_system(second.as_ref()).await;
    let SystemCall::Reconnect(request) = query else {
        panic!("expected a reconnect query, got {:?}", query);
    };
    assert_eq!(request.handshake_index, 2);
    let staged: Vec<u64> = request.stages.values().flat_map(|ids| seq::decompress(ids).unwrap()).collect();
    assert_eq!(staged, vec![id as u64]);

    send(second.as_ref(), SystemCall::Ok(Value::Bytes(seq::compress([id as u64]))), query_id).await;
    let resent = next(second.as_ref()).await;
    assert_eq!(resent.related_id, id);
    assert_eq!(resent.method, MethodRef::new("Calc", "Add"));

    send(second.as_ref(), SystemCall::Ok(Value::I64(5)), id).await;
    assert_eq!(running.await.unwrap().unwrap(), Value::I64(5));
}

#[tokio::test]
async fn test_known_calls_are_not_resent() {
    let (network, acceptor) = MockNetwork::new();
    let hub = dialing_hub(&network);
    let (id, running) = park_and_sever(&hub, &network, &acceptor).await;

    let second = acceptor.accept().await.unwrap();
    accept_handshake(second.as_ref(), 77, 2).await;
    let (query, query_id) = expect_system(second.as_ref()).await;
    assert!(matches!(query, SystemCall::Reconnect(_)));

    send(second.as_ref(), SystemCall::Ok(Value::Bytes(seq::compress(std::iter::empty()))), query_id).await;
    assert_silent(second.as_ref()).await;

    // The remote side still runs the call and finishes it on the new link.
    send(second.as_ref(), SystemCall::Ok(Value::I64(5)), id).await;
    assert_eq!(running.await.unwrap().unwrap(), Value::I64(5));
}

#[tokio::test]
async fn test_restarted_peer_gets_every_call_resent() {
    let (network, acceptor) = MockNetwork::new();
    let hub = dialing_hub(&network);
    let (id, running) = park_and_sever(&hub, &network, &acceptor).await;

    let second = acceptor.accept().await.unwrap();
    accept_handshake(second.as_ref(), 78, 1).await;

    let resent = next(second.as_ref()).await;
    assert_eq!(resent.related_id, id, "expected a resend, not a query: {}", resent);
    send(second.as_ref(), SystemCall::Ok(Value::I64(5)), id).await;
    assert_eq!(running.await.unwrap().unwrap(), Value::I64(5));
}

#[tokio::test]
async fn test_handshake_mismatch_falls_back_to_full_resend() {
    let (network, acceptor) = MockNetwork::new();
    let hub = dialing_hub(&network);
    let (id, running) = park_and_sever(&hub, &network, &acceptor).await;

    let second = acceptor.accept().await.unwrap();
    accept_handshake(second.as_ref(), 77, 2).await;
    let (_, query_id) = expect_system(second.as_ref()).await;
    let mismatch = tetherrpc::RemoteError::new(RemoteErrorKind::HandshakeMismatch, "expected handshake #3");
    send(second.as_ref(), SystemCall::Error(mismatch), query_id).await;

    let resent = next(second.as_ref()).await;
    assert_eq!(resent.related_id, id);
    send(second.as_ref(), SystemCall::Ok(Value::I64(5)), id).await;
    assert_eq!(running.await.unwrap().unwrap(), Value::I64(5));

    let peer = hub.get_peer(&PeerRef::new("server")).unwrap();
    eventually("the query to be unregistered", || peer.outbound().count() == 0).await;
}

// --- Inbound side ---

/// A server hub serving `Calc` to a scripted "client".
async fn scripted_client(peer_id: u64) -> (Hub, Arc<MockNetwork>, Arc<AtomicUsize>, Box<dyn Transport>, Handshake) {
    let (network, acceptor) = MockNetwork::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let server = Hub::builder()
        .config(fast_config())
        .service(calc_service(counter.clone()))
        .peer_connector("client", acceptor)
        .build()
        .unwrap();
    server.peer("client").unwrap();

    let transport = network.connect().await.unwrap();
    send(transport.as_ref(), handshake(peer_id, 1), 0).await;
    let (theirs, _) = expect_system(transport.as_ref()).await;
    let SystemCall::Handshake(theirs) = theirs else {
        panic!("expected a handshake, got {:?}", theirs);
    };
    (server, network, counter, transport, theirs)
}

fn reconnect_query(handshake_index: u32, ids: &[u64]) -> SystemCall {
    let mut stages = BTreeMap::new();
    stages.insert(0u8, seq::compress(ids.iter().copied()));
    SystemCall::Reconnect(ReconnectRequest { handshake_index, stages })
}

#[tokio::test]
async fn test_duplicate_inbound_call_runs_once() {
    let (server, _network, counter, client, _) = scripted_client(77).await;

    client.send(calc_call("Count", 1)).await.unwrap();
    client.send(calc_call("Count", 1)).await.unwrap();

    let (reply, id) = expect_system(client.as_ref()).await;
    assert_eq!(id, 1);
    assert!(matches!(reply, SystemCall::Ok(Value::U64(1))), "{:?}", reply);
    assert_silent(client.as_ref()).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let peer = server.get_peer(&PeerRef::new("client")).unwrap();
    eventually("the call to be unregistered", || peer.inbound().count() == 0).await;
}

#[tokio::test]
async fn test_reconnect_query_reports_untracked_ids() {
    let (server, _network, _, client, theirs) = scripted_client(77).await;
    let peer = server.get_peer(&PeerRef::new("client")).unwrap();

    client.send(calc_call("Park", 3)).await.unwrap();
    eventually("the call to arrive", || peer.inbound().count() == 1).await;

    send(client.as_ref(), reconnect_query(theirs.index, &[3, 4]), 10).await;
    let (reply, id) = expect_system(client.as_ref()).await;
    assert_eq!(id, 10);
    let SystemCall::Ok(Value::Bytes(unknown)) = reply else {
        panic!("unexpected reply {:?}", reply);
    };
    assert_eq!(seq::decompress(&unknown).unwrap(), vec![4]);

    send(client.as_ref(), reconnect_query(theirs.index + 1, &[3]), 11).await;
    let (reply, id) = expect_system(client.as_ref()).await;
    assert_eq!(id, 11);
    assert!(matches!(reply, SystemCall::Error(ref e) if e.kind == RemoteErrorKind::HandshakeMismatch));

    send(client.as_ref(), SystemCall::Cancel, 3).await;
    let (reply, id) = expect_system(client.as_ref()).await;
    assert_eq!(id, 3);
    assert!(matches!(reply, SystemCall::Error(ref e) if e.kind == RemoteErrorKind::Cancelled), "{:?}", reply);
    eventually("the call to be unregistered", || peer.inbound().count() == 0).await;
}

#[tokio::test]
async fn test_remote_restart_drops_inbound_calls() {
    let (server, network, _, client, _) = scripted_client(77).await;
    let peer = server.get_peer(&PeerRef::new("client")).unwrap();

    client.send(calc_call("Park", 1)).await.unwrap();
    eventually("the call to arrive", || peer.inbound().count() == 1).await;

    network.sever_all();
    let restarted = network.connect().await.unwrap();
    send(restarted.as_ref(), handshake(78, 1), 0).await;
    let (theirs, _) = expect_system(restarted.as_ref()).await;
    assert!(matches!(theirs, SystemCall::Handshake(h) if h.index == 2));

    eventually("the call to be dropped", || peer.inbound().count() == 0).await;
    assert_silent(restarted.as_ref()).await;
}

// --- Both sides ---

#[tokio::test]
async fn test_call_survives_disconnect_and_runs_once() {
    let pair = pair(fast_config());
    let calc = pair.client.client_for("server", calc_client());
    let server_peer = pair.server.get_peer(&PeerRef::new("client")).unwrap();

    let running = tokio::spawn(async move { calc.call("Count", Vec::new()).await });
    eventually("the call to arrive", || server_peer.inbound().count() == 1).await;
    pair.network.sever_all();

    assert_eq!(running.await.unwrap().unwrap(), Value::U64(1));
    assert_eq!(pair.counter.load(Ordering::SeqCst), 1);
    assert!(pair.network.connect_count() >= 2);
}

#[tokio::test]
async fn test_unsent_call_goes_out_after_reconnect() {
    let pair = pair(fast_config());
    let calc = pair.client.client_for("server", calc_client());
    let client_peer = pair.client.get_peer(&PeerRef::new("server")).unwrap();
    client_peer.connected().await.unwrap();

    pair.network.set_refusing(true);
    pair.network.sever_all();
    eventually("the client to notice the disconnect", || !client_peer.is_connected()).await;

    let running = tokio::spawn(async move { calc.call("Add", vec![Value::I64(40), Value::I64(2)]).await });
    eventually("the call to register", || client_peer.outbound().count() == 1).await;
    pair.network.set_refusing(false);

    assert_eq!(running.await.unwrap().unwrap(), Value::I64(42));
}
