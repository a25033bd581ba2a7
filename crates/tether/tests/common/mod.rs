//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tether::CancellationToken;
use tether::Hub;
use tether::RpcConfig;
use tether::ServiceBuilder;
use tether::ServiceDef;
use tether::Value;
use tether::ValueType;
use tether::mock_transport::MockNetwork;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast timers, no jitter.
pub fn fast_config() -> RpcConfig {
    RpcConfig {
        timeout_check_period: Duration::from_millis(50),
        timeout_check_jitter: 0.0,
        abort_cycle_period: Duration::from_millis(10),
        reconnect_delay_min: Duration::from_millis(20),
        reconnect_delay_max: Duration::from_millis(200),
        reconnect_jitter: 0.0,
        ..RpcConfig::default()
    }
}

fn add(args: Vec<Value>) -> anyhow::Result<Value> {
    match args.as_slice() {
        [Value::I64(a), Value::I64(b)] => Ok(Value::I64(a + b)),
        other => anyhow::bail!("unexpected arguments: {:?}", other),
    }
}

fn fail() -> anyhow::Result<Value> {
    anyhow::bail!("division by zero")
}

fn boom() -> anyhow::Result<Value> {
    panic!("boom")
}

async fn park(scope: CancellationToken) -> anyhow::Result<Value> {
    scope.cancelled().await;
    anyhow::bail!("cancelled")
}

/// The server side of the `Calc` service. `Count` returns how often it ran.
pub fn calc_service(counter: Arc<AtomicUsize>) -> ServiceDef {
    ServiceBuilder::new("Calc")
        .method("Add", vec![ValueType::I64, ValueType::I64], |args, _| async move { add(args) })
        .method("Fail", Vec::new(), |_, _| async move { fail() })
        .method("Panic", Vec::new(), |_, _| async move { boom() })
        .method("Park", Vec::new(), |_, scope| park(scope))
        .method("Count", Vec::new(), move |_, _| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Value::U64(counter.fetch_add(1, Ordering::SeqCst) as u64 + 1))
            }
        })
        .build()
}

/// The client side declarations of `Calc`.
pub fn calc_client() -> ServiceDef {
    ServiceBuilder::new("Calc")
        .declare("Add", vec![ValueType::I64, ValueType::I64])
        .declare("Fail", Vec::new())
        .declare("Panic", Vec::new())
        .declare("Park", Vec::new())
        .declare("Count", Vec::new())
        .declare("Missing", Vec::new())
        .build()
}

pub struct Pair {
    pub server: Hub,
    pub client: Hub,
    pub network: Arc<MockNetwork>,
    pub counter: Arc<AtomicUsize>,
}

/// A server hub serving `Calc` to peer "client", and a client hub that
/// dials it as peer "server". Both peers are started.
pub fn pair(config: RpcConfig) -> Pair {
    pair_with(config, |builder| builder)
}

pub fn pair_with(config: RpcConfig, extra: impl FnOnce(tether::HubBuilder) -> tether::HubBuilder) -> Pair {
    let (network, acceptor) = MockNetwork::new();
    let counter = Arc::new(AtomicUsize::new(0));

    let server = Hub::builder()
        .config(config.clone())
        .service(calc_service(counter.clone()))
        .peer_connector("client", acceptor)
        .build()
        .unwrap();
    let client = extra(Hub::builder().config(config).peer_connector("server", network.clone()))
        .build()
        .unwrap();

    server.peer("client").unwrap();
    client.peer("server").unwrap();
    Pair { server, client, network, counter }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
