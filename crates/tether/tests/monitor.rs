//! The peer state monitor against live peers, on paused time.

mod common;

use std::time::Duration;

use tokio::sync::watch;

use tether::MonitorConfig;
use tether::PeerRef;
use tether::PeerState;
use tether::PeerStateKind;

use common::fast_config;
use common::pair_with;

fn monitor_config() -> MonitorConfig {
    MonitorConfig {
        just_connected_period: Duration::from_millis(300),
        just_disconnected_period: Duration::from_millis(500),
        min_reconnects_in: Duration::from_millis(50),
        extra_delay: Duration::from_millis(5),
    }
}

async fn wait_kind(state: &mut watch::Receiver<PeerState>, kind: PeerStateKind) -> PeerState {
    let reached = tokio::time::timeout(Duration::from_secs(10), state.wait_for(|s| s.kind == kind))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", kind));
    reached.unwrap().clone()
}

#[tokio::test(start_paused = true)]
async fn test_monitor_debounces_a_dropped_connection() {
    common::init_tracing();
    let pair = pair_with(fast_config(), |builder| builder.monitor_config(monitor_config()));
    let monitor = pair.client.monitor("server").unwrap();
    let mut state = monitor.state();

    wait_kind(&mut state, PeerStateKind::JustConnected).await;
    pair.network.set_refusing(true);
    pair.network.sever_all();

    // The connect window outlives the drop.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(monitor.current().kind, PeerStateKind::JustConnected);

    let dropped = wait_kind(&mut state, PeerStateKind::JustDisconnected).await;
    assert!(dropped.error.is_some());

    let down = wait_kind(&mut state, PeerStateKind::Disconnected).await;
    assert!(down.error.unwrap().contains("refusing"));

    // Failed attempts keep it Disconnected, with an ETA once one is far enough out.
    let eta = tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| s.kind != PeerStateKind::Disconnected || s.reconnects_at.is_some()),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(eta.kind, PeerStateKind::Disconnected);

    pair.network.set_refusing(false);
    wait_kind(&mut state, PeerStateKind::JustConnected).await;
    let up = wait_kind(&mut state, PeerStateKind::Connected).await;
    assert_eq!(up.error, None);
    assert_eq!(up.reconnects_at, None);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_follows_a_replaced_peer() {
    let pair = pair_with(fast_config(), |builder| builder.monitor_config(monitor_config()));
    let monitor = pair.client.monitor("server").unwrap();
    let mut state = monitor.state();
    wait_kind(&mut state, PeerStateKind::Connected).await;

    assert!(pair.client.remove_peer(&PeerRef::new("server")).await);
    wait_kind(&mut state, PeerStateKind::JustConnected).await;
    wait_kind(&mut state, PeerStateKind::Connected).await;

    assert!(pair.client.get_peer(&PeerRef::new("server")).is_some());
    assert_eq!(pair.network.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_stops_with_the_hub() {
    let pair = pair_with(fast_config(), |builder| builder.monitor_config(monitor_config()));
    let monitor = pair.client.monitor("server").unwrap();
    let mut state = monitor.state();
    wait_kind(&mut state, PeerStateKind::Connected).await;

    pair.client.shutdown().await;
    let closed = tokio::time::timeout(Duration::from_secs(10), async {
        while state.changed().await.is_ok() {}
    })
    .await;
    assert!(closed.is_ok(), "monitor kept running after shutdown");
    assert!(!monitor.current().kind.is_connected());
}
