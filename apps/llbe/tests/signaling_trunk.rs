use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use llbe::{
    error::LinkError,
    trunk::{LinkConnector, LinkEvents, SignalingLink, SignalingTrunk, TrunkSettings, TrunkState},
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Fail,
    Hang,
}

#[derive(Default)]
struct MockLink {
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MockLink {
    fn sent(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .map(|text| serde_json::from_str(text).expect("json"))
            .collect()
    }
}

impl SignalingLink for MockLink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, text: String) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::Disconnected);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Plays back scripted failures, then opens links that succeed.
#[derive(Default)]
struct ScriptedConnector {
    script: Mutex<VecDeque<Outcome>>,
    attempts: Mutex<Vec<Instant>>,
    links: Mutex<Vec<(LinkEvents, Arc<MockLink>)>>,
}

impl ScriptedConnector {
    fn with_script(script: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
        let connector = Self::default();
        connector.script.lock().extend(script);
        Arc::new(connector)
    }

    fn attempts(&self) -> usize {
        self.attempts.lock().len()
    }

    fn latest(&self) -> (LinkEvents, Arc<MockLink>) {
        self.links.lock().last().cloned().expect("a link was opened")
    }
}

#[async_trait]
impl LinkConnector for ScriptedConnector {
    async fn open(
        &self,
        _url: &str,
        events: LinkEvents,
    ) -> Result<Arc<dyn SignalingLink>, LinkError> {
        self.attempts.lock().push(Instant::now());
        let outcome = self.script.lock().pop_front();
        match outcome {
            Some(Outcome::Fail) => Err(LinkError::Connect("connection refused".into())),
            Some(Outcome::Hang) => std::future::pending().await,
            None => {
                let link = Arc::new(MockLink {
                    open: AtomicBool::new(true),
                    sent: Mutex::new(Vec::new()),
                });
                self.links.lock().push((events, Arc::clone(&link)));
                Ok(link)
            }
        }
    }
}

fn settings() -> TrunkSettings {
    TrunkSettings {
        url: "ws://backend.test/signal".into(),
        username: "relay".into(),
        password: "secret".into(),
        connect_timeout: Duration::from_secs(2),
        backoff_floor: Duration::from_secs(1),
        backoff_cap: Duration::from_secs(15),
        poll_interval: Duration::from_millis(100),
    }
}

async fn settle() {
    // Lets spawned tasks run without moving the paused clock far.
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn authenticates_first_then_pings() {
    let connector = ScriptedConnector::with_script([]);
    let trunk = SignalingTrunk::new(settings(), connector.clone());
    trunk.start();
    settle().await;
    assert_eq!(trunk.state(), TrunkState::Connected);

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let (_, link) = connector.latest();
    let sent = link.sent();
    assert_eq!(sent[0]["type"], "user:auth");
    assert_eq!(sent[0]["username"], "relay");
    assert_eq!(sent[0]["password"], "secret");
    assert!(sent.len() >= 3, "expected pings after auth, got {sent:?}");
    assert!(sent[1..].iter().all(|message| message["type"] == "ping"));
    assert!(trunk.last_heartbeat().is_some());
    assert_eq!(trunk.current_backoff(), Duration::from_secs(1));

    trunk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_attempts_back_off_exponentially() {
    let connector = ScriptedConnector::with_script([Outcome::Fail, Outcome::Fail, Outcome::Fail]);
    let trunk = SignalingTrunk::new(settings(), connector.clone());
    let started = Instant::now();
    trunk.start();

    tokio::time::sleep(Duration::from_millis(7_500)).await;
    let offsets: Vec<u64> = connector
        .attempts
        .lock()
        .iter()
        .map(|at| at.duration_since(started).as_secs())
        .collect();
    assert_eq!(offsets, vec![0, 1, 3, 7]);
    assert!(trunk.is_connected());

    trunk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn hung_connect_times_out() {
    let connector = ScriptedConnector::with_script([Outcome::Hang]);
    let trunk = SignalingTrunk::new(settings(), connector.clone());
    trunk.start();

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(trunk.state(), TrunkState::Connecting);
    assert_eq!(connector.attempts(), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(trunk.state(), TrunkState::Disconnected);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(trunk.is_connected());
    assert_eq!(connector.attempts(), 2);

    trunk.shutdown().await;
}

#[tokio::test]
async fn send_without_link_is_rejected() {
    let trunk = SignalingTrunk::new(settings(), ScriptedConnector::with_script([]));
    assert_eq!(trunk.send("{}".into()), Err(LinkError::Disconnected));
    assert_eq!(trunk.state(), TrunkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_the_backend_closes() {
    let connector = ScriptedConnector::with_script([]);
    let trunk = SignalingTrunk::new(settings(), connector.clone());
    trunk.start();
    settle().await;
    let (events, first) = connector.latest();

    first.close();
    events.closed();
    settle().await;
    assert_eq!(trunk.state(), TrunkState::Disconnected);
    assert_eq!(trunk.send("{}".into()), Err(LinkError::Disconnected));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(trunk.is_connected());
    assert_eq!(connector.attempts(), 2);
    let (_, second) = connector.latest();
    assert_eq!(second.sent()[0]["type"], "user:auth");

    trunk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn inbound_messages_reach_the_subscriber() {
    let connector = ScriptedConnector::with_script([]);
    let trunk = SignalingTrunk::new(settings(), connector.clone());
    let mut inbound = trunk.subscribe();
    trunk.start();
    settle().await;

    let (events, _) = connector.latest();
    events.message(r#"{"type":"ping","timestamp":1}"#.into());
    let received = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
        .await
        .expect("delivered")
        .expect("subscription open");
    assert_eq!(received, r#"{"type":"ping","timestamp":1}"#);

    // After a reconnect, the old link's events are ignored.
    events.closed();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(trunk.is_connected());
    events.message(r#"{"type":"stale"}"#.into());
    let (fresh, _) = connector.latest();
    fresh.message(r#"{"type":"fresh"}"#.into());
    let received = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
        .await
        .expect("delivered")
        .expect("subscription open");
    assert_eq!(received, r#"{"type":"fresh"}"#);

    trunk.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_the_link_and_stops_retrying() {
    let connector = ScriptedConnector::with_script([]);
    let trunk = SignalingTrunk::new(settings(), connector.clone());
    trunk.start();
    settle().await;
    let (_, link) = connector.latest();

    trunk.shutdown().await;
    assert_eq!(trunk.state(), TrunkState::Disconnected);
    assert!(!link.is_open());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.attempts(), 1);
}
