//! Outbound, self-healing link to the signaling backend.

mod backoff;
mod link;

pub use backoff::Backoff;
pub use link::{LinkConnector, LinkEvent, LinkEvents, SignalingLink, WebSocketConnector};

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use metrics::counter;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, trace, warn};

use crate::{
    config::ServerConfig,
    error::LinkError,
    router::SignalSink,
    signaling::{now_millis, OutboundSignal},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrunkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl TrunkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TrunkState::Connecting,
            2 => TrunkState::Connected,
            _ => TrunkState::Disconnected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrunkSettings {
    pub url: String,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,
    pub poll_interval: Duration,
}

impl From<&ServerConfig> for TrunkSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            url: config.address.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            connect_timeout: config.connect_timeout(),
            backoff_floor: config.backoff_floor(),
            backoff_cap: config.backoff_cap(),
            poll_interval: config.poll_interval(),
        }
    }
}

struct ActiveLink {
    generation: u64,
    link: Arc<dyn SignalingLink>,
}

/// The relay's single connection to the signaling backend.
///
/// A background loop keeps the link alive: while disconnected it dispatches
/// connect attempts spaced by an exponential backoff, while connected it
/// sends a heartbeat every floor interval. Each fresh link is authenticated
/// with a `user:auth` message before anything else is sent on it.
pub struct SignalingTrunk {
    settings: TrunkSettings,
    connector: Arc<dyn LinkConnector>,
    link: Mutex<Option<ActiveLink>>,
    state: AtomicU8,
    generation: AtomicU64,
    backoff: Mutex<Backoff>,
    last_heartbeat: Mutex<Option<Instant>>,
    subscriber: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<(u64, LinkEvent)>>>,
    stop: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingTrunk {
    pub fn new(settings: TrunkSettings, connector: Arc<dyn LinkConnector>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let backoff = Backoff::new(settings.backoff_floor, settings.backoff_cap);
        Arc::new(Self {
            settings,
            connector,
            link: Mutex::new(None),
            state: AtomicU8::new(TrunkState::Disconnected as u8),
            generation: AtomicU64::new(0),
            backoff: Mutex::new(backoff),
            last_heartbeat: Mutex::new(None),
            subscriber: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            stop: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Returns a receiver for inbound backend messages. Only one subscriber
    /// is served: a later call replaces the earlier receiver.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.subscriber.lock() = Some(tx);
        rx
    }

    /// Spawns the event pump and the reconnect/heartbeat loop, which
    /// dispatches the first connect attempt right away. Calling it again is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(events_rx) = self.events_rx.lock().take() else {
            debug!("signaling trunk already started");
            return;
        };
        self.stop.store(false, Ordering::SeqCst);

        let pump = tokio::spawn(Arc::clone(self).pump_events(events_rx));
        let background = tokio::spawn(Arc::clone(self).run());

        self.tasks.lock().extend([background, pump]);
        info!(url = %self.settings.url, "signaling trunk started");
    }

    /// Dispatches an open attempt unless a live link or an attempt in flight
    /// already exists. Completion is reported asynchronously.
    pub fn connect(self: &Arc<Self>) -> bool {
        let mut guard = self.link.lock();
        if let Some(active) = guard.as_ref() {
            if active.link.is_open() {
                return true;
            }
        }
        if self.state() == TrunkState::Connecting {
            return true;
        }
        if let Some(stale) = guard.take() {
            stale.link.close();
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(TrunkState::Connecting);
        drop(guard);

        counter!("llbe_trunk_connect_attempts_total", 1);
        debug!(generation, url = %self.settings.url, "dispatching signaling connect");
        let trunk = Arc::clone(self);
        tokio::spawn(async move { trunk.open_link(generation).await });
        true
    }

    /// Sends `text` if the link is connected; otherwise the message is dropped.
    pub fn send(&self, text: String) -> Result<(), LinkError> {
        let guard = self.link.lock();
        match guard.as_ref() {
            Some(active) if self.is_connected() => active.link.send(text),
            _ => {
                trace!("dropping signaling message while disconnected");
                Err(LinkError::Disconnected)
            }
        }
    }

    pub fn state(&self) -> TrunkState {
        TrunkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TrunkState::Connected
    }

    pub fn current_backoff(&self) -> Duration {
        self.backoff.lock().current()
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        *self.last_heartbeat.lock()
    }

    /// Asks the background loop to disconnect and exit.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stops the loop, waits for it to exit and closes the link.
    pub async fn shutdown(&self) {
        self.stop();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let mut tasks = tasks.into_iter();
        if let Some(background) = tasks.next() {
            let _ = background.await;
        }
        for task in tasks {
            task.abort();
        }
        self.disconnect();
    }

    fn disconnect(&self) {
        let mut guard = self.link.lock();
        if let Some(active) = guard.take() {
            active.link.close();
        }
        // Invalidate events from an attempt still in flight.
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.set_state(TrunkState::Disconnected);
    }

    fn set_state(&self, state: TrunkState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    async fn open_link(self: Arc<Self>, generation: u64) {
        let events = LinkEvents::new(generation, self.events_tx.clone());
        let attempt = self.connector.open(&self.settings.url, events.clone());
        let result = match tokio::time::timeout(self.settings.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(self.settings.connect_timeout)),
        };

        match result {
            Ok(link) => {
                let mut guard = self.link.lock();
                if self.generation.load(Ordering::SeqCst) != generation || self.stop_requested() {
                    drop(guard);
                    link.close();
                    return;
                }
                *guard = Some(ActiveLink { generation, link });
                drop(guard);
                events.emit(LinkEvent::Opened);
            }
            Err(err) => {
                counter!("llbe_trunk_connect_failures_total", 1);
                warn!(error = %err, url = %self.settings.url, "signaling connect failed");
                let _guard = self.link.lock();
                if self.generation.load(Ordering::SeqCst) == generation {
                    self.set_state(TrunkState::Disconnected);
                }
            }
        }
    }

    async fn pump_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<(u64, LinkEvent)>) {
        while let Some((generation, event)) = events.recv().await {
            if generation != self.generation.load(Ordering::SeqCst) {
                trace!(generation, ?event, "ignoring event from superseded signaling link");
                continue;
            }
            match event {
                LinkEvent::Opened => self.on_open(generation),
                LinkEvent::Message(text) => self.deliver(text),
                LinkEvent::Closed => {
                    info!("signaling link closed");
                    self.on_link_down(generation);
                }
                LinkEvent::Error(reason) => {
                    warn!(%reason, "signaling link error");
                    self.on_link_down(generation);
                }
            }
        }
    }

    fn on_open(&self, generation: u64) {
        let mut guard = self.link.lock();
        let Some(active) = guard.as_ref().filter(|active| active.generation == generation) else {
            return;
        };
        if !active.link.is_open() {
            *guard = None;
            self.set_state(TrunkState::Disconnected);
            return;
        }

        self.set_state(TrunkState::Connected);
        let auth = OutboundSignal::Auth {
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
        };
        match auth.encode() {
            Ok(text) => {
                if let Err(err) = active.link.send(text) {
                    warn!(error = %err, "failed to send signaling authentication");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode signaling authentication"),
        }
        info!(url = %self.settings.url, "signaling link connected");
    }

    fn on_link_down(&self, generation: u64) {
        let mut guard = self.link.lock();
        let current = guard
            .as_ref()
            .map_or(true, |active| active.generation == generation);
        if current {
            if let Some(active) = guard.take() {
                active.link.close();
            }
            self.set_state(TrunkState::Disconnected);
        }
    }

    fn deliver(&self, text: String) {
        match self.subscriber.lock().as_ref() {
            Some(tx) => {
                if tx.send(text).is_err() {
                    debug!("signaling subscriber dropped; discarding message");
                }
            }
            None => debug!("no signaling subscriber; discarding message"),
        }
    }

    async fn run(self: Arc<Self>) {
        while !self.stop_requested() {
            if !self.is_connected() {
                self.connect();
                let delay = self.backoff.lock().advance();
                debug!(delay_ms = delay.as_millis() as u64, "signaling link down; waiting to retry");
                self.sleep_unless_stopped(delay).await;
                continue;
            }

            self.send_heartbeat();
            let floor = self.backoff.lock().floor();
            self.sleep_unless_stopped(floor).await;
        }
        self.disconnect();
        info!("signaling trunk stopped");
    }

    fn send_heartbeat(&self) {
        let ping = OutboundSignal::Ping {
            timestamp: now_millis(),
        };
        let result = ping
            .encode()
            .map_err(|err| LinkError::Send(err.to_string()))
            .and_then(|text| self.send(text));
        match result {
            Ok(()) => {
                *self.last_heartbeat.lock() = Some(Instant::now());
                self.backoff.lock().reset();
            }
            Err(err) => debug!(error = %err, "signaling heartbeat not sent"),
        }
    }

    async fn sleep_unless_stopped(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(self.settings.poll_interval)).await;
        }
    }
}

impl SignalSink for SignalingTrunk {
    fn send_signal(&self, text: String) -> Result<(), LinkError> {
        self.send(text)
    }
}
