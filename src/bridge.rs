//! Bridge supervisor: the state machine that coordinates scanning,
//! connecting, polling, FTMS publishing, reconnection, and teardown over
//! the shared adapter, plus the thread-safe facade the control surface
//! drives it through.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use btleplug::api::BDAddr;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bluetooth::client::{ClientEvent, SessionEvent, WalkingPadClient};
use crate::bluetooth::ftms::FtmsHandle;
use crate::bluetooth::{BleCentral, TreadmillDescriptor};
use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::telemetry::{Telemetry, TelemetryCell};

/// Non-fatal failure kinds carried by [`BridgeState::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ConnectFail,
    LinkLost,
    ProtocolMismatch,
}

/// Bridge lifecycle. One instance per process; every transition happens
/// inside the supervisor task.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeState {
    Idle,
    Scanning,
    Connecting(BDAddr),
    Connected(BDAddr),
    Bridging(BDAddr),
    Error { kind: FailureKind, retry_at: Instant },
}

impl BridgeState {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Connecting(_) => "connecting",
            Self::Connected(_) => "connected",
            Self::Bridging(_) => "bridging",
            Self::Error { .. } => "error",
        }
    }

    #[must_use]
    pub const fn address(&self) -> Option<BDAddr> {
        match self {
            Self::Connecting(addr) | Self::Connected(addr) | Self::Bridging(addr) => Some(*addr),
            _ => None,
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting(addr) => write!(f, "connecting({addr})"),
            Self::Connected(addr) => write!(f, "connected({addr})"),
            Self::Bridging(addr) => write!(f, "bridging({addr})"),
            Self::Error { kind, .. } => write!(f, "error({kind:?})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Point-in-time view for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub state: &'static str,
    pub address: Option<BDAddr>,
    pub failure: Option<FailureKind>,
    pub telemetry: Option<Telemetry>,
    pub ftms_active: bool,
}

fn snapshot_of(state: &BridgeState, telemetry: Option<Telemetry>) -> Snapshot {
    Snapshot {
        state: state.label(),
        address: state.address(),
        failure: match state {
            BridgeState::Error { kind, .. } => Some(*kind),
            _ => None,
        },
        ftms_active: matches!(state, BridgeState::Bridging(_)),
        telemetry,
    }
}

enum Command {
    ScanOnce(oneshot::Sender<Result<Vec<TreadmillDescriptor>>>),
    Connect(BDAddr, oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<Result<()>>),
    BridgeStart(oneshot::Sender<Result<()>>),
    BridgeStop(oneshot::Sender<Result<()>>),
    BeltStart(oneshot::Sender<Result<()>>),
    BeltStop(oneshot::Sender<Result<()>>),
    SetSpeed(f64, oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cancellation latch: `fire` is sticky, `wait` completes once fired.
#[derive(Clone, Default)]
struct ShutdownSignal {
    fired: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        while !self.fired.load(Ordering::SeqCst) {
            let notified = self.notify.notified();
            if self.fired.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
    }
}

/// Race an operation against shutdown so suspended BLE calls stay
/// cancellable.
async fn with_cancel<T>(
    cancel: &ShutdownSignal,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.wait() => Err(BridgeError::Shutdown),
        res = fut => res,
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = 1u64 << failures.min(5);
    Duration::from_secs(exp.min(30))
}

/// Cloneable facade the external control surface binds to. All operations
/// are serialized through the supervisor; idempotent where meaningful.
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<BridgeState>,
    telemetry: TelemetryCell,
    cancel: ShutdownSignal,
}

impl BridgeHandle {
    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.borrow().clone();
        let telemetry = self.telemetry.snapshot().await;
        snapshot_of(&state, telemetry)
    }

    /// Watch bridge state changes (consumed by the out-of-scope UI).
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<BridgeState> {
        self.state.clone()
    }

    pub async fn scan_once(&self) -> Result<Vec<TreadmillDescriptor>> {
        self.request(Command::ScanOnce).await
    }

    pub async fn connect(&self, address: BDAddr) -> Result<()> {
        self.request(|reply| Command::Connect(address, reply)).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    pub async fn bridge_start(&self) -> Result<()> {
        self.request(Command::BridgeStart).await
    }

    pub async fn bridge_stop(&self) -> Result<()> {
        self.request(Command::BridgeStop).await
    }

    pub async fn belt_start(&self) -> Result<()> {
        self.request(Command::BeltStart).await
    }

    pub async fn belt_stop(&self) -> Result<()> {
        self.request(Command::BeltStop).await
    }

    pub async fn set_speed(&self, speed_kmh: f64) -> Result<()> {
        self.request(|reply| Command::SetSpeed(speed_kmh, reply)).await
    }

    /// Tear everything down. Idempotent; fires the cancellation latch
    /// first so the supervisor abandons any suspended BLE call.
    pub async fn shutdown(&self) {
        self.cancel.fire();
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(reply)).await.is_ok() {
            let _ = done.await;
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| BridgeError::Shutdown)?;
        response.await.map_err(|_| BridgeError::Shutdown)?
    }
}

/// The supervisor. Owns the adapter, the client session, and the FTMS
/// server for the process lifetime.
pub struct Bridge {
    config: Config,
    telemetry: TelemetryCell,
    state_tx: watch::Sender<BridgeState>,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<SessionEvent>,
    events: mpsc::Receiver<SessionEvent>,
    cancel: ShutdownSignal,
    central: Option<BleCentral>,
    client: Option<WalkingPadClient>,
    ftms: Option<FtmsHandle>,
    session_seq: u64,
    failures: u32,
    role_conflict: bool,
    quarantined: HashMap<BDAddr, Instant>,
}

impl Bridge {
    #[must_use]
    pub fn new(config: Config) -> (Self, BridgeHandle) {
        let (state_tx, state_rx) = watch::channel(BridgeState::Idle);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(8);
        let telemetry = TelemetryCell::new();
        let cancel = ShutdownSignal::default();

        let handle = BridgeHandle {
            commands: commands_tx,
            state: state_rx,
            telemetry: telemetry.clone(),
            cancel: cancel.clone(),
        };
        let bridge = Self {
            config,
            telemetry,
            state_tx,
            commands: commands_rx,
            events_tx,
            events: events_rx,
            cancel,
            central: None,
            client: None,
            ftms: None,
            session_seq: 0,
            failures: 0,
            role_conflict: false,
            quarantined: HashMap::new(),
        };
        (bridge, handle)
    }

    /// Run until shutdown. All state transitions happen here.
    pub async fn run(mut self) {
        info!(
            "Bridge supervisor starting (auto_mode={}, auto_start_bridge={})",
            self.config.auto_mode, self.config.auto_start_bridge
        );
        if self.config.auto_mode {
            self.set_state(BridgeState::Scanning);
        }

        let mut auto_tick = interval(self.config.scan_interval());
        auto_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_cmd = self.commands.recv() => {
                    match maybe_cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => {
                            // Every handle dropped; nothing can drive us.
                            self.teardown().await;
                            break;
                        }
                    }
                }
                Some(event) = self.events.recv() => {
                    self.handle_session_event(event).await;
                }
                _ = auto_tick.tick(), if self.config.auto_mode => {
                    if let Err(e) = self.auto_step().await {
                        if e.is_fatal() {
                            error!("Fatal error, stopping supervisor: {}", e);
                            self.teardown().await;
                            break;
                        }
                        debug!("Auto step: {}", e);
                    }
                }
            }
        }
        info!("Bridge supervisor stopped");
    }

    /// One pass of the auto-discovery loop, driven by the scan timer.
    async fn auto_step(&mut self) -> Result<()> {
        let state = self.state_tx.borrow().clone();
        match state {
            BridgeState::Idle => {
                self.set_state(BridgeState::Scanning);
                Ok(())
            }
            BridgeState::Scanning => {
                let devices = self.scan_for_treadmill(true).await?;
                let Some(target) = devices.first() else {
                    debug!(
                        "No treadmill found, retrying in {:.1}s",
                        self.config.scan_interval_s
                    );
                    return Ok(());
                };
                info!(
                    "Found treadmill: {} ({}), connecting...",
                    target.advertised_name, target.address
                );
                let address = target.address;
                if let Err(e) = self.connect_to(address).await {
                    self.note_connect_failure(address, &e);
                    return match e {
                        BridgeError::Shutdown => Ok(()),
                        other => Err(other),
                    };
                }
                if self.config.auto_start_bridge {
                    match self.start_bridge().await {
                        Ok(()) | Err(BridgeError::RoleConflict(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            BridgeState::Connected(_) => {
                if self.config.auto_start_bridge && !self.role_conflict {
                    match self.start_bridge().await {
                        Ok(()) | Err(BridgeError::RoleConflict(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            BridgeState::Error { retry_at, .. } => {
                if Instant::now() >= retry_at {
                    self.set_state(BridgeState::Scanning);
                }
                Ok(())
            }
            // Connecting is transient within a step; Bridging health is
            // event-driven.
            BridgeState::Connecting(_) | BridgeState::Bridging(_) => Ok(()),
        }
    }

    /// Returns `true` when the supervisor should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::ScanOnce(reply) => {
                let res = self.scan_for_treadmill(false).await;
                let fatal = matches!(&res, Err(e) if e.is_fatal());
                let _ = reply.send(res);
                if fatal {
                    self.teardown().await;
                    return true;
                }
            }
            Command::Connect(address, reply) => {
                let res = self.manual_connect(address).await;
                let fatal = matches!(&res, Err(e) if e.is_fatal());
                let _ = reply.send(res);
                if fatal {
                    self.teardown().await;
                    return true;
                }
            }
            Command::Disconnect(reply) => {
                self.close_session().await;
                self.set_state(BridgeState::Idle);
                let _ = reply.send(Ok(()));
            }
            Command::BridgeStart(reply) => {
                let _ = reply.send(self.start_bridge().await);
            }
            Command::BridgeStop(reply) => {
                let _ = reply.send(self.stop_bridge().await);
            }
            Command::BeltStart(reply) => {
                let _ = reply.send(self.with_client(|c| c.start_belt()).await);
            }
            Command::BeltStop(reply) => {
                let _ = reply.send(self.with_client(|c| c.stop_belt()).await);
            }
            Command::SetSpeed(speed_kmh, reply) => {
                let _ = reply
                    .send(self.with_client(move |c| c.set_speed_kmh(speed_kmh)).await);
            }
            Command::Shutdown(reply) => {
                self.teardown().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        if event.session != self.session_seq || self.client.is_none() {
            debug!("Ignoring event from finished session: {:?}", event);
            return;
        }
        match &event.event {
            ClientEvent::Stale => warn!(
                "Link stale: no stats reply within {:?}",
                self.config.watchdog_window()
            ),
            ClientEvent::Disconnected(cause) => warn!("Treadmill link lost: {}", cause),
        }

        self.close_session().await;
        self.failures += 1;
        let retry_at = Instant::now() + backoff_delay(self.failures - 1);
        self.set_state(BridgeState::Error {
            kind: FailureKind::LinkLost,
            retry_at,
        });
    }

    async fn with_client<'a, F, Fut>(&'a self, op: F) -> Result<()>
    where
        F: FnOnce(&'a WalkingPadClient) -> Fut,
        Fut: Future<Output = Result<()>> + 'a,
    {
        match self.client.as_ref() {
            Some(client) => op(client).await,
            None => Err(BridgeError::InvalidState {
                state: self.state_tx.borrow().label(),
            }),
        }
    }

    async fn scan_for_treadmill(
        &mut self,
        skip_quarantined: bool,
    ) -> Result<Vec<TreadmillDescriptor>> {
        let now = Instant::now();
        self.quarantined.retain(|_, until| *until > now);

        // The original caps a scan pass at scan_interval + 2, never more
        // than 10 seconds.
        let duration = self
            .config
            .scan_interval()
            .saturating_add(Duration::from_secs(2))
            .min(Duration::from_secs(10));

        let cancel = self.cancel.clone();
        let central = self.central_mut().await?;
        let mut devices = with_cancel(&cancel, central.scan(duration)).await?;
        if skip_quarantined {
            let quarantined = &self.quarantined;
            devices.retain(|d| !quarantined.contains_key(&d.address));
        }
        Ok(devices)
    }

    async fn manual_connect(&mut self, address: BDAddr) -> Result<()> {
        if self.client.is_some() {
            self.close_session().await;
        }
        match self.connect_to(address).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.note_connect_failure(address, &e);
                Err(e)
            }
        }
    }

    /// Connecting → Connected. Resets telemetry for the new episode.
    async fn connect_to(&mut self, address: BDAddr) -> Result<()> {
        self.telemetry.reset().await;
        self.set_state(BridgeState::Connecting(address));

        let cancel = self.cancel.clone();
        let central = self.central_mut().await?;
        let peripheral = with_cancel(&cancel, central.connect(address)).await?;

        self.session_seq += 1;
        let client = with_cancel(
            &cancel,
            WalkingPadClient::attach(
                peripheral,
                self.telemetry.clone(),
                self.config.stats_interval(),
                self.config.watchdog_window(),
                self.session_seq,
                self.events_tx.clone(),
            ),
        )
        .await?;

        self.client = Some(client);
        self.role_conflict = false;
        self.set_state(BridgeState::Connected(address));
        Ok(())
    }

    fn note_connect_failure(&mut self, address: BDAddr, error: &BridgeError) {
        if matches!(error, BridgeError::Shutdown) {
            return;
        }
        warn!("Connect to {} failed: {}", address, error);
        let kind = if error.is_protocol_mismatch() {
            self.quarantined.insert(
                address,
                Instant::now() + self.config.scan_interval().saturating_mul(4),
            );
            FailureKind::ProtocolMismatch
        } else {
            FailureKind::ConnectFail
        };
        self.failures += 1;
        let retry_at = Instant::now() + backoff_delay(self.failures - 1);
        self.set_state(BridgeState::Error { kind, retry_at });
    }

    /// Connected → Bridging. A no-op success when already bridging;
    /// `RoleConflict` leaves the state at Connected.
    async fn start_bridge(&mut self) -> Result<()> {
        let state = self.state_tx.borrow().clone();
        let address = match state {
            BridgeState::Bridging(_) => return Ok(()),
            BridgeState::Connected(addr) => addr,
            other => {
                return Err(BridgeError::InvalidState {
                    state: other.label(),
                })
            }
        };

        let cancel = self.cancel.clone();
        let started = with_cancel(
            &cancel,
            FtmsHandle::start(
                self.config.ble_adapter.as_deref(),
                &self.config.ftms_device_name,
                self.telemetry.clone(),
                self.config.stats_interval(),
            ),
        )
        .await;
        match started {
            Ok(handle) => {
                self.ftms = Some(handle);
                self.failures = 0;
                self.set_state(BridgeState::Bridging(address));
                Ok(())
            }
            Err(e) => {
                if matches!(e, BridgeError::RoleConflict(_)) {
                    warn!("Adapter refused peripheral role, staying connected: {}", e);
                    self.role_conflict = true;
                }
                Err(e)
            }
        }
    }

    /// Bridging → Connected. A no-op success when not bridging.
    async fn stop_bridge(&mut self) -> Result<()> {
        if let Some(ftms) = self.ftms.take() {
            ftms.stop().await;
        }
        if let BridgeState::Bridging(address) = self.state_tx.borrow().clone() {
            self.set_state(BridgeState::Connected(address));
        }
        Ok(())
    }

    /// Tear down the FTMS server and client session, keeping the shutdown
    /// ordering: poll timer, notification pumps, advertising, central link.
    async fn close_session(&mut self) {
        if let Some(client) = &self.client {
            client.cancel_poll();
        }
        if let Some(ftms) = self.ftms.take() {
            ftms.stop().await;
        }
        if let Some(client) = self.client.take() {
            client.disconnect().await;
        }
    }

    /// Full shutdown: session teardown plus adapter release.
    async fn teardown(&mut self) {
        info!("Shutting down bridge");
        self.close_session().await;
        if let Some(central) = self.central.take() {
            central.release().await;
        }
        self.set_state(BridgeState::Idle);
    }

    async fn central_mut(&mut self) -> Result<&mut BleCentral> {
        if self.central.is_none() {
            self.central = Some(BleCentral::new(self.config.ble_adapter.as_deref()).await?);
        }
        match self.central.as_mut() {
            Some(central) => Ok(central),
            None => Err(BridgeError::AdapterUnavailable("adapter released".into())),
        }
    }

    fn set_state(&self, next: BridgeState) {
        let prev = self.state_tx.borrow().clone();
        if prev != next {
            info!("State: {} -> {}", prev, next);
            let _ = self.state_tx.send(next);
        }
    }
}
