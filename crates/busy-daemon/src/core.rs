/// DaemonCore: single-owner event loop for all mutable state.
///
/// Every request from the socket or HTTP API is sent as a `DaemonEvent` to
/// this loop.  DaemonCore owns the `SettingsSynchronizer` and the `Scheduler`
/// exclusively; nothing else mutates settings or timers.  Channel timers feed
/// their ticks into the same loop, so a tick always reads a consistent
/// snapshot and requests apply strictly in arrival order.
///
/// After each request that mutates state the new `DaemonState` is published
/// to the `StateBoard` and a `BusMessage::StateUpdated` goes out on the bus,
/// before the caller's reply is sent.
use std::sync::Arc;

use busy_proto::channel::Channel;
use busy_proto::error::BusyError;
use busy_proto::protocol::Request;
use busy_proto::settings::SettingKey;
use busy_proto::sync::{MergeOutcome, SettingsSynchronizer, Source};
use busy_proto::volume::clamp_unit;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bus::NotificationBus;
use crate::gateway::{self, PlaybackGateway};
use crate::scheduler::{Scheduler, Tick};
use crate::state::StateBoard;
use crate::transport::SettingsTransport;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A request from a client.  `reply`, when present, receives the result
    /// once the request has been fully applied.
    Request {
        request: Request,
        reply: Option<oneshot::Sender<Result<(), BusyError>>>,
    },
    /// Shutdown requested.
    Shutdown,
}

/// Cheap, cloneable sender side of the core loop.
#[derive(Clone)]
pub struct CoreHandle {
    tx: mpsc::Sender<DaemonEvent>,
}

impl CoreHandle {
    pub fn new(tx: mpsc::Sender<DaemonEvent>) -> Self {
        Self { tx }
    }

    /// Send a request and wait until the core has applied it.
    pub async fn request(&self, request: Request) -> Result<(), BusyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DaemonEvent::Request {
                request,
                reply: Some(reply),
            })
            .await
            .map_err(|_| BusyError::CoreUnavailable)?;
        rx.await.map_err(|_| BusyError::CoreUnavailable)?
    }

    /// Queue a request without waiting for its result.
    #[allow(dead_code)]
    pub async fn send(&self, request: Request) -> Result<(), BusyError> {
        self.tx
            .send(DaemonEvent::Request { request, reply: None })
            .await
            .map_err(|_| BusyError::CoreUnavailable)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(DaemonEvent::Shutdown).await;
    }
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore {
    sync: SettingsSynchronizer,
    scheduler: Scheduler,
    gateway: Arc<dyn PlaybackGateway>,
    transport: Arc<dyn SettingsTransport>,
    bus: NotificationBus,
    board: StateBoard,
    /// Taken by `run`.
    tick_rx: Option<mpsc::Receiver<Tick>>,
}

impl DaemonCore {
    pub fn new(
        sync: SettingsSynchronizer,
        gateway: Arc<dyn PlaybackGateway>,
        transport: Arc<dyn SettingsTransport>,
        bus: NotificationBus,
    ) -> Self {
        let (tick_tx, tick_rx) = mpsc::channel::<Tick>(256);
        let scheduler = Scheduler::new(tick_tx, Arc::clone(&gateway), bus.clone());
        let board = StateBoard::new(sync.snapshot().clone());
        Self {
            sync,
            scheduler,
            gateway,
            transport,
            bus,
            board,
            tick_rx: Some(tick_rx),
        }
    }

    /// Read handle on the published state (for the socket and HTTP servers).
    pub fn board(&self) -> StateBoard {
        self.board.clone()
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or every `CoreHandle` has been dropped.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");
        let mut tick_rx = self
            .tick_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("tick channel already taken"))?;

        if self.sync.snapshot().globals.auto_start {
            let started = self.scheduler.start_all_enabled(self.sync.snapshot());
            info!("DaemonCore: autoStart started {} channel(s)", started);
            self.publish_state().await;
        }

        loop {
            tokio::select! {
                // Requests first: a stop must never wait behind queued ticks.
                biased;

                evt = event_rx.recv() => match evt {
                    None => {
                        info!("DaemonCore: event channel closed, shutting down");
                        break;
                    }
                    Some(DaemonEvent::Shutdown) => {
                        info!("DaemonCore: shutdown requested");
                        break;
                    }
                    Some(DaemonEvent::Request { request, reply }) => {
                        debug!("DaemonCore: request {:?}", request);
                        let mutates = !matches!(request, Request::GetState);
                        let result = self.handle_request(request);
                        if let Err(e) = &result {
                            warn!("DaemonCore: request failed: {}", e);
                        }
                        if mutates {
                            self.publish_state().await;
                        }
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                },

                Some(tick) = tick_rx.recv() => {
                    self.scheduler.on_tick(self.sync.snapshot(), tick);
                }
            }
        }

        info!("DaemonCore: stopping {} timer(s)", self.scheduler.live_timers());
        self.scheduler.stop_all();
        self.publish_state().await;
        Ok(())
    }

    fn handle_request(&mut self, request: Request) -> Result<(), BusyError> {
        match request {
            Request::PlaySound {
                app_id,
                sound_file,
                interval,
                volume,
            } => self.play_sound(app_id, sound_file, interval, volume),

            Request::StopSound { app_id } => self.set_enabled(&app_id, false),

            Request::ToggleSound { app_id } => {
                let enabled = self.sync.snapshot().channels.get(&app_id)?.enabled;
                self.set_enabled(&app_id, !enabled)
            }

            Request::StopAll => {
                self.scheduler.stop_all();
                Ok(())
            }

            Request::StartAll => {
                let started = self.scheduler.start_all_enabled(self.sync.snapshot());
                info!("DaemonCore: started {} channel(s)", started);
                Ok(())
            }

            Request::TestSound { sound_file, volume } => {
                gateway::dispatch(&self.gateway, &sound_file, clamp_unit(volume), format!("test {}", sound_file));
                Ok(())
            }

            Request::UpdateInterval { app_id, interval } => {
                let key = SettingKey::ChannelInterval(self.sync.snapshot().channels.get(&app_id)?.id.clone());
                self.user_edit(&key, Value::from(interval))
            }

            Request::UpdateVolume { app_id, volume } => {
                let key = SettingKey::ChannelVolume(self.sync.snapshot().channels.get(&app_id)?.id.clone());
                self.user_edit(&key, Value::from(volume))
            }

            Request::SetSetting { key, value } => {
                let outcome = self.sync.apply_user_edit(&key, value)?;
                if outcome.is_noop() {
                    if let Some(rejected) = outcome.rejected.first() {
                        return Err(BusyError::Validation(rejected.to_string()));
                    }
                }
                self.react(&outcome, Source::User);
                Ok(())
            }

            Request::SettingsUpdate { payload } => {
                let outcome = self.sync.apply_remote_update(&payload)?;
                self.react(&outcome, Source::Remote);
                Ok(())
            }

            Request::ApplyDefaults => {
                let outcome = self.sync.apply_defaults()?;
                self.react(&outcome, Source::User);
                Ok(())
            }

            Request::GetState => Ok(()),
        }
    }

    /// Configure a channel (creating it if unknown) and enable it.  Fields left
    /// out of the request keep their stored values.
    fn play_sound(
        &mut self,
        app_id: String,
        sound_file: Option<String>,
        interval: Option<f64>,
        volume: Option<f32>,
    ) -> Result<(), BusyError> {
        let snapshot = self.sync.snapshot();
        let mut channel = match snapshot.channels.get(&app_id) {
            Ok(existing) => existing.clone(),
            Err(_) => {
                let sound = sound_file
                    .clone()
                    .ok_or_else(|| BusyError::Validation(format!("new channel '{}' needs a soundFile", app_id)))?;
                let g = &snapshot.globals;
                Channel::new(app_id.clone(), sound, g.default_interval, g.default_app_volume)
            }
        };
        if let Some(sound) = sound_file {
            channel.sound_ref = sound;
        }
        if let Some(interval) = interval {
            channel.interval_ms = busy_proto::channel::clamp_interval(interval);
        }
        if let Some(volume) = volume {
            channel.volume = clamp_unit(volume);
        }

        let outcome = self.sync.upsert_channel(channel)?;
        self.react(&outcome, Source::User);
        self.set_enabled(&app_id, true)
    }

    fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<(), BusyError> {
        let outcome = self.sync.set_enabled(id, enabled)?;
        self.scheduler.set_enabled(self.sync.snapshot(), id, enabled)?;
        self.react(&outcome, Source::User);
        Ok(())
    }

    fn user_edit(&mut self, key: &SettingKey, value: Value) -> Result<(), BusyError> {
        let name = key.name(&self.sync.snapshot().channels);
        let outcome = self.sync.apply_user_edit(&name, value)?;
        self.react(&outcome, Source::User);
        Ok(())
    }

    /// Follow up on a committed merge: re-time affected channels, resume on a
    /// sound-enabled flip, notify clients and mirror user edits to the host.
    fn react(&mut self, outcome: &MergeOutcome, source: Source) {
        let snapshot = self.sync.snapshot();

        for id in outcome.interval_changes() {
            if let Ok(channel) = snapshot.channels.get(id) {
                if self.scheduler.update_interval(id, channel.interval_ms) {
                    debug!("DaemonCore: {} re-timed, {:?}", id, self.scheduler.state(id));
                }
            }
        }

        match outcome.sound_enabled_flip(snapshot) {
            Some(true) => {
                let started = self.scheduler.start_pending(snapshot);
                info!("DaemonCore: sound enabled, {} pending channel(s) started", started);
            }
            Some(false) => info!("DaemonCore: sound disabled, ticks will be skipped"),
            None => {}
        }

        if outcome.changed.is_empty() {
            return;
        }
        let keys: Vec<String> = outcome.changed.iter().map(|k| k.name(&snapshot.channels)).collect();
        self.bus.settings_changed(keys);

        if source != Source::User {
            return;
        }
        for key in outcome.changed.iter().filter(|k| !matches!(k, SettingKey::ChannelEnabled(_))) {
            let Some(value) = snapshot.lookup(key) else {
                continue;
            };
            let name = key.name(&snapshot.channels);
            let publish = self.transport.publish(&name, &value);
            tokio::spawn(async move {
                if let Err(e) = publish.await {
                    warn!("transport: failed to publish {}: {:#}", name, e);
                }
            });
        }
    }

    async fn publish_state(&self) {
        let snapshot = self.sync.snapshot();
        let playing = self.scheduler.running_ids(snapshot);
        self.board.publish(snapshot.clone(), playing).await;
        self.bus.state_updated();
    }
}
