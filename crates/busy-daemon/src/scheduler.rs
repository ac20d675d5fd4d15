/// Scheduler: one cancellable repeating timer per channel.
///
/// Owned exclusively by `DaemonCore`; nothing else touches timer state.  A
/// timer is a small tokio task that only sends [`Tick`] messages back into the
/// core loop, so tick handling is serialized with every configuration change
/// and always sees a consistent snapshot.
///
/// Each timer carries a generation number.  Cancelling aborts the task, and
/// any tick it had already queued is dropped in [`Scheduler::on_tick`] because
/// its generation no longer matches.  Once a disable or `stop_all` has been
/// processed no further playback can come from the old timer.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use busy_proto::channel::clamp_interval;
use busy_proto::error::BusyError;
use busy_proto::settings::SettingsSnapshot;
use busy_proto::volume::effective_volume;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::bus::NotificationBus;
use crate::gateway::{self, PlaybackGateway};

/// One firing of a channel timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    pub channel_id: String,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Idle,
    Running { period: Duration, generation: u64 },
}

struct Timer {
    generation: u64,
    period: Duration,
    task: JoinHandle<()>,
}

pub struct Scheduler {
    timers: HashMap<String, Timer>,
    /// Channels enabled while sound was off, started when sound comes back.
    pending: HashSet<String>,
    next_generation: u64,
    tick_tx: mpsc::Sender<Tick>,
    gateway: Arc<dyn PlaybackGateway>,
    bus: NotificationBus,
}

impl Scheduler {
    pub fn new(tick_tx: mpsc::Sender<Tick>, gateway: Arc<dyn PlaybackGateway>, bus: NotificationBus) -> Self {
        Self {
            timers: HashMap::new(),
            pending: HashSet::new(),
            next_generation: 1,
            tick_tx,
            gateway,
            bus,
        }
    }

    pub fn state(&self, id: &str) -> ScheduleState {
        match self.timers.get(id) {
            Some(t) => ScheduleState::Running {
                period: t.period,
                generation: t.generation,
            },
            None => ScheduleState::Idle,
        }
    }

    pub fn live_timers(&self) -> usize {
        self.timers.len()
    }

    /// Ids of running channels, in registry order.
    pub fn running_ids(&self, snapshot: &SettingsSnapshot) -> Vec<String> {
        snapshot
            .channels
            .iter()
            .filter(|c| self.timers.contains_key(&c.id))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Enable or disable a channel's timer.  Enabling only starts a timer
    /// while sound is globally enabled, and never starts a second one.
    /// `sound_status` is emitted only when the running state changes.
    /// Returns whether the channel is now running.
    pub fn set_enabled(&mut self, snapshot: &SettingsSnapshot, id: &str, enabled: bool) -> Result<bool, BusyError> {
        let channel = snapshot.channels.get(id)?;
        let was_running = self.timers.contains_key(id);

        if enabled {
            if !snapshot.globals.sound_enabled {
                debug!("scheduler: {} enabled while sound is off, staying idle", id);
                if !was_running {
                    self.pending.insert(id.to_string());
                }
            } else if !was_running {
                let period = Duration::from_millis(channel.interval_ms);
                self.start(id, period, false);
            }
        } else {
            self.pending.remove(id);
            self.cancel(id);
        }

        let playing = self.timers.contains_key(id);
        if playing != was_running {
            info!("scheduler: {} -> {}", id, if playing { "running" } else { "idle" });
            self.bus.sound_status(id, playing);
        }
        Ok(playing)
    }

    /// Start the channels that were enabled while sound was off.  Channels
    /// since disabled, or already running, are skipped.
    pub fn start_pending(&mut self, snapshot: &SettingsSnapshot) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let mut started = 0;
        for channel in snapshot.channels.iter().filter(|c| pending.contains(&c.id)) {
            if !channel.enabled || self.timers.contains_key(&channel.id) {
                continue;
            }
            self.start(&channel.id, Duration::from_millis(channel.interval_ms), false);
            info!("scheduler: {} -> running", channel.id);
            self.bus.sound_status(&channel.id, true);
            started += 1;
        }
        started
    }

    /// Replace a live timer with one of the new period.  The first tick under
    /// the new period comes a full period from now.  Idle channels are left
    /// alone; returns whether a timer was restarted.
    pub fn update_interval(&mut self, id: &str, new_interval_ms: u64) -> bool {
        if !self.timers.contains_key(id) {
            return false;
        }
        self.cancel(id);
        let period = Duration::from_millis(clamp_interval(new_interval_ms as f64));
        self.start(id, period, true);
        info!("scheduler: {} period now {}ms", id, period.as_millis());
        true
    }

    /// Cancel every timer.  Emits a single `all_stopped`.
    pub fn stop_all(&mut self) -> usize {
        let stopped = self.timers.len();
        self.pending.clear();
        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
        info!("scheduler: stopped {} timer(s)", stopped);
        self.bus.all_stopped();
        stopped
    }

    /// Run the enable path for every channel whose intent is enabled.
    pub fn start_all_enabled(&mut self, snapshot: &SettingsSnapshot) -> usize {
        let mut running = 0;
        for channel in snapshot.channels.iter().filter(|c| c.enabled) {
            if let Ok(true) = self.set_enabled(snapshot, &channel.id, true) {
                running += 1;
            }
        }
        running
    }

    /// Handle one tick: play the channel's sound unless sound is globally off.
    /// Skipped ticks leave the timer running.
    pub fn on_tick(&self, snapshot: &SettingsSnapshot, tick: Tick) {
        match self.timers.get(&tick.channel_id) {
            Some(t) if t.generation == tick.generation => {}
            _ => {
                trace!("scheduler: dropping stale tick {:?}", tick);
                return;
            }
        }
        let Ok(channel) = snapshot.channels.get(&tick.channel_id) else {
            debug!("scheduler: tick for unknown channel {}", tick.channel_id);
            return;
        };
        if !snapshot.globals.sound_enabled || !channel.enabled {
            trace!("scheduler: {} tick skipped (sound off)", channel.id);
            return;
        }

        let volume = effective_volume(channel.volume, snapshot.globals.global_volume);
        gateway::dispatch(&self.gateway, &channel.sound_ref, volume, format!("channel {}", channel.id));
    }

    fn start(&mut self, id: &str, period: Duration, delay_first: bool) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let start = if delay_first {
            Instant::now() + period
        } else {
            Instant::now()
        };
        let tx = self.tick_tx.clone();
        let channel_id = id.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let tick = Tick {
                    channel_id: channel_id.clone(),
                    generation,
                };
                if tx.send(tick).await.is_err() {
                    break;
                }
            }
        });

        self.pending.remove(id);
        self.timers.insert(
            id.to_string(),
            Timer {
                generation,
                period,
                task,
            },
        );
    }

    fn cancel(&mut self, id: &str) {
        if let Some(timer) = self.timers.remove(id) {
            timer.task.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
    }
}
