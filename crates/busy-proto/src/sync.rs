/// SettingsSynchronizer: the only writer of the settings snapshot.
///
/// Every change, whatever its source, goes through the same commit path:
///
/// ```text
///   clone snapshot → apply fields to the draft (clamped) → persist draft
///                                                        → swap draft in
/// ```
///
/// The draft only becomes the live snapshot after the store accepted it, so
/// in-memory state is never ahead of the durable cache and nobody can observe
/// a half-applied merge.  Callers react to the returned [`MergeOutcome`]
/// (restart timers, notify clients) only after this returns.
use std::fmt;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::{BusyError, MalformedSetting};
use crate::settings::{payload_fields, SettingKey, SettingsSnapshot};
use crate::store::{load_snapshot, save_snapshot, KeyValueStore};

/// Where an update came from.  Only used for logging; all sources merge
/// with the same last-write-wins rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Remote,
    User,
    Startup,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Remote => write!(f, "remote"),
            Source::User => write!(f, "user"),
            Source::Startup => write!(f, "startup"),
        }
    }
}

/// Result of one merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Fields that were understood and applied (changed or not).
    pub recognized: usize,
    /// Fields whose stored value actually changed, in application order.
    pub changed: Vec<SettingKey>,
    /// Fields that were skipped.
    pub rejected: Vec<MalformedSetting>,
}

impl MergeOutcome {
    pub fn is_noop(&self) -> bool {
        self.recognized == 0
    }

    fn record(&mut self, key: SettingKey, changed: bool) {
        self.recognized += 1;
        if changed && !self.changed.contains(&key) {
            self.changed.push(key);
        }
    }

    /// Channels whose repeat period changed.
    pub fn interval_changes(&self) -> impl Iterator<Item = &str> {
        self.changed.iter().filter_map(|k| match k {
            SettingKey::ChannelInterval(id) => Some(id.as_str()),
            _ => None,
        })
    }

    /// `Some(new)` when the global sound switch flipped.
    pub fn sound_enabled_flip(&self, snapshot: &SettingsSnapshot) -> Option<bool> {
        self.changed
            .contains(&SettingKey::SoundEnabled)
            .then_some(snapshot.globals.sound_enabled)
    }
}

pub struct SettingsSynchronizer {
    snapshot: SettingsSnapshot,
    store: Box<dyn KeyValueStore>,
}

impl SettingsSynchronizer {
    /// Build the initial snapshot.  Precedence, highest first: the remote
    /// snapshot, the persisted cache, then `defaults`.  The result is
    /// persisted before it is returned.
    pub fn load(
        store: Box<dyn KeyValueStore>,
        defaults: SettingsSnapshot,
        remote: Option<&Value>,
    ) -> Result<Self, BusyError> {
        let mut snapshot = defaults;

        match load_snapshot(store.as_ref())? {
            Some(cached) => {
                info!("settings: restoring {} cached channel(s)", cached.channels.len());
                overlay_cache(&mut snapshot, cached);
            }
            None => info!("settings: no cache, starting from defaults"),
        }

        if let Some(remote) = remote {
            match payload_fields(remote) {
                Some(fields) => {
                    let outcome = apply_fields(&mut snapshot, fields, Source::Startup);
                    info!("settings: remote snapshot supplied {} field(s)", outcome.recognized);
                }
                None => warn!("settings: ignoring remote snapshot that is not an object"),
            }
        }

        save_snapshot(store.as_ref(), &snapshot)?;
        Ok(Self { snapshot, store })
    }

    pub fn snapshot(&self) -> &SettingsSnapshot {
        &self.snapshot
    }

    /// Partial update pushed by the settings transport.
    pub fn apply_remote_update(&mut self, payload: &Value) -> Result<MergeOutcome, BusyError> {
        match payload_fields(payload) {
            Some(fields) => self.merge(fields, Source::Remote),
            None => {
                warn!("settings: ignoring remote update that is not an object: {}", payload);
                Ok(MergeOutcome::default())
            }
        }
    }

    /// A single field edited by the user.
    pub fn apply_user_edit(&mut self, key: &str, value: Value) -> Result<MergeOutcome, BusyError> {
        let mut fields = Map::new();
        fields.insert(key.to_string(), value);
        self.merge(&fields, Source::User)
    }

    /// Merge flat fields, last-write-wins per field.  A merge with no
    /// recognized field leaves everything untouched, including the store.
    pub fn merge(&mut self, fields: &Map<String, Value>, source: Source) -> Result<MergeOutcome, BusyError> {
        let mut draft = self.snapshot.clone();
        let outcome = apply_fields(&mut draft, fields, source);
        if outcome.is_noop() {
            debug!("settings: {} update had no recognized fields", source);
            return Ok(outcome);
        }
        self.commit(draft)?;
        info!(
            "settings: {} update applied {} field(s), {} changed",
            source,
            outcome.recognized,
            outcome.changed.len()
        );
        Ok(outcome)
    }

    /// Insert or replace a channel.  Fails on an empty id.
    pub fn upsert_channel(&mut self, channel: Channel) -> Result<MergeOutcome, BusyError> {
        let mut draft = self.snapshot.clone();
        let id = channel.id.clone();
        let previous = draft.channels.upsert(channel)?;
        let current = draft.channels.get(&id)?.clone();

        let mut outcome = MergeOutcome::default();
        let (interval_changed, volume_changed) = match &previous {
            Some(prev) => (prev.interval_ms != current.interval_ms, prev.volume != current.volume),
            None => (true, true),
        };
        outcome.record(SettingKey::ChannelInterval(id.clone()), interval_changed);
        outcome.record(SettingKey::ChannelVolume(id.clone()), volume_changed);
        if let Some(prev) = &previous {
            if prev.enabled != current.enabled {
                outcome.record(SettingKey::ChannelEnabled(id), true);
            }
        }

        self.commit(draft)?;
        Ok(outcome)
    }

    /// Record a channel's run intent.  Unchanged intent is not rewritten.
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<MergeOutcome, BusyError> {
        let current = self.snapshot.channels.get(id)?;
        let mut outcome = MergeOutcome::default();
        if current.enabled == enabled {
            return Ok(outcome);
        }

        let mut draft = self.snapshot.clone();
        draft.channels.get_mut(id)?.enabled = enabled;
        outcome.record(SettingKey::ChannelEnabled(id.to_string()), true);
        self.commit(draft)?;
        Ok(outcome)
    }

    /// Reset every channel to the current `defaultInterval` / `defaultAppVolume`.
    pub fn apply_defaults(&mut self) -> Result<MergeOutcome, BusyError> {
        let mut draft = self.snapshot.clone();
        let g = &draft.globals;
        let (interval, volume) = (g.default_interval, g.default_app_volume);
        draft.channels.apply_defaults(interval, volume);

        let mut outcome = MergeOutcome::default();
        for (before, after) in self.snapshot.channels.iter().zip(draft.channels.iter()) {
            outcome.record(
                SettingKey::ChannelInterval(after.id.clone()),
                before.interval_ms != after.interval_ms,
            );
            outcome.record(SettingKey::ChannelVolume(after.id.clone()), before.volume != after.volume);
        }

        self.commit(draft)?;
        info!("settings: defaults applied ({}ms, volume {:.2})", interval, volume);
        Ok(outcome)
    }

    fn commit(&mut self, draft: SettingsSnapshot) -> Result<(), BusyError> {
        save_snapshot(self.store.as_ref(), &draft)?;
        self.snapshot = draft;
        Ok(())
    }
}

fn apply_fields(draft: &mut SettingsSnapshot, fields: &Map<String, Value>, source: Source) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    for (name, value) in fields {
        let key = match SettingKey::parse(name, &draft.channels) {
            Ok(Some(key)) => key,
            Ok(None) => {
                debug!("settings: {} skipping presentation key {}", source, name);
                continue;
            }
            Err(e) => {
                warn!("settings: {} update: {}", source, e);
                outcome.rejected.push(e);
                continue;
            }
        };
        match draft.apply(&key, value, name) {
            Ok(changed) => outcome.record(key, changed),
            Err(e) => {
                warn!("settings: {} update: {}", source, e);
                outcome.rejected.push(e);
            }
        }
    }
    outcome
}

/// The cache is a full snapshot.  Globals are taken wholesale.  Known
/// channels keep their configured sound but take cached interval, volume and
/// intent; channels only the cache knows are added back.
fn overlay_cache(base: &mut SettingsSnapshot, cached: SettingsSnapshot) {
    base.globals = cached.globals;
    for cached_channel in Vec::<Channel>::from(cached.channels) {
        match base.channels.get_mut(&cached_channel.id) {
            Ok(existing) => {
                existing.interval_ms = cached_channel.interval_ms;
                existing.volume = cached_channel.volume;
                existing.enabled = cached_channel.enabled;
            }
            Err(_) => {
                let id = cached_channel.id.clone();
                if let Err(e) = base.channels.upsert(cached_channel) {
                    warn!("settings: dropping cached channel {:?}: {}", id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Registry;
    use crate::error::StoreError;
    use crate::settings::GlobalSettings;
    use crate::store::{MemoryStore, SNAPSHOT_KEY};
    use serde_json::json;

    fn defaults() -> SettingsSnapshot {
        let mut channels = Registry::new();
        channels.upsert(Channel::new("slack", "slack.mp3", 4000, 0.7)).unwrap();
        channels.upsert(Channel::new("google-cal", "RE.mp3", 5000, 0.7)).unwrap();
        SettingsSnapshot {
            globals: GlobalSettings::default(),
            channels,
        }
    }

    fn synchronizer(store: &MemoryStore) -> SettingsSynchronizer {
        SettingsSynchronizer::load(Box::new(store.clone()), defaults(), None).unwrap()
    }

    fn persisted(store: &MemoryStore) -> SettingsSnapshot {
        load_snapshot(store).unwrap().unwrap()
    }

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }
        fn put(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into())
        }
    }

    #[test]
    fn test_load_precedence_remote_over_cache_over_defaults() {
        let store = MemoryStore::new();
        let mut cached = defaults();
        cached.globals.global_volume = 0.2;
        cached.globals.default_interval = 3000;
        cached.channels.get_mut("slack").unwrap().interval_ms = 8000;
        save_snapshot(&store, &cached).unwrap();

        let remote = json!({"globalVolume": 0.9});
        let sync = SettingsSynchronizer::load(Box::new(store.clone()), defaults(), Some(&remote)).unwrap();
        let snap = sync.snapshot();

        assert!((snap.globals.global_volume - 0.9).abs() < 1e-6, "remote wins");
        assert_eq!(snap.globals.default_interval, 3000, "cache beats defaults");
        assert_eq!(snap.channels.get("slack").unwrap().interval_ms, 8000);
        assert_eq!(snap.channels.get("google-cal").unwrap().interval_ms, 5000, "defaults fill the rest");
        assert_eq!(&persisted(&store), snap);
    }

    #[test]
    fn test_load_restores_cache_only_channels() {
        let store = MemoryStore::new();
        let mut cached = defaults();
        cached.channels.upsert(Channel::new("pager", "pager.mp3", 2000, 0.5)).unwrap();
        save_snapshot(&store, &cached).unwrap();

        let sync = synchronizer(&store);
        assert_eq!(sync.snapshot().channels.get("pager").unwrap().sound_ref, "pager.mp3");
    }

    #[test]
    fn test_merge_clamps_channel_interval() {
        let store = MemoryStore::new();
        let mut sync = synchronizer(&store);
        let outcome = sync.apply_remote_update(&json!({"slackInterval": 15000})).unwrap();

        assert_eq!(outcome.changed, vec![SettingKey::ChannelInterval("slack".into())]);
        assert_eq!(sync.snapshot().channels.get("slack").unwrap().interval_ms, 10_000);
        assert_eq!(persisted(&store).channels.get("slack").unwrap().interval_ms, 10_000);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let store = MemoryStore::new();
        let mut sync = synchronizer(&store);
        let update = json!({"globalVolume": 0.4, "googleCalVolume": 0.1, "soundEnabled": false});

        sync.apply_remote_update(&update).unwrap();
        let once = sync.snapshot().clone();
        let second = sync.apply_remote_update(&update).unwrap();

        assert_eq!(sync.snapshot(), &once);
        assert!(second.changed.is_empty());
        assert_eq!(second.recognized, 3);
    }

    #[test]
    fn test_last_write_wins_per_field() {
        let store = MemoryStore::new();
        let mut sync = synchronizer(&store);
        sync.apply_remote_update(&json!({"globalVolume": 0.4, "slackVolume": 0.3})).unwrap();
        sync.apply_user_edit("globalVolume", json!(0.6)).unwrap();

        let snap = sync.snapshot();
        assert!((snap.globals.global_volume - 0.6).abs() < 1e-6);
        assert!((snap.channels.get("slack").unwrap().volume - 0.3).abs() < 1e-6, "untouched field kept");
    }

    #[test]
    fn test_unknown_keys_ignored_without_aborting_merge() {
        let store = MemoryStore::new();
        let mut sync = synchronizer(&store);
        let outcome = sync
            .apply_remote_update(&json!({
                "payload": {
                    "backgroundColor": "#7c3aed",
                    "mystery": 1,
                    "teamsInterval": 3000,
                    "globalVolume": "very",
                    "defaultInterval": {"value": 6000}
                }
            }))
            .unwrap();

        assert_eq!(outcome.recognized, 1);
        assert_eq!(outcome.changed, vec![SettingKey::DefaultInterval]);
        assert_eq!(outcome.rejected.len(), 3);
        assert_eq!(sync.snapshot().globals.default_interval, 6000);
    }

    #[test]
    fn test_zero_recognized_keys_is_noop() {
        let store = MemoryStore::new();
        let mut sync = synchronizer(&store);
        store.put(SNAPSHOT_KEY, "sentinel").unwrap();

        let outcome = sync.apply_remote_update(&json!({"mystery": true})).unwrap();
        assert!(outcome.is_noop());
        assert_eq!(store.get(SNAPSHOT_KEY).unwrap().as_deref(), Some("sentinel"));

        let outcome = sync.apply_remote_update(&json!("not an object")).unwrap();
        assert!(outcome.is_noop());
    }

    #[test]
    fn test_failed_persist_leaves_snapshot_untouched() {
        let store = MemoryStore::new();
        let good = synchronizer(&store);
        let mut sync = SettingsSynchronizer {
            snapshot: good.snapshot().clone(),
            store: Box::new(FailingStore),
        };
        let before = sync.snapshot().clone();

        let err = sync.apply_user_edit("globalVolume", json!(0.1)).unwrap_err();
        assert!(matches!(err, BusyError::Persistence(_)));
        assert_eq!(sync.snapshot(), &before);
    }

    #[test]
    fn test_upsert_channel_reports_changes() {
        let store = MemoryStore::new();
        let mut sync = synchronizer(&store);

        let outcome = sync.upsert_channel(Channel::new("slack", "slack.mp3", 2000, 0.7)).unwrap();
        assert_eq!(outcome.interval_changes().collect::<Vec<_>>(), vec!["slack"]);

        let err = sync.upsert_channel(Channel::new("", "x.mp3", 2000, 0.7)).unwrap_err();
        assert!(matches!(err, BusyError::Validation(_)));
    }

    #[test]
    fn test_set_enabled_persists_intent() {
        let store = MemoryStore::new();
        let mut sync = synchronizer(&store);

        let outcome = sync.set_enabled("slack", true).unwrap();
        assert_eq!(outcome.changed, vec![SettingKey::ChannelEnabled("slack".into())]);
        assert!(persisted(&store).channels.get("slack").unwrap().enabled);

        assert!(sync.set_enabled("slack", true).unwrap().is_noop());
        assert!(matches!(sync.set_enabled("nope", true), Err(BusyError::NotFound(_))));
    }

    #[test]
    fn test_apply_defaults_uses_current_globals() {
        let store = MemoryStore::new();
        let mut sync = synchronizer(&store);
        sync.apply_user_edit("defaultInterval", json!(4000)).unwrap();
        sync.apply_user_edit("defaultAppVolume", json!(0.5)).unwrap();

        let outcome = sync.apply_defaults().unwrap();
        // slack already ran at 4000ms, only google-cal's period moved
        assert_eq!(outcome.interval_changes().collect::<Vec<_>>(), vec!["google-cal"]);
        for ch in sync.snapshot().channels.iter() {
            assert_eq!(ch.interval_ms, 4000);
            assert!((ch.volume - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_sound_enabled_flip_detected() {
        let store = MemoryStore::new();
        let mut sync = synchronizer(&store);
        let outcome = sync.apply_user_edit("soundEnabled", json!(false)).unwrap();
        assert_eq!(outcome.sound_enabled_flip(sync.snapshot()), Some(false));
        let outcome = sync.apply_user_edit("globalVolume", json!(0.1)).unwrap();
        assert_eq!(outcome.sound_enabled_flip(sync.snapshot()), None);
    }
}
