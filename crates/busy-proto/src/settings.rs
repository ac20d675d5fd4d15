//! Settings model: global settings, the full snapshot, and the flat key
//! scheme used by the host (`globalVolume`, `slackInterval`, ...).
//!
//! Everything here is permissive: numbers are clamped rather than rejected,
//! numeric strings are accepted, and a host setting object `{"value": ..}`
//! is unwrapped to its value.  A field that still cannot be interpreted is
//! reported as [`MalformedSetting`] so the caller can log and skip it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::channel::{clamp_interval, Channel, Registry};
use crate::error::MalformedSetting;
use crate::volume::clamp_unit;

pub const GLOBAL_VOLUME: &str = "globalVolume";
pub const SOUND_ENABLED: &str = "soundEnabled";
pub const DEFAULT_INTERVAL: &str = "defaultInterval";
pub const DEFAULT_APP_VOLUME: &str = "defaultAppVolume";
pub const AUTO_START: &str = "autoStart";

const INTERVAL_SUFFIX: &str = "Interval";
const VOLUME_SUFFIX: &str = "Volume";
const ENABLED_SUFFIX: &str = "Enabled";

/// Keys the host pushes for its own UI.  They are not ours to apply but they
/// are expected, so they are skipped without a warning.
pub const PRESENTATION_KEYS: &[&str] = &["backgroundColor", "visualFeedback", "panelAnimationSpeed"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    pub global_volume: f32,
    /// Hard kill-switch: while false no channel produces playback.
    pub sound_enabled: bool,
    pub default_interval: u64,
    pub default_app_volume: f32,
    /// Run every enabled channel once settings have been loaded at startup.
    pub auto_start: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            global_volume: 0.7,
            sound_enabled: true,
            default_interval: 4000,
            default_app_volume: 0.7,
            auto_start: false,
        }
    }
}

/// The complete merged configuration.  This is the unit that gets persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    #[serde(default)]
    pub globals: GlobalSettings,
    #[serde(default)]
    pub channels: Registry,
}

/// A recognized settings field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SettingKey {
    GlobalVolume,
    SoundEnabled,
    DefaultInterval,
    DefaultAppVolume,
    AutoStart,
    ChannelInterval(String),
    ChannelVolume(String),
    /// Channel run intent.  Never parsed from a payload; produced by direct
    /// enable/disable requests so the change can be reported like the others.
    ChannelEnabled(String),
}

impl SettingKey {
    /// Classify a flat key.  `Ok(None)` means the key belongs to the host UI
    /// and should be skipped quietly.
    pub fn parse(key: &str, registry: &Registry) -> Result<Option<Self>, MalformedSetting> {
        let global = match key {
            GLOBAL_VOLUME => Some(SettingKey::GlobalVolume),
            SOUND_ENABLED => Some(SettingKey::SoundEnabled),
            DEFAULT_INTERVAL => Some(SettingKey::DefaultInterval),
            DEFAULT_APP_VOLUME => Some(SettingKey::DefaultAppVolume),
            AUTO_START => Some(SettingKey::AutoStart),
            _ => None,
        };
        if let Some(global) = global {
            return Ok(Some(global));
        }
        if PRESENTATION_KEYS.contains(&key) {
            return Ok(None);
        }

        let (prefix, is_interval) = if let Some(p) = key.strip_suffix(INTERVAL_SUFFIX) {
            (p, true)
        } else if let Some(p) = key.strip_suffix(VOLUME_SUFFIX) {
            (p, false)
        } else {
            return Err(MalformedSetting::UnknownKey(key.to_string()));
        };
        if prefix.is_empty() {
            return Err(MalformedSetting::UnknownKey(key.to_string()));
        }

        let id = registry
            .find_by_prefix(prefix)
            .ok_or_else(|| MalformedSetting::UnknownChannel {
                key: key.to_string(),
                channel: prefix.to_string(),
            })?
            .to_string();
        Ok(Some(if is_interval {
            SettingKey::ChannelInterval(id)
        } else {
            SettingKey::ChannelVolume(id)
        }))
    }

    /// The flat key this field is published under.
    pub fn name(&self, registry: &Registry) -> String {
        let channel_key = |id: &str, suffix: &str| {
            let prefix = registry
                .get(id)
                .map(Channel::settings_prefix)
                .unwrap_or_else(|_| id.to_string());
            format!("{}{}", prefix, suffix)
        };
        match self {
            SettingKey::GlobalVolume => GLOBAL_VOLUME.to_string(),
            SettingKey::SoundEnabled => SOUND_ENABLED.to_string(),
            SettingKey::DefaultInterval => DEFAULT_INTERVAL.to_string(),
            SettingKey::DefaultAppVolume => DEFAULT_APP_VOLUME.to_string(),
            SettingKey::AutoStart => AUTO_START.to_string(),
            SettingKey::ChannelInterval(id) => channel_key(id, INTERVAL_SUFFIX),
            SettingKey::ChannelVolume(id) => channel_key(id, VOLUME_SUFFIX),
            SettingKey::ChannelEnabled(id) => channel_key(id, ENABLED_SUFFIX),
        }
    }
}

impl SettingsSnapshot {
    /// Apply one field, clamping numeric input.  Returns whether the stored
    /// value changed.
    pub fn apply(&mut self, key: &SettingKey, raw: &Value, name: &str) -> Result<bool, MalformedSetting> {
        let value = setting_value(raw);
        let g = &mut self.globals;
        let changed = match key {
            SettingKey::GlobalVolume => replace(&mut g.global_volume, clamp_unit(number(name, value)? as f32)),
            SettingKey::SoundEnabled => replace(&mut g.sound_enabled, boolean(name, value)?),
            SettingKey::DefaultInterval => replace(&mut g.default_interval, clamp_interval(number(name, value)?)),
            SettingKey::DefaultAppVolume => {
                replace(&mut g.default_app_volume, clamp_unit(number(name, value)? as f32))
            }
            SettingKey::AutoStart => replace(&mut g.auto_start, boolean(name, value)?),
            SettingKey::ChannelInterval(id) => {
                let interval = clamp_interval(number(name, value)?);
                replace(&mut self.channel_mut(name, id)?.interval_ms, interval)
            }
            SettingKey::ChannelVolume(id) => {
                let volume = clamp_unit(number(name, value)? as f32);
                replace(&mut self.channel_mut(name, id)?.volume, volume)
            }
            SettingKey::ChannelEnabled(id) => {
                let enabled = boolean(name, value)?;
                replace(&mut self.channel_mut(name, id)?.enabled, enabled)
            }
        };
        Ok(changed)
    }

    /// Current value of a field as it would be published.
    pub fn lookup(&self, key: &SettingKey) -> Option<Value> {
        let g = &self.globals;
        let value = match key {
            SettingKey::GlobalVolume => Value::from(g.global_volume),
            SettingKey::SoundEnabled => Value::from(g.sound_enabled),
            SettingKey::DefaultInterval => Value::from(g.default_interval),
            SettingKey::DefaultAppVolume => Value::from(g.default_app_volume),
            SettingKey::AutoStart => Value::from(g.auto_start),
            SettingKey::ChannelInterval(id) => Value::from(self.channels.get(id).ok()?.interval_ms),
            SettingKey::ChannelVolume(id) => Value::from(self.channels.get(id).ok()?.volume),
            SettingKey::ChannelEnabled(id) => Value::from(self.channels.get(id).ok()?.enabled),
        };
        Some(value)
    }

    fn channel_mut(&mut self, name: &str, id: &str) -> Result<&mut Channel, MalformedSetting> {
        self.channels
            .get_mut(id)
            .map_err(|_| MalformedSetting::UnknownChannel {
                key: name.to_string(),
                channel: id.to_string(),
            })
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

/// Unwrap a host setting object (`{"value": 0.5, "label": ..}`) to its value.
fn setting_value(raw: &Value) -> &Value {
    match raw {
        Value::Object(obj) => obj.get("value").unwrap_or(raw),
        _ => raw,
    }
}

fn number(key: &str, value: &Value) -> Result<f64, MalformedSetting> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n.is_finite() => Ok(n),
        _ => Err(MalformedSetting::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a number, got {}", value),
        }),
    }
}

fn boolean(key: &str, value: &Value) -> Result<bool, MalformedSetting> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        _ => Err(MalformedSetting::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a boolean, got {}", value),
        }),
    }
}

/// Locate the flat key/value map inside a host payload.  Hosts wrap it in
/// `payload` or `settings`; anything that is not an object is rejected.
pub fn payload_fields(payload: &Value) -> Option<&Map<String, Value>> {
    let obj = payload.as_object()?;
    for wrapper in ["payload", "settings"] {
        if let Some(inner) = obj.get(wrapper).and_then(Value::as_object) {
            return Some(inner);
        }
    }
    Some(obj)
}
