use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::BusyError;
use crate::volume::clamp_unit;

pub const MIN_INTERVAL_MS: u64 = 1_000;
pub const MAX_INTERVAL_MS: u64 = 10_000;

/// Clamp a repeat period into `[MIN_INTERVAL_MS, MAX_INTERVAL_MS]`.
/// Fractional input is rounded; NaN maps to the minimum.
pub fn clamp_interval(ms: f64) -> u64 {
    if ms.is_nan() {
        return MIN_INTERVAL_MS;
    }
    ms.round()
        .clamp(MIN_INTERVAL_MS as f64, MAX_INTERVAL_MS as f64) as u64
}

/// One independently schedulable notification source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    /// Display label, informational only.
    #[serde(default)]
    pub name: String,
    pub interval_ms: u64,
    pub volume: f32,
    /// User intent to run this channel.  Whether it actually ticks also
    /// depends on the global sound switch.
    #[serde(default)]
    pub enabled: bool,
    /// Opaque handle resolved by the playback gateway (usually a file name).
    pub sound_ref: String,
}

impl Channel {
    pub fn new(id: impl Into<String>, sound_ref: impl Into<String>, interval_ms: u64, volume: f32) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            interval_ms: clamp_interval(interval_ms as f64),
            volume: clamp_unit(volume),
            enabled: false,
            sound_ref: sound_ref.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn clamp_in_place(&mut self) {
        self.interval_ms = clamp_interval(self.interval_ms as f64);
        self.volume = clamp_unit(self.volume);
    }

    /// Prefix used by flat settings keys: `google-cal` becomes `googleCal`,
    /// giving `googleCalInterval` / `googleCalVolume`.
    pub fn settings_prefix(&self) -> String {
        let mut out = String::with_capacity(self.id.len());
        let mut upper = false;
        for ch in self.id.chars() {
            if ch == '-' || ch == '_' || ch == ' ' {
                upper = !out.is_empty();
                continue;
            }
            if upper {
                out.extend(ch.to_uppercase());
                upper = false;
            } else {
                out.push(ch);
            }
        }
        out
    }

    /// Whether a settings key prefix addresses this channel.  Separators and
    /// case are ignored, so `googleCal` and `googlecal` both match `google-cal`.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        !prefix.is_empty() && normalize_key(&self.id) == normalize_key(prefix)
    }
}

fn normalize_key(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Authoritative, insertion-ordered store of channel configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Channel>", into = "Vec<Channel>")]
pub struct Registry {
    channels: Vec<Channel>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a channel, clamping its numeric fields.
    /// Returns the previous configuration when the id already existed.
    pub fn upsert(&mut self, mut channel: Channel) -> Result<Option<Channel>, BusyError> {
        if channel.id.trim().is_empty() {
            return Err(BusyError::Validation("channel id must not be empty".to_string()));
        }
        channel.clamp_in_place();

        match self.channels.iter_mut().find(|c| c.id == channel.id) {
            Some(existing) => Ok(Some(std::mem::replace(existing, channel))),
            None => {
                self.channels.push(channel);
                Ok(None)
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<&Channel, BusyError> {
        self.channels
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| BusyError::NotFound(id.to_string()))
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Result<&mut Channel, BusyError> {
        self.channels
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| BusyError::NotFound(id.to_string()))
    }

    /// Reset every channel's interval and volume to the given defaults.
    /// `enabled` is left untouched.
    pub fn apply_defaults(&mut self, default_interval: u64, default_app_volume: f32) {
        let interval = clamp_interval(default_interval as f64);
        let volume = clamp_unit(default_app_volume);
        for channel in &mut self.channels {
            channel.interval_ms = interval;
            channel.volume = volume;
        }
    }

    pub fn list(&self) -> &[Channel] {
        &self.channels
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Id of the channel a flat settings key prefix refers to, if any.
    pub fn find_by_prefix(&self, prefix: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|c| c.matches_prefix(prefix))
            .map(|c| c.id.as_str())
    }
}

impl From<Vec<Channel>> for Registry {
    fn from(channels: Vec<Channel>) -> Self {
        let mut registry = Registry::new();
        for channel in channels {
            let id = channel.id.clone();
            if let Err(e) = registry.upsert(channel) {
                warn!("registry: dropping channel {:?}: {}", id, e);
            }
        }
        registry
    }
}

impl From<Registry> for Vec<Channel> {
    fn from(registry: Registry) -> Self {
        registry.channels
    }
}
