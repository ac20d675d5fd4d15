use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::settings::SettingsSnapshot;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.
pub const PROTOCOL_VERSION: u32 = 1;

/// Requests sent by clients (UI, remote host) to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    /// Configure a channel (created if unknown) and start it.
    PlaySound {
        #[serde(rename = "appId")]
        app_id: String,
        #[serde(rename = "soundFile", default, skip_serializing_if = "Option::is_none")]
        sound_file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume: Option<f32>,
    },
    StopSound {
        #[serde(rename = "appId")]
        app_id: String,
    },
    /// Flip a channel's run intent.
    ToggleSound {
        #[serde(rename = "appId")]
        app_id: String,
    },
    StopAll,
    StartAll,
    /// One-shot playback that bypasses the scheduler.
    TestSound {
        #[serde(rename = "soundFile")]
        sound_file: String,
        #[serde(default = "full_volume")]
        volume: f32,
    },
    UpdateInterval {
        #[serde(rename = "appId")]
        app_id: String,
        interval: f64,
    },
    UpdateVolume {
        #[serde(rename = "appId")]
        app_id: String,
        volume: f32,
    },
    /// A single field edited by the user, e.g. `globalVolume`.
    SetSetting { key: String, value: Value },
    /// Partial settings pushed by the host.
    SettingsUpdate { payload: Value },
    /// Reset every channel to `defaultInterval` / `defaultAppVolume`.
    ApplyDefaults,
    GetState,
}

fn full_volume() -> f32 {
    1.0
}

/// Messages sent from the daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Sent immediately on connect: protocol version + full state.
    Hello {
        protocol_version: u32,
        state: DaemonState,
    },
    State {
        data: DaemonState,
    },
    /// A channel was enabled or disabled.
    SoundStatus {
        #[serde(rename = "appId")]
        app_id: String,
        playing: bool,
    },
    AllStopped,
    /// Settings fields that changed in the last accepted merge.
    SettingsChanged {
        keys: Vec<String>,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Full observable state.  `rev` increments on every published change so
/// clients can detect missed updates.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DaemonState {
    #[serde(default)]
    pub rev: u64,
    pub settings: SettingsSnapshot,
    /// Ids of channels with a live timer, in registry order.
    #[serde(default)]
    pub playing: Vec<String>,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Event(Event),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Decode one frame from the front of `data`, returning the message and
    /// the number of bytes consumed.
    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
