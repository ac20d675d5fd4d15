use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::platform;
use crate::channel::{Channel, Registry};
use crate::settings::{GlobalSettings, SettingsSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    /// Built-in channels, used when neither the cache nor the host know better.
    #[serde(default = "default_channels", rename = "channel")]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_socket_port")]
    pub port: u16,
    /// Directory of the key/value settings store.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Player binary name or path.  Invoked once per tick.
    #[serde(default = "default_player")]
    pub player: String,
    /// Relative sound references resolve against this directory.
    #[serde(default = "default_sounds_dir")]
    pub sounds_dir: PathBuf,
}

/// Remote settings host.  Without a URL the daemon runs on cache + defaults
/// and only receives pushes through the socket / HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub sound: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_channel_volume")]
    pub volume: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            http: HttpConfig::default(),
            playback: PlaybackConfig::default(),
            transport: TransportConfig::default(),
            channels: default_channels(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_socket_port(),
            store_dir: default_store_dir(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            player: default_player(),
            sounds_dir: default_sounds_dir(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            settings_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_socket_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_http_enabled() -> bool {
    true
}

fn default_http_port() -> u16 {
    8990
}

fn default_store_dir() -> PathBuf {
    platform::data_dir()
}

fn default_player() -> String {
    "mpv".to_string()
}

fn default_sounds_dir() -> PathBuf {
    platform::data_dir().join("sounds")
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_interval_ms() -> u64 {
    4000
}

fn default_channel_volume() -> f32 {
    0.7
}

fn default_channels() -> Vec<ChannelConfig> {
    [
        ("google-cal", "Google Calendar", "RE.mp3", 5000),
        ("slack", "Slack", "slack.mp3", 4000),
        ("teams", "Microsoft Teams", "teams.mp3", 3500),
        ("gchat", "Google Chat", "gchat.mp3", 4500),
        ("discord", "Discord", "discord.mp3", 3000),
        ("apple-mail", "Apple Mail", "applemail.mp3", 6000),
        ("outlook", "Outlook", "outlook.mp3", 5500),
        ("imessage", "iMessage", "imessage.mp3", 2500),
        ("skype", "Skype", "skype.mp3", 4000),
        ("phone", "Vibrating Phone", "phone.mp3", 2000),
    ]
    .into_iter()
    .map(|(id, name, sound, interval_ms)| ChannelConfig {
        id: id.to_string(),
        name: name.to_string(),
        sound: sound.to_string(),
        interval_ms,
        volume: default_channel_volume(),
    })
    .collect()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Built-in defaults: default globals plus the configured channels.
    pub fn default_snapshot(&self) -> SettingsSnapshot {
        let channels: Vec<Channel> = self
            .channels
            .iter()
            .map(|c| Channel::new(c.id.clone(), c.sound.clone(), c.interval_ms, c.volume).with_name(c.name.clone()))
            .collect();
        SettingsSnapshot {
            globals: GlobalSettings::default(),
            channels: Registry::from(channels),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8990);
        assert_eq!(config.daemon.port, platform::DAEMON_TCP_PORT);
        assert_eq!(config.playback.player, "mpv");
        assert!(config.transport.settings_url.is_none());
        assert_eq!(config.channels.len(), 10);
    }

    #[test]
    fn test_missing_channel_list_uses_builtins() {
        let config: Config = toml::from_str("[http]\nport = 9000\n").unwrap();
        assert_eq!(config.http.port, 9000);
        assert_eq!(config.channels.len(), 10);
        assert_eq!(config.channels[1].id, "slack");
    }

    #[test]
    fn test_channel_tables_override_builtins() {
        let config: Config = toml::from_str(
            r#"
            [transport]
            settings_url = "http://127.0.0.1:8891/settings"

            [[channel]]
            id = "pager"
            sound = "pager.wav"
            interval_ms = 20000
            "#,
        )
        .unwrap();
        assert_eq!(config.transport.settings_url.as_deref(), Some("http://127.0.0.1:8891/settings"));
        let snapshot = config.default_snapshot();
        assert_eq!(snapshot.channels.len(), 1);
        let pager = snapshot.channels.get("pager").unwrap();
        assert_eq!(pager.interval_ms, 10_000, "clamped to the max period");
        assert!((pager.volume - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_default_snapshot_matches_builtin_periods() {
        let snapshot = Config::default().default_snapshot();
        let phone = snapshot.channels.get("phone").unwrap();
        assert_eq!(phone.interval_ms, 2000);
        assert_eq!(phone.sound_ref, "phone.mp3");
        assert_eq!(phone.name, "Vibrating Phone");
        assert!(snapshot.channels.iter().all(|c| !c.enabled));
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.channels, config.channels);
    }
}
