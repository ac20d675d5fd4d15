/// Playback gateway: the boundary between the scheduler and whatever actually
/// produces sound.
///
/// The scheduler only ever calls [`dispatch`], which spawns the gateway's
/// future so a slow player never delays other channels or the core loop.
/// Failures come back as [`PlaybackError`] values and end up in the log.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use busy_proto::error::PlaybackError;
use busy_proto::platform;
use futures_util::future::{BoxFuture, FutureExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

pub trait PlaybackGateway: Send + Sync + 'static {
    /// Start `sound_ref` from the beginning at `volume` (0..1).  A sound that
    /// is still playing from an earlier request is restarted.
    fn play(&self, sound_ref: &str, volume: f32) -> BoxFuture<'static, Result<(), PlaybackError>>;
}

/// Fire-and-forget playback.  `context` prefixes the log line.
pub fn dispatch(gateway: &Arc<dyn PlaybackGateway>, sound_ref: &str, volume: f32, context: String) {
    let request = gateway.play(sound_ref, volume);
    tokio::spawn(async move {
        match request.await {
            Ok(()) => debug!("{}: playback started", context),
            Err(e) => warn!("{}: playback failed: {}", context, e),
        }
    });
}

/// Plays each request through a short-lived player process (mpv by default).
#[derive(Clone)]
pub struct MpvGateway {
    inner: Arc<MpvInner>,
}

struct MpvInner {
    player: String,
    player_path: Option<PathBuf>,
    sounds_dir: PathBuf,
    /// Last player process per sound, so a new tick can restart it.
    running: Mutex<HashMap<String, Child>>,
}

impl MpvGateway {
    pub fn new(player: &str, sounds_dir: PathBuf) -> Self {
        let player_path = platform::find_player_binary(player);
        match &player_path {
            Some(p) => debug!("gateway: using player {:?}", p),
            None => warn!("gateway: player '{}' not found, playback will fail", player),
        }
        Self {
            inner: Arc::new(MpvInner {
                player: player.to_string(),
                player_path,
                sounds_dir,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl PlaybackGateway for MpvGateway {
    fn play(&self, sound_ref: &str, volume: f32) -> BoxFuture<'static, Result<(), PlaybackError>> {
        let inner = Arc::clone(&self.inner);
        let sound_ref = sound_ref.to_string();
        async move { inner.play(&sound_ref, volume) }.boxed()
    }
}

impl MpvInner {
    fn resolve(&self, sound_ref: &str) -> Option<PathBuf> {
        let path = Path::new(sound_ref);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.sounds_dir.join(path)
        };
        path.exists().then_some(path)
    }

    fn play(&self, sound_ref: &str, volume: f32) -> Result<(), PlaybackError> {
        let path = self
            .resolve(sound_ref)
            .ok_or_else(|| PlaybackError::MissingAsset(sound_ref.to_string()))?;
        let player = self
            .player_path
            .as_ref()
            .ok_or_else(|| PlaybackError::PlayerNotFound(self.player.clone()))?;
        let volume_pct = (volume * 100.0).clamp(0.0, 100.0).round() as i64;

        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(mut previous) = running.remove(sound_ref) {
            if matches!(previous.try_wait(), Ok(None)) {
                debug!("gateway: restarting {}", sound_ref);
                let _ = previous.start_kill();
            }
        }

        let child = Command::new(player)
            .arg("--no-video")
            .arg("--really-quiet")
            .arg(format!("--volume={}", volume_pct))
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        running.insert(sound_ref.to_string(), child);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    pub struct PlayCall {
        pub sound_ref: String,
        pub volume: f32,
        pub at: Instant,
    }

    /// Records every play request.  Sounds listed in `failing` report a
    /// missing asset.
    #[derive(Clone, Default)]
    pub struct RecordingGateway {
        calls: Arc<Mutex<Vec<PlayCall>>>,
        failing: Arc<Mutex<HashSet<String>>>,
    }

    impl RecordingGateway {
        pub fn calls(&self) -> Vec<PlayCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_for(&self, sound_ref: &str) -> Vec<PlayCall> {
            self.calls().into_iter().filter(|c| c.sound_ref == sound_ref).collect()
        }

        pub fn fail(&self, sound_ref: &str) {
            self.failing.lock().unwrap().insert(sound_ref.to_string());
        }
    }

    impl PlaybackGateway for RecordingGateway {
        fn play(&self, sound_ref: &str, volume: f32) -> BoxFuture<'static, Result<(), PlaybackError>> {
            self.calls.lock().unwrap().push(PlayCall {
                sound_ref: sound_ref.to_string(),
                volume,
                at: Instant::now(),
            });
            let result = if self.failing.lock().unwrap().contains(sound_ref) {
                Err(PlaybackError::MissingAsset(sound_ref.to_string()))
            } else {
                Ok(())
            };
            futures_util::future::ready(result).boxed()
        }
    }
}
