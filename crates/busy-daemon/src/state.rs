use std::sync::Arc;

use busy_proto::protocol::DaemonState;
use busy_proto::settings::SettingsSnapshot;
use tokio::sync::RwLock;

/// Read side of the daemon state.  Only `DaemonCore` publishes; the socket
/// and HTTP servers read.
#[derive(Clone, Default)]
pub struct StateBoard {
    state: Arc<RwLock<DaemonState>>,
}

impl StateBoard {
    pub fn new(settings: SettingsSnapshot) -> Self {
        Self {
            state: Arc::new(RwLock::new(DaemonState {
                rev: 1,
                settings,
                playing: Vec::new(),
            })),
        }
    }

    pub async fn get_state(&self) -> DaemonState {
        self.state.read().await.clone()
    }

    /// Replace the published state and bump `rev`.  Returns the new rev.
    pub async fn publish(&self, settings: SettingsSnapshot, playing: Vec<String>) -> u64 {
        let mut state = self.state.write().await;
        state.settings = settings;
        state.playing = playing;
        state.rev += 1;
        state.rev
    }
}
