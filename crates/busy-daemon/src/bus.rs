use busy_proto::protocol::Event;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone)]
pub enum BusMessage {
    /// An event to forward verbatim to every client.
    Event(Event),
    /// The published `DaemonState` changed; clients should re-read it.
    StateUpdated,
}

/// Fan-out of status events to every connected observer.  Sending never
/// blocks and never fails: with no subscribers the event is simply dropped.
#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<BusMessage>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<BusMessage> {
        self.tx.clone()
    }

    pub fn emit(&self, event: Event) {
        trace!("bus: {:?}", event);
        let _ = self.tx.send(BusMessage::Event(event));
    }

    pub fn sound_status(&self, app_id: &str, playing: bool) {
        self.emit(Event::SoundStatus {
            app_id: app_id.to_string(),
            playing,
        });
    }

    pub fn all_stopped(&self) {
        self.emit(Event::AllStopped);
    }

    pub fn settings_changed(&self, keys: Vec<String>) {
        self.emit(Event::SettingsChanged { keys });
    }

    pub fn state_updated(&self) {
        let _ = self.tx.send(BusMessage::StateUpdated);
    }
}
