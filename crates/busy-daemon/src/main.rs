mod bus;
mod core;
mod gateway;
mod http;
mod scheduler;
mod socket;
mod state;
mod transport;

use std::sync::Arc;

use busy_proto::config::Config;
use busy_proto::protocol::Event;
use busy_proto::store::FileStore;
use busy_proto::sync::SettingsSynchronizer;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::bus::{BusMessage, NotificationBus};
use crate::core::{CoreHandle, DaemonCore, DaemonEvent};
use crate::gateway::{MpvGateway, PlaybackGateway};

/// A custom tracing layer that forwards log messages to connected clients
struct BroadcastLayer {
    sender: broadcast::Sender<BusMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BusMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        // Only WARN and ERROR reach clients
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();
        let now = chrono::Local::now();
        message.push_str(&format!("{} ", now.format("%H:%M:%S")));
        message.push_str(&format!("[{}] ", level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // no receivers is fine
        let _ = self.sender.send(BusMessage::Event(Event::Log { message }));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Bus first so logging can forward to it
    let bus = NotificationBus::new(256);

    let data_dir = busy_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new().create(true).append(true).open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(log_file).with_ansi(false);
    let broadcast_layer = BroadcastLayer::new(bus.sender());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(broadcast_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,busy_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let transport = transport::from_config(&config.transport)?;
    let remote = match transport.fetch_initial().await {
        Ok(remote) => remote,
        Err(e) => {
            warn!("Settings host unavailable, starting from cache: {:#}", e);
            None
        }
    };

    let store = FileStore::new(config.daemon.store_dir.clone());
    info!("Settings store: {:?}", store.dir());
    let sync = SettingsSynchronizer::load(Box::new(store), config.default_snapshot(), remote.as_ref())?;

    let gateway: Arc<dyn PlaybackGateway> = Arc::new(MpvGateway::new(
        &config.playback.player,
        config.playback.sounds_dir.clone(),
    ));

    let daemon_core = DaemonCore::new(sync, gateway, transport, bus.clone());
    let board = daemon_core.board();

    // Event channel: all external inputs funnel into DaemonCore
    let (event_tx, event_rx) = mpsc::channel::<DaemonEvent>(256);
    let core_handle = CoreHandle::new(event_tx);

    let _socket_handle = socket::start_server(
        config.daemon.bind_address.clone(),
        config.daemon.port,
        board.clone(),
        core_handle.clone(),
        bus.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            board.clone(),
            core_handle.clone(),
        );
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            core_handle.shutdown().await;
        }
    });

    info!("Daemon initialised, running event loop");
    daemon_core.run(event_rx).await?;

    Ok(())
}
