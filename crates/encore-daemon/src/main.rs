mod mpv;
mod socket;
mod store;

use encore_proto::config::Config;
use encore_sync::{Collaborators, PlaybackService};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Forwards WARN and ERROR lines to connected clients as `Log` broadcasts.
struct BroadcastLayer {
    sender: broadcast::Sender<String>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<String>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }
        // No subscribers is fine
        if self.sender.receiver_count() == 0 {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        event.record(&mut MessageVisitor(&mut message));
        let _ = self.sender.send(message);
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("daemon: cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(windows)]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Log channel first so the broadcast layer can use it
    let (log_tx, _) = broadcast::channel::<String>(100);

    let data_dir = encore_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(log_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,encore_daemon=debug,encore_sync=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());
    if config.session.private {
        info!("daemon: private session, history and stats are off");
    }

    let library = Arc::new(store::LibraryStore::new(
        config.daemon.library_file.clone(),
        config.daemon.history_file.clone(),
    ));
    let connector = Arc::new(mpv::MpvConnector::new(&config.mpv));
    let session = Arc::new(store::LocalSession::new(config.session.private));

    let service = PlaybackService::new(
        Collaborators {
            connector: connector.clone(),
            songs: library.clone(),
            queues: Arc::new(store::QueueStore::new(
                config.daemon.queues_file.clone(),
                library,
            )),
            prefs: Arc::new(store::PointerStore::new(config.daemon.pointer_file.clone())),
            session: session.clone(),
            stats: Arc::new(store::StatsStore::new(config.daemon.stats_file.clone())),
            commands: Arc::new(store::DeclineCommands),
        },
        config.sync.clone(),
    );

    let _socket_handle = socket::start_server(
        config.socket.bind_address.clone(),
        config.socket.port,
        service.clone(),
        log_tx,
    );

    service.connect().await;
    info!("daemon: ready, connection {:?}", service.connection_state());

    shutdown_signal().await;
    info!(
        "daemon: stopping after {:?} without playback activity",
        session.idle_for()
    );
    service.shutdown().await;
    connector.shutdown().await;

    Ok(())
}
