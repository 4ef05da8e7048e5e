//! ratefeed CLI
//!
//! - `watch`: follow the live update stream
//! - `serve`: run the development stream server
//! - `config`: generate the default config file
//! - `notifications`: manage the desktop notification permission

use anyhow::Context;
use clap::{Parser, Subcommand};
use ratefeed::config::generate_default_config;
use ratefeed::consumers::{
    AlertConsumer, DesktopNotifier, LocalSettings, MemoryQueryCache, NotificationSurface,
    Permission, RatesConsumer,
};
use ratefeed::devserver::{self, spawn_rate_publisher, StreamHub};
use ratefeed::realtime::{ConnectionEvent, EventKind, EventPayload, Handler, RealtimeClient};
use ratefeed::{Config, LoggingConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "ratefeed")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Live exchange-rate updates with automatic reconnect")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Follow the update stream until Ctrl+C
    Watch {
        /// API root, overriding the config file
        #[arg(long)]
        api_base: Option<String>,
        /// Do not show desktop notifications
        #[arg(long)]
        no_notifications: bool,
    },

    /// Run the development stream server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Seconds between synthetic rate updates
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage the desktop notification permission
    Notifications {
        #[command(subcommand)]
        action: NotificationAction,
    },
}

#[derive(Subcommand)]
pub enum NotificationAction {
    /// Allow desktop notifications
    Allow,
    /// Block desktop notifications
    Deny,
    /// Show the current permission
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_logging(&config.logging);

    match cli.command {
        Commands::Watch {
            api_base,
            no_notifications,
        } => {
            let mut config = config;
            if let Some(api_base) = api_base {
                config.stream.api_base = api_base;
            }
            if no_notifications {
                config.notifications.enabled = false;
            }
            watch(config).await
        }
        Commands::Serve { port, interval } => {
            let mut server = config.server;
            if let Some(port) = port {
                server.port = port;
            }
            if let Some(interval) = interval {
                server.publish_interval_secs = interval;
            }

            let hub = Arc::new(StreamHub::default());
            let publisher = spawn_rate_publisher(
                Arc::clone(&hub),
                Duration::from_secs(server.publish_interval_secs.max(1)),
            );
            let result = devserver::serve(hub, &server).await;
            publisher.abort();
            result.context("Stream server failed")
        }
        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("Failed to write {:?}", path))?;
                    println!("Config written to {:?}", path);
                }
                None => print!("{}", content),
            }
            Ok(())
        }
        Commands::Notifications { action } => {
            let settings = open_settings(config.notifications.settings_path.as_deref())?;
            let notifier = DesktopNotifier::new(Arc::new(settings));
            let permission = match action {
                NotificationAction::Allow => notifier.set_permission(Permission::Granted),
                NotificationAction::Deny => notifier.set_permission(Permission::Denied),
                NotificationAction::Status => notifier.permission(),
            };
            println!("Desktop notifications: {}", permission);
            Ok(())
        }
    }
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("ratefeed={},tower_http=info", logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn open_settings(path: Option<&str>) -> anyhow::Result<LocalSettings> {
    let settings = match path {
        Some(path) => LocalSettings::open(Path::new(path)),
        None => LocalSettings::open_default(),
    };
    settings.context("Failed to open local settings")
}

async fn watch(config: Config) -> anyhow::Result<()> {
    let settings = Arc::new(open_settings(config.notifications.settings_path.as_deref())?);
    if !settings.get().realtime_enabled {
        tracing::warn!(
            path = ?settings.path(),
            "Real-time updates are disabled in local settings"
        );
        return Ok(());
    }

    let client = Arc::new(
        RealtimeClient::from_config(&config).context("Failed to create stream client")?,
    );

    let cache = Arc::new(MemoryQueryCache::new());
    let notifier = Arc::new(DesktopNotifier::new(Arc::clone(&settings)));
    if config.notifications.enabled {
        let permission = notifier.request_permission();
        tracing::info!(%permission, "Desktop notifications");
    }

    let rates = RatesConsumer::new(cache.clone());
    rates.attach(&client);
    let alerts = config
        .notifications
        .enabled
        .then(|| AlertConsumer::new(cache.clone(), notifier.clone()));
    if let Some(alerts) = &alerts {
        alerts.attach(&client);
    }

    let printer = Handler::new("print", |payload: &EventPayload| {
        match payload {
            EventPayload::Connected(c) => println!("connected       client_id={}", c.client_id),
            EventPayload::RatesUpdated(r) => println!(
                "rates_updated   {} rates from {} at {}",
                r.count, r.source, r.timestamp
            ),
            EventPayload::AlertTriggered(a) => println!(
                "alert_triggered #{} {} {} (now {})",
                a.alert_id,
                a.currency_pair,
                String::from(a.condition.clone()),
                a.current_rate
            ),
            EventPayload::Other(value) => println!("other           {}", value),
        }
        Ok(())
    });
    for kind in [
        EventKind::Connected,
        EventKind::RatesUpdated,
        EventKind::AlertTriggered,
    ] {
        client.on(kind, &printer);
    }

    let mut events = client.events();
    let status_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::StateChanged(state)) => eprintln!("[{}]", state),
                Ok(ConnectionEvent::Disconnected {
                    error, retry_in, ..
                }) => eprintln!(
                    "[disconnected: {}; retrying in {:.1}s, press Enter to retry now]",
                    error,
                    retry_in.as_secs_f64()
                ),
                Ok(ConnectionEvent::Connected) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let reconnect_client = Arc::clone(&client);
    let stdin_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            reconnect_client.reconnect().await;
        }
    });

    client.enable().await;
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    client.disable().await;
    stdin_task.abort();
    status_task.abort();
    tracing::info!(
        invalidations = cache.invalidations().len(),
        "Stopped watching"
    );
    Ok(())
}
