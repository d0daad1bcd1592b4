use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use beacon_boundary::{BoundaryView, ResilienceBoundary};
use beacon_common::config::{AppConfig, TransportMode};
use beacon_common::db;
use beacon_connection::WsConnector;
use beacon_notifier::{
    InboxPanel, NotificationCenter, NotificationTransport, PersistentTransport,
    PgNotificationStore, SimulatedTransport,
};

const HELP: &str = "commands: test | read <id> | read-all | clear <id> | clear-all | retry | quit";

enum Command {
    Test,
    Read(String),
    ReadAll,
    Clear(String),
    ClearAll,
    Retry,
    Quit,
    Unknown,
}

fn parse_command(line: &str) -> Command {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("test"), None) => Command::Test,
        (Some("read"), Some(id)) => Command::Read(id.to_string()),
        (Some("read-all"), None) => Command::ReadAll,
        (Some("clear"), Some(id)) => Command::Clear(id.to_string()),
        (Some("clear-all"), None) => Command::ClearAll,
        (Some("retry"), None) => Command::Retry,
        (Some("quit" | "exit"), None) => Command::Quit,
        _ => Command::Unknown,
    }
}

async fn build_transport(config: &AppConfig) -> anyhow::Result<Arc<dyn NotificationTransport>> {
    match config.transport_mode {
        TransportMode::Simulated => Ok(Arc::new(SimulatedTransport::new(
            Arc::new(WsConnector::new()),
            config.ws_endpoint.clone(),
            config.reconnect,
            config.simulation.clone(),
        ))),
        TransportMode::Persistent => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the persistent transport")?;
            let pool = db::create_pool(url, config.db_max_connections).await?;
            db::migrate(&pool).await?;
            Ok(Arc::new(PersistentTransport::new(
                Arc::new(PgNotificationStore::new(pool)),
                config.reconnect,
            )))
        }
    }
}

fn draw(boundary: &ResilienceBoundary<InboxPanel>, last: &mut String) {
    let frame = match boundary.render() {
        BoundaryView::Loading => "Loading notifications...\n".to_string(),
        BoundaryView::Content(view) => view.to_string(),
        BoundaryView::Fallback {
            message,
            auto_retry_pending,
            ..
        } => {
            let hint = if auto_retry_pending {
                "retrying automatically"
            } else {
                "type 'retry' to try again"
            };
            format!("{} ({})\n", message, hint)
        }
    };

    if *last != frame {
        print!("{}", frame);
        *last = frame;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "beacon_notifier=info,beacon_connection=info,beacon_boundary=info".into()
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    // Component panics caught by the boundary go to the log, not the terminal.
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, "Panic");
    }));

    let config = AppConfig::from_env()?;
    let user_id = config
        .user_id
        .clone()
        .context("BEACON_USER_ID must be set")?;

    tracing::info!(user_id = %user_id, mode = ?config.transport_mode, "Beacon notifier starting...");

    let transport = build_transport(&config).await?;
    let center = Arc::new(NotificationCenter::new(transport));
    center.connect(&user_id).await;

    let boundary = {
        let center = center.clone();
        ResilienceBoundary::new(move || InboxPanel::new(center.clone()), config.restart)
    };

    println!("{}", HELP);
    let mut last_frame = String::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tick.tick() => draw(&boundary, &mut last_frame),
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_command(&line) {
                    Command::Test => {
                        let n = center.trigger_test_notification().await;
                        tracing::info!(id = %n.id, "Test notification sent");
                    }
                    Command::Read(id) => center.mark_as_read(&id).await,
                    Command::ReadAll => center.mark_all_as_read().await,
                    Command::Clear(id) => center.clear_notification(&id).await,
                    Command::ClearAll => center.clear_all_notifications().await,
                    Command::Retry => {
                        boundary.reset();
                        if !center.connection_status() {
                            center.reconnect().await;
                        }
                    }
                    Command::Quit => break,
                    Command::Unknown => println!("{}", HELP),
                }
                draw(&boundary, &mut last_frame);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal, stopping gracefully...");
                break;
            }
        }
    }

    boundary.unmount();
    center.disconnect().await;
    tracing::info!("Beacon notifier stopped.");
    Ok(())
}
