//! Demo client: connects, prints every update the server sends for a while,
//! then closes.

use clap::Parser;
use tokio::time::{sleep_until, Duration, Instant};

use covis_collab::client::{SyncClient, SyncEvent};

#[derive(Parser, Debug)]
#[command(name = "covis-list", version, about = "Print the scene a Covis server sends")]
struct Cli {
    /// Server WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:9734")]
    url: String,

    /// How long to listen before closing, in milliseconds
    #[arg(long, default_value_t = 1000)]
    duration_ms: u64,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut client = SyncClient::new(cli.url.clone());
    let Some(mut events) = client.take_event_rx() else {
        log::error!("Event receiver already taken");
        std::process::exit(1);
    };
    if let Err(e) = client.connect().await {
        log::error!("Could not connect to {}: {e}", cli.url);
        std::process::exit(1);
    }
    if let Err(e) = client.send_ping().await {
        log::warn!("Ping failed: {e}");
    }

    let deadline = Instant::now() + Duration::from_millis(cli.duration_ms);
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => break,
            event = events.recv() => match event {
                Some(SyncEvent::Update(update)) => match serde_json::to_string(&update) {
                    Ok(json) => println!("{json}"),
                    Err(e) => log::warn!("Could not render {} update: {e}", update.kind()),
                },
                Some(SyncEvent::Pong) => log::info!("Server answered ping"),
                Some(SyncEvent::Connected) => log::info!("Connected to {}", cli.url),
                Some(SyncEvent::Disconnected) | None => {
                    log::info!("Server closed the stream");
                    break;
                }
            },
        }
    }

    if let Err(e) = client.close().await {
        log::debug!("Close after disconnect: {e}");
    }
    log::info!("Completed");
}
