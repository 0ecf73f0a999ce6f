use clap::Parser;
use log::info;

use covis_collab::server::{ServerConfig, SyncServer};
use covis_collab::session::BroadcastOrdering;

/// Covis scene synchronization server.
#[derive(Parser, Debug)]
#[command(name = "covis-server", version, about = "Covis scene synchronization server")]
struct Cli {
    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value_t = 9734)]
    port: u16,

    /// Whether broadcasts are serialized with store writes (relaxed|serialized)
    #[arg(long, default_value = "serialized")]
    ordering: BroadcastOrdering,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.bind, self.port),
            ordering: self.ordering,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    info!("Starting Covis server...");

    let mut server = SyncServer::new(cli.server_config());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    if let Err(e) = server.run_until(shutdown).await {
        log::error!("Server error: {e}");
        std::process::exit(1);
    }
    info!("Server shut down");
}
