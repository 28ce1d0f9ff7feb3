use clap::Parser;
use log::{error, info};
use server::highscore::Highscore;
use server::network::ConnectionManager;
use std::path::PathBuf;
use std::sync::Arc;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "11337")]
    port: u16,
    /// Highscore file to load at startup and save on shutdown
    #[clap(long, default_value = "highscores.bin")]
    highscore_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let highscore = Highscore::load(&args.highscore_file);
    info!("Highscore table has {} entries", highscore.len());

    let manager = ConnectionManager::new();
    let address = format!("{}:{}", args.host, args.port);

    let listen_handle = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if let Err(e) = manager.listen(&address).await {
                error!("Server failed: {}", e);
            }
        })
    };

    tokio::select! {
        result = listen_handle => {
            if let Err(e) = result {
                error!("Listener task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    if let Err(e) = highscore.save(&args.highscore_file) {
        error!("Failed to save highscores: {}", e);
    }

    Ok(())
}
