mod recv;
mod send;
mod service;

use std::path::PathBuf;

use clap::Parser;

use service::{Options, Service};

/// Send or receive a file through freighter relays.
#[derive(Parser)]
#[command(name = "freighter", version)]
struct Cli {
    /// Coordinator address
    #[arg(short, long, default_value = "127.0.0.1:7777")]
    server_addr: String,

    /// Transfer ID shared with the peer
    #[arg(short, long, default_value = "")]
    id: String,

    /// File to send
    #[arg(long)]
    send_file: Option<PathBuf>,

    /// Destination path (file, or directory to use the advertised name)
    #[arg(long)]
    recv_file: Option<PathBuf>,

    /// Frame payload size in bytes (1..=65535)
    #[arg(long, default_value_t = 5120)]
    frame_size: usize,

    /// Window capacity: max frames in flight
    #[arg(long, default_value_t = 512)]
    cache_count: u32,

    /// Verbose output
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = if cli.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let options = Options {
        server_addr: cli.server_addr,
        id: cli.id,
        send_file: cli.send_file,
        recv_file: cli.recv_file,
        frame_size: cli.frame_size,
        cache_count: cli.cache_count,
    };

    let svc = match Service::new(options) {
        Ok(svc) => svc,
        Err(e) => {
            eprintln!("freighter: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = svc.run().await {
        eprintln!("freighter: {e:#}");
        std::process::exit(1);
    }
}
