mod matcher;
mod registry;
mod service;

use clap::Parser;
use log::error;

use service::Service;

/// Rendezvous coordinator for freighter transfers.
#[derive(Parser)]
#[command(name = "freighter-hub", version)]
struct Cli {
    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0:7777")]
    bind_addr: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_default_env()
        .filter_level(cli.log_level.parse().unwrap_or(log::LevelFilter::Info))
        .init();

    let svc = match Service::new(&cli.bind_addr).await {
        Ok(svc) => svc,
        Err(e) => {
            error!("new freighter-hub error: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = svc.run().await {
        error!("freighter-hub exit: {e:#}");
        std::process::exit(1);
    }
}
