mod pairing;
mod register;
mod service;
mod splice;
mod traffic;

use clap::Parser;
use log::error;

use service::{Options, Service};

/// Relay node for freighter transfers.
#[derive(Parser)]
#[command(name = "freighter-relay", version)]
struct Cli {
    /// Coordinator address
    #[arg(short, long, default_value = "127.0.0.1:7777")]
    server_addr: String,

    /// Bind address for data connections
    #[arg(short, long, default_value = "0.0.0.0:7778")]
    bind_addr: String,

    /// Public IP to advertise instead of the one the coordinator sees
    #[arg(short = 'p', long, default_value = "")]
    advice_public_ip: String,

    /// Max bandwidth offered to transfers, in KB/s (min 50)
    #[arg(long, default_value_t = 4096)]
    rate: u64,

    /// Max traffic served per day, in MB; 0 means unlimited (min 128)
    #[arg(long, default_value_t = 0)]
    max_traffic_per_day: u64,

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

    let options = Options {
        server_addr: cli.server_addr,
        bind_addr: cli.bind_addr,
        advice_public_ip: cli.advice_public_ip,
        rate_kb: cli.rate,
        max_traffic_mb_per_day: cli.max_traffic_per_day,
    };

    let svc = match Service::new(options).await {
        Ok(svc) => svc,
        Err(e) => {
            error!("new freighter-relay error: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = svc.run().await {
        error!("freighter-relay exit: {e:#}");
        std::process::exit(1);
    }
}
