//! Relay service: data listener, pairing dispatch, and the control-plane
//! side jobs (registration keepalive, traffic cap enforcement).

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use freighter_core::limit::TokenBucket;
use freighter_core::tls;
use freighter_core::wire::{
    read_message, write_message, Message, NewRecvStreamResp, NewSendStreamResp,
};

use crate::pairing::PairTable;
use crate::register::RegisterClient;
use crate::traffic::TrafficMeter;

/// Deadline for the first message on a fresh data connection.
const FIRST_MSG_TIMEOUT: Duration = Duration::from_secs(5);

/// Token-bucket burst for the spliced direction.
const RATE_BURST: u64 = 16 * 1024;

/// Floor for the configured bandwidth, in KB/s.
const MIN_RATE_KB: u64 = 50;

/// Floor for a non-zero daily traffic cap, in MB.
const MIN_TRAFFIC_MB: u64 = 128;

pub struct Options {
    pub server_addr: String,
    pub bind_addr: String,
    pub advice_public_ip: String,

    /// Bandwidth offered to transfers, KB/s.
    pub rate_kb: u64,

    /// Daily traffic cap, MB; 0 means unlimited.
    pub max_traffic_mb_per_day: u64,
}

impl Options {
    pub fn check(&mut self) {
        if self.rate_kb < MIN_RATE_KB {
            self.rate_kb = MIN_RATE_KB;
        }
        if self.max_traffic_mb_per_day > 0 && self.max_traffic_mb_per_day < MIN_TRAFFIC_MB {
            self.max_traffic_mb_per_day = MIN_TRAFFIC_MB;
        }
    }
}

type DataStream = tls::ServerTlsStream<TcpStream>;

pub struct Service {
    listener: TcpListener,
    acceptor: tls::TlsAcceptor,
    pairing: Arc<PairTable<DataStream>>,
    meter: Arc<TrafficMeter>,
    register: Arc<RegisterClient>,
}

impl Service {
    pub async fn new(mut options: Options) -> anyhow::Result<Self> {
        options.check();

        let listener = TcpListener::bind(&options.bind_addr).await?;
        let local = listener.local_addr()?;
        info!("freighter-relay listening on {local}");

        let limiter = Arc::new(TokenBucket::new(options.rate_kb * 1024, RATE_BURST));
        let meter = Arc::new(TrafficMeter::new(
            options.max_traffic_mb_per_day * 1024 * 1024,
        ));
        let register = Arc::new(RegisterClient::new(
            options.server_addr,
            local.port(),
            options.advice_public_ip,
        ));

        Ok(Self {
            listener,
            acceptor: tls::acceptor()?,
            pairing: Arc::new(PairTable::new(limiter, meter.clone())),
            meter,
            register,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let register = self.register.clone();
        tokio::spawn(async move {
            register.run().await;
        });

        // cap exceeded: withdraw from the pool, current splices finish;
        // next day: rejoin
        let meter = self.meter.clone();
        let register = self.register.clone();
        tokio::spawn(async move {
            meter
                .run(
                    || {
                        warn!("daily traffic cap exceeded, unregistering from coordinator");
                        register.close();
                    },
                    || {
                        info!("traffic counter restored, re-registering");
                        register.reset();
                    },
                )
                .await;
        });

        let svc = Arc::new(self);
        loop {
            let (conn, peer) = svc.listener.accept().await?;
            debug!("data connection from {peer}");
            let svc = svc.clone();
            tokio::spawn(async move {
                svc.handle_conn(conn).await;
            });
        }
    }

    async fn handle_conn(&self, conn: TcpStream) {
        let mut stream = match self.acceptor.accept(conn).await {
            Ok(s) => s,
            Err(e) => {
                debug!("tls accept failed: {e}");
                return;
            }
        };

        let first = match timeout(FIRST_MSG_TIMEOUT, read_message(&mut stream)).await {
            Ok(Ok(m)) => m,
            _ => return,
        };

        match first {
            Message::NewSendStream(m) => {
                debug!("new send stream [{}]", m.id);
                if let Err((mut stream, error)) = self.pairing.offer(&m.id, stream, true).await {
                    let resp = Message::NewSendStreamResp(NewSendStreamResp { error });
                    let _ = write_message(&mut stream, &resp).await;
                }
            }
            Message::NewRecvStream(m) => {
                debug!("new recv stream [{}]", m.id);
                if let Err((mut stream, error)) = self.pairing.offer(&m.id, stream, false).await {
                    let resp = Message::NewRecvStreamResp(NewRecvStreamResp { error });
                    let _ = write_message(&mut stream, &resp).await;
                }
            }
            Message::Ping => {
                // the coordinator probing our public address
                debug!("answering liveness probe");
                let _ = write_message(&mut stream, &Message::Pong).await;
            }
            other => debug!("unexpected first message: {other:?}"),
        }
    }
}
