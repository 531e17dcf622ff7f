//! Control-plane client: registration and keepalive with the coordinator.
//!
//! Runs forever: register, ping every ten seconds, and on any I/O error
//! reconnect with a fixed backoff, re-registering each attempt. The
//! traffic meter closes the client when the daily cap is exceeded (the
//! coordinator then stops advertising this relay) and resets it on the
//! next day's restore.

use std::time::Duration;

use log::{info, warn};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use freighter_core::tls::{self, ClientTlsStream, TlsConnector};
use freighter_core::wire::{read_message, write_message, Message, RegisterRelay};
use freighter_core::{Error, Result};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

type ControlStream = ClientTlsStream<TcpStream>;

/// Registers this relay with the coordinator and keeps the control
/// connection alive. Externally closable and resettable.
pub struct RegisterClient {
    server_addr: String,
    bind_port: u16,
    public_ip: String,
    connector: TlsConnector,
    closed_tx: watch::Sender<bool>,
}

impl RegisterClient {
    pub fn new(server_addr: String, bind_port: u16, public_ip: String) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            server_addr,
            bind_port,
            public_ip,
            connector: tls::connector(),
            closed_tx,
        }
    }

    /// Stops the keepalive and prevents reconnects until `reset`.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    /// Re-enables registration after a `close`.
    pub fn reset(&self) {
        let _ = self.closed_tx.send(false);
    }

    /// Runs the register/keepalive/reconnect loop until the process
    /// exits.
    pub async fn run(&self) {
        let mut closed = self.closed_tx.subscribe();
        loop {
            if *closed.borrow() {
                if closed.changed().await.is_err() {
                    return;
                }
                continue;
            }

            match self.register().await {
                Ok(conn) => {
                    info!("registered to coordinator [{}]", self.server_addr);
                    self.keepalive(conn, &mut closed).await;
                    if *closed.borrow() {
                        info!("relay control connection closed");
                        continue;
                    }
                    warn!("coordinator control connection lost");
                }
                Err(e) => warn!("register to coordinator error: {e}"),
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                _ = closed.changed() => {}
            }
        }
    }

    /// One registration attempt; returns the live control connection.
    async fn register(&self) -> Result<ControlStream> {
        let mut conn = tls::connect(&self.connector, &self.server_addr).await?;

        let register = RegisterRelay {
            version: env!("CARGO_PKG_VERSION").to_string(),
            bind_port: self.bind_port,
            public_ip: self.public_ip.clone(),
        };
        write_message(&mut conn, &Message::RegisterRelay(register)).await?;

        match timeout(REGISTER_TIMEOUT, read_message(&mut conn)).await {
            Ok(Ok(Message::RegisterRelayResp(resp))) => {
                if resp.error.is_empty() {
                    Ok(conn)
                } else {
                    Err(Error::Rendezvous(resp.error))
                }
            }
            Ok(Ok(_)) => Err(Error::protocol("expected register-relay-response")),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::protocol("registration response timed out")),
        }
    }

    /// Ping/pong until an I/O error or an external close.
    async fn keepalive(&self, mut conn: ControlStream, closed: &mut watch::Receiver<bool>) {
        loop {
            if write_message(&mut conn, &Message::Ping).await.is_err() {
                return;
            }

            let resp = tokio::select! {
                r = read_message(&mut conn) => r,
                _ = closed.wait_for(|c| *c) => return,
            };
            match resp {
                Ok(Message::Pong) => {}
                _ => return,
            }

            tokio::select! {
                _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {}
                _ = closed.wait_for(|c| *c) => return,
            }
        }
    }
}
