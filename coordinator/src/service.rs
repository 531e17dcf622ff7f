//! Coordinator service: TLS accept loop and control-message dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use freighter_core::tls::{self, TlsConnector};
use freighter_core::wire::{
    read_message, write_message, Message, ReceiveFile, ReceiveFileResp, RegisterRelay,
    RegisterRelayResp, SendFile, SendFileResp,
};
use freighter_core::Error;

use crate::matcher::{Matcher, RecvClaim, SendOffer};
use crate::registry::Registry;

/// How long a sender may wait for its receiver.
const MATCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Deadline for the first message on a fresh connection.
const FIRST_MSG_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the relay dial-back liveness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A silent relay control connection is dead after this long.
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Service {
    listener: TcpListener,
    acceptor: tls::TlsAcceptor,
    connector: TlsConnector,
    matcher: Matcher,
    registry: Registry,
}

impl Service {
    pub async fn new(bind_addr: &str) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!("freighter-hub listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            acceptor: tls::acceptor()?,
            connector: tls::connector(),
            matcher: Matcher::new(),
            registry: Registry::new(),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let svc = Arc::new(self);
        loop {
            let (conn, peer) = svc.listener.accept().await?;
            let svc = svc.clone();
            tokio::spawn(async move {
                svc.handle_conn(conn, peer).await;
            });
        }
    }

    async fn handle_conn(&self, conn: TcpStream, peer: SocketAddr) {
        let mut stream = match self.acceptor.accept(conn).await {
            Ok(s) => s,
            Err(e) => {
                debug!("[{peer}] tls accept failed: {e}");
                return;
            }
        };

        let first = match timeout(FIRST_MSG_TIMEOUT, read_message(&mut stream)).await {
            Ok(Ok(m)) => m,
            _ => return,
        };

        match first {
            Message::RegisterRelay(m) => self.handle_register(&mut stream, m, peer).await,
            Message::SendFile(m) => self.handle_send_file(&mut stream, m).await,
            Message::ReceiveFile(m) => self.handle_receive_file(&mut stream, m).await,
            other => debug!("[{peer}] unexpected first message: {other:?}"),
        }
    }

    async fn handle_register<S>(&self, stream: &mut S, m: RegisterRelay, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!(
            "register relay: remote [{peer}] port [{}] advertised ip [{}]",
            m.bind_port, m.public_ip
        );

        let host = if m.public_ip.is_empty() {
            peer.ip().to_string()
        } else {
            m.public_ip.clone()
        };
        let addr = join_host_port(&host, m.bind_port);

        if let Err(e) = self.probe_relay(&addr).await {
            warn!("[{addr}] relay liveness probe failed: {e}");
            let resp = RegisterRelayResp {
                error: "no public address".to_string(),
            };
            let _ = write_message(stream, &Message::RegisterRelayResp(resp)).await;
            return;
        }

        let accepted = RegisterRelayResp {
            error: String::new(),
        };
        if write_message(stream, &Message::RegisterRelayResp(accepted))
            .await
            .is_err()
        {
            return;
        }

        let generation = self.registry.insert(addr.clone());
        info!("[{addr}] relay registered (version {})", m.version);

        // the relay pings every 10 s; 30 s of silence is death
        loop {
            match timeout(KEEPALIVE_TIMEOUT, read_message(stream)).await {
                Ok(Ok(Message::Ping)) => {
                    if write_message(stream, &Message::Pong).await.is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }

        self.registry.remove(&addr, generation);
        info!("[{addr}] relay unregistered");
    }

    /// Dials the relay back on its claimed public address and expects a
    /// pong within the probe deadline.
    async fn probe_relay(&self, addr: &str) -> freighter_core::Result<()> {
        let mut conn = tls::connect(&self.connector, addr).await?;
        write_message(&mut conn, &Message::Ping).await?;
        match timeout(PROBE_TIMEOUT, read_message(&mut conn)).await {
            Ok(Ok(Message::Pong)) => Ok(()),
            Ok(Ok(_)) => Err(Error::protocol("expected pong")),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::protocol("liveness probe timed out")),
        }
    }

    async fn handle_send_file<S>(&self, stream: &mut S, m: SendFile)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if m.id.is_empty() || m.name.is_empty() {
            let resp = SendFileResp {
                error: "id and file name is required".to_string(),
                ..Default::default()
            };
            let _ = write_message(stream, &Message::SendFileResp(resp)).await;
            return;
        }
        debug!(
            "new send file: id [{}] name [{}] size [{}]",
            m.id, m.name, m.fsize
        );

        let offer = SendOffer {
            name: m.name.clone(),
            fsize: m.fsize,
            window: m.cache_count,
        };
        let resp = match self.matcher.match_sender(&m.id, offer, MATCH_TIMEOUT).await {
            Ok(claim) => SendFileResp {
                id: m.id.clone(),
                workers: self.registry.addrs(),
                cache_count: m.cache_count.min(claim.window),
                error: String::new(),
            },
            Err(e) => {
                warn!("send file [{}] not matched: {e}", m.id);
                SendFileResp {
                    error: e,
                    ..Default::default()
                }
            }
        };
        let _ = write_message(stream, &Message::SendFileResp(resp)).await;
    }

    async fn handle_receive_file<S>(&self, stream: &mut S, m: ReceiveFile)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if m.id.is_empty() {
            let resp = ReceiveFileResp {
                error: "id is required".to_string(),
                ..Default::default()
            };
            let _ = write_message(stream, &Message::ReceiveFileResp(resp)).await;
            return;
        }
        debug!("new receive file: id [{}]", m.id);

        let claim = RecvClaim {
            window: m.cache_count,
        };
        let resp = match self.matcher.match_receiver(&m.id, claim) {
            Ok(offer) => ReceiveFileResp {
                name: offer.name,
                fsize: offer.fsize,
                workers: self.registry.addrs(),
                cache_count: offer.window.min(m.cache_count),
                error: String::new(),
            },
            Err(e) => {
                warn!("receive file [{}] not matched: {e}", m.id);
                ReceiveFileResp {
                    error: e,
                    ..Default::default()
                }
            }
        };
        let _ = write_message(stream, &Message::ReceiveFileResp(resp)).await;
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("1.2.3.4", 7778), "1.2.3.4:7778");
        assert_eq!(join_host_port("::1", 7778), "[::1]:7778");
    }
}
