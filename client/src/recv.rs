//! Receive side: rendezvous through the coordinator, then reassemble
//! frames arriving over every advertised relay.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use log::{debug, info};
use tokio::io::AsyncWrite;
use tokio::time::timeout;

use freighter_core::io::CallbackWriter;
use freighter_core::tls::{self, TlsConnector};
use freighter_core::wire::{read_message, write_message, Message, NewRecvStream, ReceiveFile};
use freighter_core::Receiver;

/// Deadline for the coordinator's match response.
const MATCH_RESP_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a relay's pairing response.
const STREAM_RESP_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between connection attempts to one relay.
const REDIAL_PAUSE: Duration = Duration::from_secs(3);

pub async fn recv_file(
    connector: &TlsConnector,
    server_addr: &str,
    id: &str,
    path: &Path,
    cache_count: u32,
) -> anyhow::Result<()> {
    let mut conn = tls::connect(connector, server_addr).await?;
    let announce = ReceiveFile {
        id: id.to_string(),
        cache_count,
    };
    write_message(&mut conn, &Message::ReceiveFile(announce)).await?;

    let resp = match timeout(MATCH_RESP_TIMEOUT, read_message(&mut conn)).await {
        Ok(r) => r?,
        Err(_) => bail!("no response from coordinator"),
    };
    let m = match resp {
        Message::ReceiveFileResp(m) => m,
        other => bail!("unexpected coordinator response: {other:?}"),
    };
    if !m.error.is_empty() {
        bail!(m.error);
    }
    if m.workers.is_empty() {
        bail!("no available workers");
    }
    println!("Recv filename: {} Size: {} bytes", m.name, m.fsize);
    debug!("workers: {:?}", m.workers);

    let dest = dest_path(path, &m.name).await;
    let file = tokio::fs::File::create(&dest).await?;
    let written = Arc::new(AtomicU64::new(0));
    let counted = {
        let written = written.clone();
        CallbackWriter::new(file, move |n| {
            written.fetch_add(n as u64, Ordering::Relaxed);
        })
    };
    let recv = Arc::new(Receiver::new(0, counted));

    let start = Instant::now();
    let streams: Vec<_> = m
        .workers
        .iter()
        .map(|addr| {
            tokio::spawn(drain_relay(
                recv.clone(),
                connector.clone(),
                id.to_string(),
                addr.clone(),
            ))
        })
        .collect();

    recv.run().await?;
    futures::future::join_all(streams).await;
    info!(
        "received {} bytes into {} in {:.2}s",
        written.load(Ordering::Relaxed),
        dest.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

/// When the target is a directory, join the advertised name (its file
/// name component only) under it.
async fn dest_path(path: &Path, advertised: &str) -> PathBuf {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return path.to_path_buf();
    }
    let name = Path::new(advertised)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("received.bin"));
    path.join(name)
}

/// Dials one relay until a stream is established, then delivers frames
/// and acks each on the same stream until the stream ends. An
/// unreachable relay is abandoned; the remaining streams carry the
/// transfer.
async fn drain_relay<W>(
    recv: Arc<Receiver<W>>,
    connector: TlsConnector,
    id: String,
    addr: String,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut first = true;
    loop {
        if !first {
            tokio::time::sleep(REDIAL_PAUSE).await;
        }
        first = false;
        if recv.finished() {
            return;
        }

        let mut conn = match tls::connect(&connector, &addr).await {
            Ok(c) => c,
            Err(e) => {
                debug!("[{addr}] {e}");
                return;
            }
        };

        let hello = Message::NewRecvStream(NewRecvStream { id: id.clone() });
        if write_message(&mut conn, &hello).await.is_err() {
            continue;
        }

        let resp = match timeout(STREAM_RESP_TIMEOUT, read_message(&mut conn)).await {
            Ok(Ok(m)) => m,
            _ => {
                debug!("[{addr}] no pairing response");
                continue;
            }
        };
        match resp {
            Message::NewRecvStreamResp(r) if r.error.is_empty() => {}
            Message::NewRecvStreamResp(r) => {
                debug!("[{addr}] new recv stream error: {}", r.error);
                continue;
            }
            other => {
                debug!("[{addr}] unexpected pairing response: {other:?}");
                continue;
            }
        }
        debug!("recv stream to worker [{addr}] established");

        let (mut rd, mut wr) = tokio::io::split(conn);
        loop {
            let frame = match freighter_core::wire::read_frame(&mut rd).await {
                Ok(f) => f,
                Err(_) => return,
            };
            let ack = freighter_core::wire::Ack::new(frame.file_id, frame.frame_id);
            recv.deliver(frame);
            if freighter_core::wire::write_ack(&mut wr, &ack).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dest_path_keeps_plain_file_target() {
        let dest = dest_path(Path::new("/tmp/nonexistent-target"), "name.bin").await;
        assert_eq!(dest, PathBuf::from("/tmp/nonexistent-target"));
    }

    #[tokio::test]
    async fn test_dest_path_joins_name_under_directory() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dest_path(dir.path(), "name.bin").await;
        assert_eq!(dest, dir.path().join("name.bin"));
    }

    #[tokio::test]
    async fn test_dest_path_strips_advertised_directories() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dest_path(dir.path(), "../../etc/passwd").await;
        assert_eq!(dest, dir.path().join("passwd"));
    }
}
