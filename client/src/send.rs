//! Send side: rendezvous through the coordinator, then stream frames
//! over every advertised relay.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use log::{debug, info};
use tokio::time::timeout;

use freighter_core::io::CallbackReader;
use freighter_core::tls::{self, TlsConnector};
use freighter_core::wire::{read_message, write_message, Message, NewSendStream, SendFile};
use freighter_core::Sender;

/// The coordinator holds the rendezvous slot for up to two minutes.
const MATCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Deadline for a relay's pairing response.
const STREAM_RESP_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between connection attempts to one relay.
const REDIAL_PAUSE: Duration = Duration::from_secs(3);

pub async fn send_file(
    connector: &TlsConnector,
    server_addr: &str,
    id: &str,
    path: &Path,
    frame_size: usize,
    cache_count: u32,
) -> anyhow::Result<()> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    if meta.is_dir() {
        bail!("send file can't be a directory");
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut conn = tls::connect(connector, server_addr).await?;
    let announce = SendFile {
        id: id.to_string(),
        name,
        fsize: meta.len(),
        cache_count,
    };
    write_message(&mut conn, &Message::SendFile(announce)).await?;

    let resp = match timeout(MATCH_TIMEOUT, read_message(&mut conn)).await {
        Ok(r) => r?,
        Err(_) => bail!("timeout waiting recv conn"),
    };
    let m = match resp {
        Message::SendFileResp(m) => m,
        other => bail!("unexpected coordinator response: {other:?}"),
    };
    if !m.error.is_empty() {
        bail!(m.error);
    }
    if m.workers.is_empty() {
        bail!("no available workers");
    }
    println!("ID: {}", m.id);
    debug!("workers: {:?}", m.workers);

    let file = tokio::fs::File::open(path).await?;
    let sent = Arc::new(AtomicU64::new(0));
    let counted = {
        let sent = sent.clone();
        CallbackReader::new(file, move |n| {
            sent.fetch_add(n as u64, Ordering::Relaxed);
        })
    };
    let sender = Arc::new(Sender::new(
        0,
        counted,
        frame_size,
        m.cache_count as usize,
    )?);

    let start = Instant::now();
    let streams: Vec<_> = m
        .workers
        .iter()
        .map(|addr| {
            tokio::spawn(feed_relay(
                sender.clone(),
                connector.clone(),
                id.to_string(),
                addr.clone(),
            ))
        })
        .collect();

    sender.run().await?;
    futures::future::join_all(streams).await;

    info!(
        "sent {} bytes in {:.2}s",
        sent.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Dials one relay until a session is established, runs it to the end,
/// then stops. Frames left behind by a dead session are re-issued by the
/// pipeline through the surviving relays.
async fn feed_relay<R>(sender: Arc<Sender<R>>, connector: TlsConnector, id: String, addr: String)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut first = true;
    loop {
        if !first {
            tokio::time::sleep(REDIAL_PAUSE).await;
        }
        first = false;
        if sender.finished() {
            return;
        }

        let mut conn = match tls::connect(&connector, &addr).await {
            Ok(c) => c,
            Err(e) => {
                debug!("[{addr}] {e}");
                continue;
            }
        };

        let hello = Message::NewSendStream(NewSendStream { id: id.clone() });
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
            Message::NewSendStreamResp(r) if r.error.is_empty() => {}
            Message::NewSendStreamResp(r) => {
                debug!("[{addr}] new send stream error: {}", r.error);
                continue;
            }
            other => {
                debug!("[{addr}] unexpected pairing response: {other:?}");
                continue;
            }
        }
        println!("connect to worker [{addr}] success");

        let _ = sender.attach(conn).await;
        return;
    }
}
