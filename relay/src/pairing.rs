//! Pairing of the two half-connections of one transfer.
//!
//! The first half-connection for an ID parks in the table and waits on a
//! one-shot channel; the second one hands its connection over and lets
//! the first-comer write both responses and run the splice. The hand-off
//! is non-blocking, so a second-comer can never get stuck on a
//! first-comer that already timed out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use freighter_core::limit::TokenBucket;
use freighter_core::wire::{write_message, Message, NewRecvStreamResp, NewSendStreamResp};

use crate::splice::splice;
use crate::traffic::TrafficMeter;

/// How long the first half-connection waits for its pair.
const PAIR_TIMEOUT: Duration = Duration::from_secs(20);

struct HalfConn<S> {
    is_sender: bool,
    stream: S,
}

struct Pending<S> {
    token: u64,
    tx: oneshot::Sender<HalfConn<S>>,
}

/// Table of half-connections awaiting their pair, keyed by transfer ID.
pub struct PairTable<S> {
    slots: Mutex<HashMap<String, Pending<S>>>,
    next_token: AtomicU64,
    limiter: Arc<TokenBucket>,
    meter: Arc<TrafficMeter>,
}

impl<S> PairTable<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(limiter: Arc<TokenBucket>, meter: Arc<TrafficMeter>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            limiter,
            meter,
        }
    }

    /// Offers one half-connection for pairing. On success the stream has
    /// been consumed (responses written, splice launched); on failure the
    /// stream comes back with the error string to report.
    pub async fn offer(&self, id: &str, stream: S, is_sender: bool) -> Result<(), (S, String)> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let parked = {
            let mut slots = self.slots.lock().unwrap();
            match slots.remove(id) {
                Some(pending) => Some(pending),
                None => {
                    slots.insert(id.to_string(), Pending { token, tx });
                    None
                }
            }
        };

        if let Some(pending) = parked {
            // second-comer: hand our connection to the waiting side
            let half = HalfConn { is_sender, stream };
            return match pending.tx.send(half) {
                Ok(()) => Ok(()),
                Err(half) => Err((half.stream, "no target pair connection".to_string())),
            };
        }

        match tokio::time::timeout(PAIR_TIMEOUT, rx).await {
            Ok(Ok(pair)) => {
                self.complete(id, HalfConn { is_sender, stream }, pair).await;
                Ok(())
            }
            Ok(Err(_)) | Err(_) => {
                // only reap the slot if it is still ours
                let mut slots = self.slots.lock().unwrap();
                if slots.get(id).is_some_and(|p| p.token == token) {
                    slots.remove(id);
                }
                Err((stream, "timeout waiting pair connection".to_string()))
            }
        }
    }

    /// Writes both responses and launches the splice. The roles follow
    /// the first-comer's flag; its pair is assumed to be the other side.
    async fn complete(&self, id: &str, first: HalfConn<S>, second: HalfConn<S>) {
        let (mut sender, mut receiver) = if first.is_sender {
            (first.stream, second.stream)
        } else {
            (second.stream, first.stream)
        };

        let send_resp = Message::NewSendStreamResp(NewSendStreamResp {
            error: String::new(),
        });
        let recv_resp = Message::NewRecvStreamResp(NewRecvStreamResp {
            error: String::new(),
        });
        if write_message(&mut sender, &send_resp).await.is_err() {
            return;
        }
        if write_message(&mut receiver, &recv_resp).await.is_err() {
            return;
        }

        let id = id.to_string();
        let limiter = self.limiter.clone();
        let meter = self.meter.clone();
        tokio::spawn(async move {
            splice(sender, receiver, limiter, meter).await;
            info!("ID [{id}] pair connections closed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freighter_core::wire::read_message;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn table() -> Arc<PairTable<DuplexStream>> {
        Arc::new(PairTable::new(
            Arc::new(TokenBucket::new(u32::MAX as u64, 16 * 1024)),
            Arc::new(TrafficMeter::new(0)),
        ))
    }

    #[tokio::test]
    async fn test_pairing_splices_both_halves() {
        let table = table();

        let (mut send_near, send_far) = tokio::io::duplex(4096);
        let (mut recv_near, recv_far) = tokio::io::duplex(4096);

        let t2 = table.clone();
        let first = tokio::spawn(async move { t2.offer("x", send_far, true).await });
        tokio::task::yield_now().await;
        let t3 = table.clone();
        let second = tokio::spawn(async move { t3.offer("x", recv_far, false).await });

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());

        // both sides get their responses
        assert!(matches!(
            read_message(&mut send_near).await.unwrap(),
            Message::NewSendStreamResp(_)
        ));
        assert!(matches!(
            read_message(&mut recv_near).await.unwrap(),
            Message::NewRecvStreamResp(_)
        ));

        // and bytes flow through the splice
        send_near.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 4];
        recv_near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
    }

    #[tokio::test]
    async fn test_receiver_first_pairing_keeps_roles() {
        let table = table();

        let (mut send_near, send_far) = tokio::io::duplex(4096);
        let (mut recv_near, recv_far) = tokio::io::duplex(4096);

        // receiver arrives first this time
        let t2 = table.clone();
        let first = tokio::spawn(async move { t2.offer("y", recv_far, false).await });
        tokio::task::yield_now().await;
        let t3 = table.clone();
        let second = tokio::spawn(async move { t3.offer("y", send_far, true).await });

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());

        assert!(matches!(
            read_message(&mut recv_near).await.unwrap(),
            Message::NewRecvStreamResp(_)
        ));
        assert!(matches!(
            read_message(&mut send_near).await.unwrap(),
            Message::NewSendStreamResp(_)
        ));

        send_near.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 4];
        recv_near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpaired_offer_times_out_and_frees_slot() {
        let table = table();

        let (_near, far) = tokio::io::duplex(64);
        let (stream, err) = table.offer("z", far, true).await.unwrap_err();
        assert_eq!(err, "timeout waiting pair connection");
        drop(stream);

        // the slot is free: a fresh pair on the same id works
        let (mut send_near, send_far) = tokio::io::duplex(4096);
        let (mut recv_near, recv_far) = tokio::io::duplex(4096);
        let t2 = table.clone();
        let first = tokio::spawn(async move { t2.offer("z", send_far, true).await });
        tokio::task::yield_now().await;
        assert!(table.offer("z", recv_far, false).await.is_ok());
        assert!(first.await.unwrap().is_ok());

        assert!(matches!(
            read_message(&mut send_near).await.unwrap(),
            Message::NewSendStreamResp(_)
        ));
        assert!(matches!(
            read_message(&mut recv_near).await.unwrap(),
            Message::NewRecvStreamResp(_)
        ));
    }
}
