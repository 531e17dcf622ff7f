//! Rendezvous of senders and receivers by transfer ID.
//!
//! A sender parks in the table and blocks until a receiver claims its
//! slot or the wait times out. Delivery through the one-shot channel is
//! non-blocking, so a receiver can never get stuck on a sender that
//! already gave up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

/// What a matched receiver learns about the sender.
#[derive(Debug, Clone)]
pub struct SendOffer {
    pub name: String,
    pub fsize: u64,

    /// Sender's requested window capacity.
    pub window: u32,
}

/// What the waiting sender learns about the receiver.
#[derive(Debug)]
pub struct RecvClaim {
    /// Receiver's requested window capacity.
    pub window: u32,
}

struct PendingSend {
    token: u64,
    offer: SendOffer,
    tx: oneshot::Sender<RecvClaim>,
}

/// Pairs exactly one sender with exactly one receiver per transfer ID.
pub struct Matcher {
    senders: Mutex<HashMap<String, PendingSend>>,
    next_token: AtomicU64,
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Parks the sender and blocks until a receiver claims the slot or
    /// `timeout` elapses. Error strings are returned to the client as-is.
    pub async fn match_sender(
        &self,
        id: &str,
        offer: SendOffer,
        timeout: Duration,
    ) -> Result<RecvClaim, String> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut senders = self.senders.lock().unwrap();
            if senders.contains_key(id) {
                return Err("id is repeated".to_string());
            }
            senders.insert(id.to_string(), PendingSend { token, offer, tx });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(claim)) => Ok(claim),
            Ok(Err(_)) | Err(_) => {
                // only reap the slot if it is still ours
                let mut senders = self.senders.lock().unwrap();
                if senders.get(id).is_some_and(|p| p.token == token) {
                    senders.remove(id);
                }
                Err("timeout waiting recv conn".to_string())
            }
        }
    }

    /// Claims the sender slot for `id` and wakes the waiting sender.
    pub fn match_receiver(&self, id: &str, claim: RecvClaim) -> Result<SendOffer, String> {
        let pending = self.senders.lock().unwrap().remove(id);
        let Some(PendingSend { offer, tx, .. }) = pending else {
            return Err("no target sender".to_string());
        };

        // the sender may have timed out between slot removal and here
        if tx.send(claim).is_err() {
            return Err("no target sender".to_string());
        }
        Ok(offer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn offer(window: u32) -> SendOffer {
        SendOffer {
            name: "file.bin".to_string(),
            fsize: 1024,
            window,
        }
    }

    #[tokio::test]
    async fn test_sender_receiver_rendezvous() {
        let matcher = Arc::new(Matcher::new());

        let m2 = matcher.clone();
        let sender = tokio::spawn(async move {
            m2.match_sender("x", offer(512), Duration::from_secs(5)).await
        });

        // let the sender park first
        tokio::task::yield_now().await;
        let got = matcher.match_receiver("x", RecvClaim { window: 128 });
        let offer = got.unwrap();
        assert_eq!(offer.name, "file.bin");
        assert_eq!(offer.window, 512);

        let claim = sender.await.unwrap().unwrap();
        assert_eq!(claim.window, 128);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let matcher = Arc::new(Matcher::new());

        let m2 = matcher.clone();
        let first = tokio::spawn(async move {
            m2.match_sender("dup", offer(4), Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;

        let second = matcher
            .match_sender("dup", offer(4), Duration::from_millis(10))
            .await;
        assert_eq!(second.unwrap_err(), "id is repeated");

        // unblock the first sender
        matcher
            .match_receiver("dup", RecvClaim { window: 4 })
            .unwrap();
        first.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_timeout_releases_slot() {
        let matcher = Matcher::new();

        let err = matcher
            .match_sender("t", offer(4), Duration::from_secs(120))
            .await
            .unwrap_err();
        assert_eq!(err, "timeout waiting recv conn");

        // the slot is free again: a receiver finds nothing...
        assert_eq!(
            matcher
                .match_receiver("t", RecvClaim { window: 4 })
                .unwrap_err(),
            "no target sender"
        );
        // ...and a new sender with the same id may park
        let reuse = matcher.match_sender("t", offer(4), Duration::from_millis(1));
        assert_eq!(reuse.await.unwrap_err(), "timeout waiting recv conn");
    }

    #[tokio::test]
    async fn test_receiver_without_sender_fails_immediately() {
        let matcher = Matcher::new();
        assert_eq!(
            matcher
                .match_receiver("absent", RecvClaim { window: 4 })
                .unwrap_err(),
            "no target sender"
        );
    }
}
