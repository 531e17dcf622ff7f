//! One relay session on the sender side.
//!
//! A session owns its own adaptive window and a wait set of the frames it
//! has written but not yet seen acked. When the session dies, whatever is
//! left in the wait set goes back to the pipeline's retry queue so another
//! relay can carry it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use super::{FlightWindow, SendFrame, Shared};
use crate::error::Result;
use crate::wire::{read_ack, write_frame};

pub(super) struct RelaySession {
    id: u32,
    shared: Arc<Shared>,
    fwin: FlightWindow,
    wait: Mutex<HashMap<u32, Arc<SendFrame>>>,
}

impl RelaySession {
    pub(super) fn new(id: u32, shared: Arc<Shared>) -> Self {
        let cap = (shared.window / 2).max(1);
        Self {
            id,
            shared,
            fwin: FlightWindow::new(cap),
            wait: Mutex::new(HashMap::new()),
        }
    }

    /// Drives the session until the stream fails or the transfer ends,
    /// then surrenders unacked frames to the retry queue.
    pub(super) async fn run<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (rd, wr) = tokio::io::split(stream);
        let (send_res, ack_res) = tokio::join!(self.send_loop(wr), self.ack_loop(rd));

        let mut leftovers: Vec<Arc<SendFrame>> = {
            let mut wait = self.wait.lock().unwrap();
            wait.drain().map(|(_, sf)| sf).collect()
        };
        if !leftovers.is_empty() {
            leftovers.sort_by_key(|sf| sf.frame_id());
            debug!(
                "session {} surrenders {} unacked frames",
                self.id,
                leftovers.len()
            );
            self.shared.surrender(leftovers);
        }

        send_res.and(ack_res)
    }

    async fn send_loop<S>(&self, mut wr: WriteHalf<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            if self.fwin.acquire().await.is_err() {
                // ack loop closed the window after a stream error
                return Ok(());
            }

            let sf = {
                let mut rx = self.shared.frame_rx.lock().await;
                tokio::select! {
                    _ = self.shared.done.cancelled() => None,
                    f = rx.recv() => f,
                }
            };
            let Some(sf) = sf else {
                // transfer finished; closing our half tears the path down
                let _ = wr.shutdown().await;
                return Ok(());
            };

            self.wait.lock().unwrap().insert(sf.frame_id(), sf.clone());
            sf.mark_sent(self.id);
            write_frame(&mut wr, sf.frame()).await?;
        }
    }

    /// Closes the local window on every exit path so a send sub-loop
    /// starved on permits cannot outlive it.
    async fn ack_loop<S>(&self, mut rd: ReadHalf<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let res = self.ack_loop_inner(&mut rd).await;
        self.fwin.close();
        res
    }

    async fn ack_loop_inner<S>(&self, rd: &mut ReadHalf<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let ack = tokio::select! {
                _ = self.shared.done.cancelled() => return Ok(()),
                r = read_ack(rd) => r?,
            };

            if self.wait.lock().unwrap().remove(&ack.frame_id).is_some() {
                self.fwin.release();
            }

            if self.shared.ack_tx.send(ack).await.is_err() {
                return Ok(());
            }
        }
    }
}
