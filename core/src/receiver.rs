//! Receiving pipeline: dedup, reorder, and ordered writes.
//!
//! Frames arrive from any number of relay streams in any order, possibly
//! duplicated. [`Receiver::deliver`] files them into an ordered pending
//! map; [`Receiver::run`] drains the contiguous prefix and writes it to
//! the destination, one coalesced write per wake-up.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use log::debug;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::error::Result;
use crate::wire::Frame;

struct Pending {
    /// Next sequence to hand to the destination.
    next: u32,

    /// Received frames at or above `next`, keyed by sequence. Doubles as
    /// the dedup set.
    frames: BTreeMap<u32, Bytes>,
}

/// The receiving half of a transfer.
///
/// `deliver` may be called concurrently from every relay reader; `run`
/// owns the destination and terminates once the zero-payload end-of-file
/// frame has been written through in order.
pub struct Receiver<W> {
    file_id: u32,
    dst: tokio::sync::Mutex<W>,
    pending: Mutex<Pending>,
    wake: Notify,
    finished: AtomicBool,
}

impl<W> Receiver<W>
where
    W: AsyncWrite + Unpin,
{
    /// Creates a receiver writing ordered bytes to `dst`.
    pub fn new(file_id: u32, dst: W) -> Self {
        Self {
            file_id,
            dst: tokio::sync::Mutex::new(dst),
            pending: Mutex::new(Pending {
                next: 0,
                frames: BTreeMap::new(),
            }),
            wake: Notify::new(),
            finished: AtomicBool::new(false),
        }
    }

    /// Files one frame into the pending map.
    ///
    /// Duplicates, frames below the delivery point, and frames for other
    /// files are silently dropped; delivering the same frame any number
    /// of times is equivalent to delivering it once.
    pub fn deliver(&self, frame: Frame) {
        if frame.file_id != self.file_id {
            return;
        }

        {
            let mut pending = self.pending.lock().unwrap();
            if frame.frame_id < pending.next || pending.frames.contains_key(&frame.frame_id) {
                return;
            }
            pending.frames.insert(frame.frame_id, frame.payload);
        }
        self.wake.notify_one();
    }

    /// Consumes the receiver and returns the destination.
    pub fn into_dest(self) -> W {
        self.dst.into_inner()
    }

    /// True once [`run`](Receiver::run) has returned; relay readers can
    /// stop dialing from then on.
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Drains contiguous frames to the destination until the end-of-file
    /// frame arrives in order.
    pub async fn run(&self) -> Result<()> {
        let res = self.drain_loop().await;
        self.finished.store(true, Ordering::Release);
        res
    }

    async fn drain_loop(&self) -> Result<()> {
        loop {
            self.wake.notified().await;

            // collect the contiguous prefix under the lock, write after
            let mut batch = Vec::new();
            let mut finished = false;
            {
                let mut pending = self.pending.lock().unwrap();
                loop {
                    let head = pending.next;
                    let Some(payload) = pending.frames.remove(&head) else {
                        break;
                    };
                    if payload.is_empty() {
                        finished = true;
                        break;
                    }
                    batch.extend_from_slice(&payload);
                    pending.next += 1;
                }
            }

            if !batch.is_empty() {
                let mut dst = self.dst.lock().await;
                dst.write_all(&batch).await?;
            }

            if finished {
                let mut dst = self.dst.lock().await;
                dst.flush().await?;
                debug!("transfer {} reassembly complete", self.file_id);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, payload: &'static [u8]) -> Frame {
        Frame::new(0, id, Bytes::from_static(payload))
    }

    async fn drain(frames: Vec<Frame>) -> Vec<u8> {
        let recv = Receiver::new(0, Vec::new());
        for f in frames {
            recv.deliver(f);
        }
        recv.run().await.unwrap();
        recv.into_dest()
    }

    #[tokio::test]
    async fn test_in_order_delivery() {
        let out = drain(vec![
            frame(0, b"ab"),
            frame(1, b"cd"),
            frame(2, b"e"),
            Frame::eof(0, 3),
        ])
        .await;
        assert_eq!(out, b"abcde");
    }

    #[tokio::test]
    async fn test_any_permutation_reassembles() {
        let payloads: &[&'static [u8]] = &[b"11", b"22", b"33", b"44"];
        // a few representative permutations incl. eof-first
        let orders: &[&[u32]] = &[
            &[4, 3, 2, 1, 0],
            &[1, 0, 3, 2, 4],
            &[2, 4, 0, 1, 3],
            &[0, 1, 2, 3, 4],
        ];

        for order in orders {
            let frames: Vec<Frame> = order
                .iter()
                .map(|&id| {
                    if id == 4 {
                        Frame::eof(0, 4)
                    } else {
                        frame(id, payloads[id as usize])
                    }
                })
                .collect();
            let out = drain(frames).await;
            assert_eq!(out, b"11223344", "order {order:?}");
        }
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped() {
        let out = drain(vec![
            frame(0, b"x"),
            frame(0, b"x"),
            frame(1, b"y"),
            frame(0, b"x"),
            frame(1, b"y"),
            Frame::eof(0, 2),
            Frame::eof(0, 2),
        ])
        .await;
        assert_eq!(out, b"xy");
    }

    #[tokio::test]
    async fn test_finished_flag_set_after_run() {
        let recv = Receiver::new(0, Vec::new());
        assert!(!recv.finished());

        recv.deliver(Frame::eof(0, 0));
        recv.run().await.unwrap();
        assert!(recv.finished());
    }

    #[tokio::test]
    async fn test_other_file_ids_are_dropped() {
        let recv = Receiver::new(7, Vec::new());
        recv.deliver(Frame::new(3, 0, Bytes::from_static(b"zz")));
        recv.deliver(Frame::new(7, 0, Bytes::from_static(b"ok")));
        recv.deliver(Frame::eof(7, 1));
        recv.run().await.unwrap();
        assert_eq!(recv.into_dest(), b"ok");
    }

    #[tokio::test]
    async fn test_deliver_while_running() {
        let recv = std::sync::Arc::new(Receiver::new(0, Vec::new()));

        let r2 = recv.clone();
        let feeder = tokio::spawn(async move {
            for id in (0..50u32).rev() {
                r2.deliver(frame(id, b"abcdef"));
                tokio::task::yield_now().await;
            }
            r2.deliver(Frame::eof(0, 50));
        });

        recv.run().await.unwrap();
        feeder.await.unwrap();

        let out = std::sync::Arc::into_inner(recv).unwrap().into_dest();
        assert_eq!(out.len(), 50 * 6);
    }
}
