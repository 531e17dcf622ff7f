//! Sending pipeline: frame production, window bookkeeping, and fan-out
//! across relay sessions.
//!
//! One producer loop owns sequence allocation and feeds a shared frame
//! channel; any number of relay sessions pull from it and forward acks
//! onto one merged ack channel. A global window bounds how many frames
//! are unacknowledged at once; each session additionally runs its own
//! adaptive window so one slow relay cannot stall the others.

mod frame;
mod session;
mod window;

pub use frame::SendFrame;
pub use window::WindowController;

pub(crate) use window::FlightWindow;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::wire::{is_valid_frame_size, Ack, Frame};
use session::RelaySession;

/// Default idle bound: abort when no ack arrives for this long while
/// frames are outstanding.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// State shared between the producer loop, the ack loop, and every relay
/// session.
pub(crate) struct Shared {
    pub(crate) window: usize,

    /// Free global window slots.
    permits: Semaphore,

    /// Unacked frames: sequence map plus allocation-ordered buffer.
    unacked: Mutex<Unacked>,

    /// Frames surrendered by dead sessions, awaiting re-issue.
    retry: Mutex<VecDeque<Arc<SendFrame>>>,
    retry_notify: Notify,

    frame_tx: mpsc::Sender<Arc<SendFrame>>,
    pub(crate) frame_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<SendFrame>>>,
    pub(crate) ack_tx: mpsc::Sender<Ack>,

    /// Fires on completion or on a fatal pipeline error.
    pub(crate) done: CancellationToken,
}

struct Unacked {
    map: HashMap<u32, Arc<SendFrame>>,
    order: VecDeque<Arc<SendFrame>>,
    all_emitted: bool,
}

impl Shared {
    /// Registers a freshly allocated frame. `last` flags the end-of-file
    /// frame and must be recorded under the same lock as the map insert,
    /// or an immediate ack could declare the transfer complete without
    /// it. Returns false when the transfer is shutting down.
    async fn emit(&self, sf: Arc<SendFrame>, last: bool) -> bool {
        {
            let mut un = self.unacked.lock().unwrap();
            un.map.insert(sf.frame_id(), sf.clone());
            un.order.push_back(sf.clone());
            if last {
                un.all_emitted = true;
            }
        }
        self.frame_tx.send(sf).await.is_ok()
    }

    /// Marks one sequence acked and trims the acked prefix of the
    /// in-flight buffer, releasing one global permit per trimmed entry.
    /// Returns true when the whole transfer is complete.
    fn process_ack(&self, ack: &Ack) -> bool {
        let mut un = self.unacked.lock().unwrap();
        let Some(sf) = un.map.remove(&ack.frame_id) else {
            return false;
        };
        sf.set_acked();
        sf.clear_session();

        let mut released = 0;
        while un.order.front().is_some_and(|f| f.is_acked()) {
            un.order.pop_front();
            released += 1;
        }
        let complete = un.all_emitted && un.map.is_empty();
        drop(un);

        if released > 0 {
            self.permits.add_permits(released);
        }
        complete
    }

    /// Returns dead-session frames to the retry queue and re-posts their
    /// window permits so they can be re-issued through another relay.
    pub(crate) fn surrender(&self, frames: Vec<Arc<SendFrame>>) {
        let n = frames.len();
        for sf in &frames {
            sf.clear_session();
        }
        self.retry.lock().unwrap().extend(frames);
        self.permits.add_permits(n);
        self.retry_notify.notify_one();
    }

    fn pop_retry(&self) -> Option<Arc<SendFrame>> {
        self.retry.lock().unwrap().pop_front()
    }

    fn retry_is_empty(&self) -> bool {
        self.retry.lock().unwrap().is_empty()
    }

    fn all_emitted(&self) -> bool {
        self.unacked.lock().unwrap().all_emitted
    }

    fn outstanding(&self) -> usize {
        self.unacked.lock().unwrap().map.len()
    }
}

/// The sending half of a transfer.
///
/// Construct once per file, [`attach`](Sender::attach) one stream per
/// relay, and drive everything with [`run`](Sender::run). `run` completes
/// when the zero-payload end-of-file frame has been acknowledged.
pub struct Sender<R> {
    file_id: u32,
    frame_size: usize,
    src: tokio::sync::Mutex<R>,
    idle_timeout: Duration,
    shared: Arc<Shared>,
    ack_rx: Mutex<Option<mpsc::Receiver<Ack>>>,
    session_seq: AtomicU32,
}

impl<R> Sender<R>
where
    R: AsyncRead + Unpin,
{
    /// Creates a pipeline reading from `src`, cutting payloads of at most
    /// `frame_size` bytes, with at most `window` unacked frames in flight.
    pub fn new(file_id: u32, src: R, frame_size: usize, window: usize) -> Result<Self> {
        if !is_valid_frame_size(frame_size) {
            return Err(Error::InvalidFrameSize(frame_size));
        }
        let window = window.max(1);

        let (frame_tx, frame_rx) = mpsc::channel(window);
        let (ack_tx, ack_rx) = mpsc::channel(window.max(16));

        let shared = Arc::new(Shared {
            window,
            permits: Semaphore::new(window),
            unacked: Mutex::new(Unacked {
                map: HashMap::new(),
                order: VecDeque::new(),
                all_emitted: false,
            }),
            retry: Mutex::new(VecDeque::new()),
            retry_notify: Notify::new(),
            frame_tx,
            frame_rx: tokio::sync::Mutex::new(frame_rx),
            ack_tx,
            done: CancellationToken::new(),
        });

        Ok(Self {
            file_id,
            frame_size,
            src: tokio::sync::Mutex::new(src),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            shared,
            ack_rx: Mutex::new(Some(ack_rx)),
            session_seq: AtomicU32::new(0),
        })
    }

    /// Overrides the idle bound after which a stalled transfer aborts.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Negotiated window capacity.
    pub fn window(&self) -> usize {
        self.shared.window
    }

    /// Number of currently unacknowledged frames.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding()
    }

    /// True once the transfer has completed or aborted; attaching more
    /// relay sessions is pointless from then on.
    pub fn finished(&self) -> bool {
        self.shared.done.is_cancelled()
    }

    /// Runs one relay session over `stream`; returns when the session
    /// terminates, either cleanly at end of transfer or on a relay error.
    /// Frames the dead session was carrying go back to the retry queue.
    pub async fn attach<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = self.session_seq.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("relay session {id} attached");
        let res = RelaySession::new(id, self.shared.clone()).run(stream).await;
        debug!("relay session {id} finished: {res:?}");
        res
    }

    /// Reads the source, allocates sequence numbers, and collects acks.
    /// Completes when the end-of-file frame is acknowledged.
    pub async fn run(&self) -> Result<()> {
        let ack_rx = self
            .ack_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::SessionClosed)?;

        let (produced, acked) = tokio::join!(self.produce(), self.collect_acks(ack_rx));
        produced?;
        acked?;
        Ok(())
    }

    async fn produce(&self) -> Result<()> {
        let mut src = self.src.lock().await;
        let mut next_seq: u32 = 0;

        loop {
            if self.shared.all_emitted() && self.shared.retry_is_empty() {
                // only retries can still need the producer
                tokio::select! {
                    _ = self.shared.done.cancelled() => return Ok(()),
                    _ = self.shared.retry_notify.notified() => continue,
                }
            }

            let permit = tokio::select! {
                _ = self.shared.done.cancelled() => return Ok(()),
                p = self.shared.permits.acquire() => match p {
                    Ok(p) => p,
                    Err(_) => return Ok(()),
                },
            };

            // a dead relay's frames take priority over fresh source reads
            if let Some(sf) = self.shared.pop_retry() {
                permit.forget();
                if self.shared.frame_tx.send(sf).await.is_err() {
                    return Ok(());
                }
                continue;
            }
            if self.shared.all_emitted() {
                drop(permit);
                continue;
            }

            let mut buf = vec![0u8; self.frame_size];
            let n = match src.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    self.shared.done.cancel();
                    return Err(e.into());
                }
            };

            let frame = if n == 0 {
                Frame::eof(self.file_id, next_seq)
            } else {
                buf.truncate(n);
                Frame::new(self.file_id, next_seq, Bytes::from(buf))
            };
            let eof = frame.is_eof();
            next_seq += 1;

            permit.forget();
            if !self.shared.emit(Arc::new(SendFrame::new(frame)), eof).await {
                return Ok(());
            }
        }
    }

    async fn collect_acks(&self, mut ack_rx: mpsc::Receiver<Ack>) -> Result<()> {
        loop {
            let recv = tokio::time::timeout(self.idle_timeout, ack_rx.recv());
            let ack = tokio::select! {
                _ = self.shared.done.cancelled() => return Ok(()),
                r = recv => match r {
                    Err(_) => {
                        if self.shared.outstanding() > 0 {
                            self.shared.done.cancel();
                            return Err(Error::IdleTimeout);
                        }
                        continue;
                    }
                    Ok(None) => return Ok(()),
                    Ok(Some(ack)) => ack,
                },
            };

            if self.shared.process_ack(&ack) {
                debug!("transfer {} complete", self.file_id);
                self.shared.done.cancel();
                return Ok(());
            }
        }
    }
}
