//! Bookkeeping wrapper around an in-flight frame.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::wire::Frame;

/// A frame owned by the sending pipeline, alive from first emission until
/// its ack arrives or the transfer aborts.
///
/// The wrapped frame itself is immutable; only the transmit bookkeeping
/// changes as the frame moves between relay sessions.
#[derive(Debug)]
pub struct SendFrame {
    frame: Frame,
    acked: AtomicBool,

    /// Relay session currently carrying the frame, 0 when none.
    session: AtomicU32,

    /// Last transmit timestamp, None before the first write.
    sent_at: Mutex<Option<Instant>>,
}

impl SendFrame {
    pub(crate) fn new(frame: Frame) -> Self {
        Self {
            frame,
            acked: AtomicBool::new(false),
            session: AtomicU32::new(0),
            sent_at: Mutex::new(None),
        }
    }

    /// The wrapped frame.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Sequence number of the wrapped frame.
    pub fn frame_id(&self) -> u32 {
        self.frame.frame_id
    }

    /// True once the receiver's ack has been processed.
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }

    pub(crate) fn set_acked(&self) {
        self.acked.store(true, Ordering::Release);
    }

    /// Session id of the relay currently carrying the frame, 0 when none.
    pub fn carried_by(&self) -> u32 {
        self.session.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_sent(&self, session: u32) {
        self.session.store(session, Ordering::Relaxed);
        *self.sent_at.lock().unwrap() = Some(Instant::now());
    }

    pub(crate) fn clear_session(&self) {
        self.session.store(0, Ordering::Relaxed);
    }

    /// Time of the last transmit, None before the first write.
    pub fn sent_at(&self) -> Option<Instant> {
        *self.sent_at.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_send_frame_bookkeeping() {
        let sf = SendFrame::new(Frame::new(0, 3, Bytes::from_static(b"abc")));

        assert!(!sf.is_acked());
        assert_eq!(sf.carried_by(), 0);
        assert!(sf.sent_at().is_none());

        sf.mark_sent(2);
        assert_eq!(sf.carried_by(), 2);
        assert!(sf.sent_at().is_some());

        sf.set_acked();
        assert!(sf.is_acked());

        sf.clear_session();
        assert_eq!(sf.carried_by(), 0);
    }
}
