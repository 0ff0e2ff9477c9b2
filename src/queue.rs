//! Pending-frame queue and recording session state.
//!
//! Frames and the session state share one mutex, so every enqueue, pop and
//! state transition is atomic with respect to the others. The encode worker
//! waits on a condition variable while the queue is empty and recording.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bitmp4_codec::Frame;

/// Lifecycle state of a recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session. Frames are dropped.
    #[default]
    Idle,
    /// Frames are accepted and encoded as they arrive.
    Recording,
    /// No new frames; the worker encodes the backlog and then stops.
    DrainingToFinish,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Recording => write!(f, "recording"),
            Self::DrainingToFinish => write!(f, "draining"),
        }
    }
}

/// Outcome of [`FrameQueue::pop_timeout`].
#[derive(Debug)]
pub enum Pop {
    /// The oldest pending frame.
    Frame(Frame),
    /// Still recording, but no frame arrived within the timeout.
    Timeout,
    /// Not recording and nothing left to encode.
    Drained,
}

struct QueueInner {
    frames: VecDeque<Frame>,
    state: SessionState,
}

/// Thread-safe FIFO of frames waiting to be encoded.
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::new(),
                state: SessionState::Idle,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame. Frames are only accepted while recording; otherwise the
    /// frame is dropped and `false` is returned.
    pub fn enqueue(&self, frame: Frame) -> bool {
        let mut inner = self.lock();
        if inner.state != SessionState::Recording {
            tracing::trace!("Dropping frame while {}", inner.state);
            return false;
        }
        inner.frames.push_back(frame);
        self.available.notify_one();
        true
    }

    /// Discard stale frames and start recording.
    pub fn begin_session(&self) {
        let mut inner = self.lock();
        let stale = inner.frames.len();
        if stale > 0 {
            tracing::debug!("Discarding {} stale frames", stale);
        }
        inner.frames.clear();
        inner.state = SessionState::Recording;
    }

    /// Go idle immediately. Queued frames are discarded.
    ///
    /// Returns the number of frames that were abandoned.
    pub fn request_stop(&self) -> usize {
        let mut inner = self.lock();
        inner.state = SessionState::Idle;
        let abandoned = inner.frames.len();
        inner.frames.clear();
        self.available.notify_all();
        abandoned
    }

    /// Stop accepting frames but let the worker encode the backlog.
    ///
    /// Returns `false` if the session was not recording.
    pub fn request_finish(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != SessionState::Recording {
            return false;
        }
        inner.state = SessionState::DrainingToFinish;
        self.available.notify_all();
        true
    }

    /// Pop the oldest frame, waiting up to `timeout` while the queue is empty
    /// and the session is recording.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(frame) = inner.frames.pop_front() {
                return Pop::Frame(frame);
            }
            if inner.state != SessionState::Recording {
                return Pop::Drained;
            }
            let now = Instant::now();
            if now >= deadline {
                return Pop::Timeout;
            }
            inner = self
                .available
                .wait_timeout(inner, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Worker-side transition back to idle once the session is over.
    pub fn end_session(&self) {
        let mut inner = self.lock();
        inner.state = SessionState::Idle;
        inner.frames.clear();
        self.available.notify_all();
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }
}
