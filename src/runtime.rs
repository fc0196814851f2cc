//! Call dispatch runtime.
//!
//! # Architecture
//!
//! The dispatcher spawns one thread that is the only code allowed to touch
//! call or client mutable state:
//!
//! - Caller threads build a call via [`Client::start_call`] and hand it
//!   off through a concurrent queue, then wake the loop.
//! - The dispatch thread drains the queue, registers each connection with
//!   the poll, advances call state machines on readiness events, applies
//!   the deadline sweep, and invokes completion callbacks inline.
//!
//! No ordering is promised between callbacks of different calls. Within one
//! call, exactly one callback fires, after all state transitions for that
//! call are complete and after the owning client's outcome fields are
//! updated. Callbacks run on the dispatch thread: a slow callback stalls
//! delivery to every other call, so callbacks must be cheap or hand work
//! elsewhere.
//!
//! [`Client::start_call`]: client::Client::start_call

mod call;
mod deadline;
mod dispatch;

pub mod client;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::{Poll, Waker};

use crate::codec::Fault;
use crate::trace::{debug, info};

use call::Call;
use dispatch::{DispatchThread, WAKER_TOKEN};

pub use client::{Client, ResponseCallback};

/// Default cap on a response frame's declared length (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum declared length of a response frame. A size prefix above
    /// this is a protocol violation and fails the call.
    pub max_frame_len: u32,
    /// Capacity of the readiness event buffer per poll iteration.
    pub events_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            events_capacity: 256,
        }
    }
}

impl DispatchConfig {
    /// Builder-style setter for the maximum response frame length.
    #[must_use]
    pub const fn with_max_frame_len(mut self, max: u32) -> Self {
        self.max_frame_len = max;
        self
    }
}

/// Error spawning the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Failed to create the poll instance.
    #[error("failed to create poll: {0}")]
    Poll(io::Error),
    /// Failed to create the loop waker.
    #[error("failed to create waker: {0}")]
    Waker(io::Error),
}

/// A protocol violation detected while reading a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    /// The declared frame length exceeds the configured limit.
    #[error("frame length {len} exceeds limit {max}")]
    FrameTooLarge {
        /// Declared length from the size prefix.
        len: u32,
        /// Configured maximum.
        max: u32,
    },
    /// The peer closed the connection before the frame was complete.
    #[error("connection closed mid-frame")]
    TruncatedFrame,
    /// The frame body did not decode as a reply envelope.
    #[error("malformed reply envelope")]
    MalformedEnvelope,
}

/// The ways a call can fail, plus the synchronous usage errors.
///
/// `Clone` so the same error value can be recorded on the [`Client`] and
/// delivered to the callback; I/O errors are wrapped in `Arc` for that.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// A call is already in flight on this client. Synchronous; no I/O
    /// was performed.
    #[error("a call is already in flight on this client")]
    InFlight,
    /// The client's connection was discarded by an earlier failure.
    /// Call [`Client::reconnect`] before starting a new call.
    #[error("connection discarded; reconnect before starting a new call")]
    NotConnected,
    /// The serialized request is too long for the 4-byte length prefix.
    /// Synchronous; no I/O was performed.
    #[error("request of {len} bytes does not fit the frame length prefix")]
    RequestTooLarge {
        /// Serialized request length in bytes.
        len: usize,
    },
    /// Connect, read, or write failure. The connection is discarded.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),
    /// Oversized or malformed frame. Treated like a connection error.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    /// The deadline expired before the response was read. The connection
    /// is discarded; bytes of the abandoned response may still arrive.
    #[error("call deadline exceeded")]
    Timeout,
    /// Declared remote fault, decoded with its field values intact.
    #[error("declared remote fault: {0}")]
    Declared(Fault),
    /// Undeclared server-side failure.
    #[error("remote error: {0}")]
    Remote(String),
    /// The dispatcher was stopped before the call completed.
    #[error("dispatcher shut down before the call completed")]
    Shutdown,
}

impl From<io::Error> for RpcError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl RpcError {
    /// Returns `true` for the timeout failure kind.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Cloneable hand-off endpoint clients use to submit calls to the loop.
#[derive(Clone)]
pub(crate) struct SubmitHandle {
    submissions: Sender<Call>,
    waker: Arc<Waker>,
}

impl SubmitHandle {
    /// Enqueues a call and wakes the dispatch thread.
    ///
    /// Returns the call back to the caller if the dispatcher has stopped.
    pub(crate) fn submit(&self, call: Call) -> Result<(), Call> {
        match self.submissions.send(call) {
            Ok(()) => {
                // Wake failure means the loop is gone; the call will be
                // failed on the next drain or was already abandoned, which
                // the send above would have caught.
                let _ = self.waker.wake();
                Ok(())
            }
            Err(mpsc::SendError(call)) => Err(call),
        }
    }
}

/// Handle to a running dispatcher.
///
/// Dropping the handle signals shutdown but does not wait for the loop
/// thread to exit. Use [`Dispatcher::shutdown`] for graceful shutdown
/// with join.
pub struct Dispatcher {
    shutdown_flag: Arc<AtomicBool>,
    submit: SubmitHandle,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawns the dispatch thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll instance or waker cannot be created.
    /// These are fatal: without them no call can ever be driven.
    ///
    /// # Panics
    ///
    /// Panics if thread spawning fails.
    pub fn spawn(config: DispatchConfig) -> Result<Self, DispatchError> {
        info!(
            max_frame_len = config.max_frame_len,
            events_capacity = config.events_capacity,
            "dispatcher starting"
        );

        let poll = Poll::new().map_err(DispatchError::Poll)?;
        let waker =
            Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(DispatchError::Waker)?);

        let (submissions, receiver) = mpsc::channel::<Call>();
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let thread_flag = Arc::clone(&shutdown_flag);
        let handle = thread::Builder::new()
            .name("tether-dispatch".into())
            .spawn(move || {
                info!("dispatch thread started");
                let mut dispatch = DispatchThread::new(poll, receiver, thread_flag, &config);
                dispatch.run();
                info!("dispatch thread exiting");
            })
            .expect("failed to spawn dispatch thread");

        Ok(Self {
            shutdown_flag,
            submit: SubmitHandle { submissions, waker },
            handle: Some(handle),
        })
    }

    /// Initiates shutdown and waits for the loop thread to exit.
    ///
    /// Calls still pending or active are failed with [`RpcError::Shutdown`]
    /// through the normal completion path: their callbacks fire and their
    /// clients' outcomes are recorded.
    pub fn shutdown(mut self) {
        info!("dispatcher shutdown initiated");
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let _ = self.submit.waker.wake();

        if let Some(handle) = self.handle.take() {
            debug!("waiting for dispatch thread to exit");
            let _ = handle.join();
        }
        info!("dispatcher shutdown complete");
    }

    /// Returns the hand-off endpoint for client construction.
    pub(crate) fn submit_handle(&self) -> SubmitHandle {
        self.submit.clone()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Signal shutdown if not already done; shutdown() joins explicitly.
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let _ = self.submit.waker.wake();
    }
}
