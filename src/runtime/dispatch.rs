//! Dispatch loop thread.
//!
//! Responsibilities:
//! - Drain newly submitted calls from the hand-off queue and register their
//!   connections with the poll.
//! - Block on the poll, bounded by the soonest call deadline.
//! - Advance ready calls by one I/O step each.
//! - Sweep expired deadlines.
//! - Complete finished calls: remove from tracking, then invoke the
//!   completion sink inline (guarded against callback panics).
//!
//! This thread is the only one that ever touches call state; caller
//! threads only enqueue.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;
use mio::{Events, Poll, Token};

use crate::trace::{debug, error, info, trace, warn};

use super::call::{Call, Completion, CompletionFn};
use super::deadline::DeadlineQueue;
use super::{DispatchConfig, RpcError};

/// Token reserved for the loop waker.
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// Dispatch thread state and event loop.
pub(crate) struct DispatchThread {
    poll: Poll,
    events: Events,
    /// Hand-off queue of newly submitted calls.
    submissions: Receiver<Call>,
    shutdown: Arc<AtomicBool>,
    /// Calls currently tracked by the poll, keyed by their token.
    active: HashMap<Token, Call>,
    deadlines: DeadlineQueue,
    /// Monotonic token allocator; tokens are unique for the loop lifetime.
    next_token: usize,
    max_frame_len: u32,
    /// Scratch buffer of tokens ready this iteration.
    ready: Vec<Token>,
}

impl DispatchThread {
    pub(crate) fn new(
        poll: Poll,
        submissions: Receiver<Call>,
        shutdown: Arc<AtomicBool>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            submissions,
            shutdown,
            active: HashMap::new(),
            deadlines: DeadlineQueue::new(),
            next_token: WAKER_TOKEN.0 + 1,
            max_frame_len: config.max_frame_len,
            ready: Vec::new(),
        }
    }

    /// Runs the dispatch loop until shutdown is signalled or the poll
    /// itself fails.
    pub(crate) fn run(&mut self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                self.drain_on_shutdown();
                return;
            }

            self.register_pending();

            let timeout = self.deadlines.next_timeout(Instant::now());
            if let Err(e) = self.poll_once(timeout) {
                // Loop-level fault not tied to one call: fatal. Every
                // outstanding call is failed so its callback still fires.
                self.fail_everything(e);
                return;
            }

            self.ready.clear();
            for event in self.events.iter() {
                let token = event.token();
                if token != WAKER_TOKEN {
                    self.ready.push(token);
                }
            }
            for i in 0..self.ready.len() {
                let token = self.ready[i];
                self.step_call(token);
            }

            self.sweep_deadlines();
        }
    }

    fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                self.events.clear();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Merges newly submitted calls into the watch set.
    fn register_pending(&mut self) {
        while let Ok(mut call) = self.submissions.try_recv() {
            let token = Token(self.next_token);
            self.next_token += 1;

            call.set_max_frame_len(self.max_frame_len);
            if let Err(e) = call.register(self.poll.registry(), token) {
                warn!(token = token.0, error = %e, "failed to register call");
                Self::deliver(call.into_failure(e.into()));
                continue;
            }
            if let Some(at) = call.deadline() {
                self.deadlines.insert(token, at);
            }
            trace!(token = token.0, "call registered");
            self.active.insert(token, call);
        }
    }

    /// Advances one call by a single I/O step.
    fn step_call(&mut self, token: Token) {
        // A call can finish and vanish earlier in the same iteration;
        // readiness for an unknown token is simply stale.
        let step = match self.active.get_mut(&token) {
            Some(call) => call.step(),
            None => return,
        };

        match step {
            Ok(true) => self.finish_success(token),
            Ok(false) => {
                // Re-arm interest: readiness is edge-triggered, and the
                // interest itself flips from writable to readable once the
                // request is flushed.
                let rearm_err = {
                    let registry = self.poll.registry();
                    match self.active.get_mut(&token) {
                        Some(call) => call.reregister(registry, token).err(),
                        None => None,
                    }
                };
                if let Some(e) = rearm_err {
                    self.fail_call(token, e.into());
                }
            }
            Err(error) => {
                warn!(token = token.0, error = %error, "call failed");
                self.fail_call(token, error);
            }
        }
    }

    /// Fails every active call whose deadline has passed. Granularity is
    /// bounded by one poll interval, not exact to the nanosecond.
    fn sweep_deadlines(&mut self) {
        let now = Instant::now();
        while let Some(token) = self.deadlines.pop_expired(now) {
            if self.active.contains_key(&token) {
                debug!(token = token.0, "call deadline expired");
                self.fail_call(token, RpcError::Timeout);
            }
        }
    }

    /// Completes a terminally successful call.
    fn finish_success(&mut self, token: Token) {
        let Some(mut call) = self.active.remove(&token) else {
            return;
        };
        let _ = call.deregister(self.poll.registry());
        debug!(token = token.0, "call completed");
        Self::deliver(call.into_success());
    }

    /// Completes a failed call; its connection is dropped with it.
    fn fail_call(&mut self, token: Token, err: RpcError) {
        let Some(mut call) = self.active.remove(&token) else {
            return;
        };
        let _ = call.deregister(self.poll.registry());
        Self::deliver(call.into_failure(err));
    }

    /// Invokes a completion sink inline. A panicking callback must not
    /// crash the loop; delivery to unrelated calls continues.
    fn deliver((sink, completion): (CompletionFn, Completion)) {
        if catch_unwind(AssertUnwindSafe(|| sink(completion))).is_err() {
            error!("call callback panicked; dispatch loop continues");
        }
    }

    /// Shutdown path: abandoned calls are failed through the normal
    /// completion path so their callbacks still fire exactly once.
    fn drain_on_shutdown(&mut self) {
        let outstanding: Vec<Token> = self.active.keys().copied().collect();
        if !outstanding.is_empty() {
            info!(
                count = outstanding.len(),
                "failing active calls at shutdown"
            );
        }
        for token in outstanding {
            self.fail_call(token, RpcError::Shutdown);
        }
        while let Ok(call) = self.submissions.try_recv() {
            Self::deliver(call.into_failure(RpcError::Shutdown));
        }
    }

    /// Fatal loop fault: fail all outstanding and pending calls with the
    /// underlying error, then let the loop exit.
    fn fail_everything(&mut self, err: io::Error) {
        error!(error = %err, "poll failed; dispatch loop terminating");
        let shared = Arc::new(err);
        let outstanding: Vec<Token> = self.active.keys().copied().collect();
        for token in outstanding {
            self.fail_call(token, RpcError::Io(Arc::clone(&shared)));
        }
        while let Ok(call) = self.submissions.try_recv() {
            Self::deliver(call.into_failure(RpcError::Io(Arc::clone(&shared))));
        }
    }
}
