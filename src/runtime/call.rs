//! Per-call state machine and buffering.
//!
//! A [`Call`] is one outstanding request/response exchange. It owns its
//! connection and its write/read buffers for the whole flight; once
//! registered, only the dispatch thread touches it. States move strictly
//! forward; partial reads and writes re-enter the same state and resume
//! from the recorded offset, so no byte is replayed or dropped.

use std::io::{self, ErrorKind};
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};

use minstant::Instant;
use mio::{Interest, Registry, Token};

use crate::net::Connection;
use crate::runtime::{ProtocolViolation, RpcError};
use crate::trace::error;

/// Width of the response length prefix, big-endian unsigned.
pub(crate) const SIZE_PREFIX_LEN: usize = 4;

/// Terminal result of a call, handed to the completion sink.
pub(crate) enum Completion {
    /// Response frame fully read (empty for oneway and zero-length
    /// frames). The connection survived and is returned for reuse.
    Success {
        /// The response frame body.
        frame: Vec<u8>,
        /// The connection, still usable.
        conn: Connection,
    },
    /// The call failed; the connection is discarded, not returned.
    Failure {
        /// Why the call failed.
        error: RpcError,
    },
}

/// Exactly one sink per call, invoked exactly once, on the dispatch thread.
pub(crate) type CompletionFn = Box<dyn FnOnce(Completion) + Send>;

/// Holds the sink until the call completes. If the call is dropped first
/// (left in the hand-off queue when the dispatch thread exits, for
/// example), the sink still fires with [`RpcError::Shutdown`], so no
/// caller is ever left waiting on a callback that will never come.
struct CompletionSink {
    sink: Option<CompletionFn>,
}

impl CompletionSink {
    fn new(sink: CompletionFn) -> Self {
        Self { sink: Some(sink) }
    }

    /// Takes the sink out, disarming the drop fuse.
    fn take(mut self) -> CompletionFn {
        self.sink.take().expect("completion sink already taken")
    }
}

impl Drop for CompletionSink {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            let failure = Completion::Failure {
                error: RpcError::Shutdown,
            };
            if catch_unwind(AssertUnwindSafe(|| sink(failure))).is_err() {
                error!("call callback panicked during teardown");
            }
        }
    }
}

enum State {
    /// Waiting for the non-blocking connect to complete.
    Connecting,
    /// Flushing the framed request; `written` bytes already on the wire.
    WritingRequest { written: usize },
    /// Reading the fixed-width length prefix.
    ReadingSizePrefix {
        buf: [u8; SIZE_PREFIX_LEN],
        filled: usize,
    },
    /// Reading exactly the declared number of body bytes.
    ReadingBody { body: Vec<u8>, filled: usize },
    /// Terminal: the full response frame is buffered.
    ResponseRead { frame: Vec<u8> },
}

/// A single outstanding request/response exchange.
pub(crate) struct Call {
    conn: Connection,
    /// Length prefix + serialized request, flushed front to back.
    wire: Vec<u8>,
    deadline: Option<Instant>,
    oneway: bool,
    /// Set by the dispatch thread at registration from its config.
    max_frame_len: u32,
    state: State,
    complete: CompletionSink,
}

impl Call {
    /// Builds a call around an owned connection and a fully-serialized
    /// request payload. The 4-byte big-endian length prefix is prepended
    /// here; serialization itself happened before.
    pub(crate) fn new(
        conn: Connection,
        request: &[u8],
        deadline: Option<Instant>,
        oneway: bool,
        complete: CompletionFn,
    ) -> Self {
        // Oversized requests are rejected at submission, before the
        // connection changes hands.
        debug_assert!(u32::try_from(request.len()).is_ok());
        let mut wire = Vec::with_capacity(SIZE_PREFIX_LEN + request.len());
        wire.extend_from_slice(&(request.len() as u32).to_be_bytes());
        wire.extend_from_slice(request);

        let state = if conn.is_established() {
            State::WritingRequest { written: 0 }
        } else {
            State::Connecting
        };

        Self {
            conn,
            wire,
            deadline,
            oneway,
            max_frame_len: u32::MAX,
            state,
            complete: CompletionSink::new(complete),
        }
    }

    /// Absolute expiry instant, if the call has a deadline.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Installs the dispatcher's frame length cap. Done once at
    /// registration, before any response byte is read.
    pub(crate) fn set_max_frame_len(&mut self, max: u32) {
        self.max_frame_len = max;
    }

    /// The readiness interest the current state waits on.
    pub(crate) fn interest(&self) -> Interest {
        match self.state {
            State::Connecting | State::WritingRequest { .. } => Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }

    /// Registers the connection with the poll under `token`.
    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = self.interest();
        registry.register(&mut self.conn, token, interest)
    }

    /// Re-arms readiness interest. mio readiness is edge-triggered, so the
    /// loop re-arms after every partial step; this also picks up the
    /// writable→readable flip after the request is flushed.
    pub(crate) fn reregister(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = self.interest();
        registry.reregister(&mut self.conn, token, interest)
    }

    /// Removes the connection from the poll.
    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.conn)
    }

    /// Advances the state machine by one non-blocking I/O attempt.
    ///
    /// Returns `Ok(true)` once the call has reached its terminal success
    /// state. Never loops until exhaustion: one read or write attempt per
    /// readiness event keeps the dispatch thread responsive to other calls.
    ///
    /// # Errors
    ///
    /// Any error is terminal for the call; the dispatcher completes it
    /// with the failure and discards the connection.
    pub(crate) fn step(&mut self) -> Result<bool, RpcError> {
        match self.state {
            State::Connecting => {
                if self.conn.try_finish_connect().map_err(RpcError::from)? {
                    self.state = State::WritingRequest { written: 0 };
                    self.write_step()
                } else {
                    Ok(false)
                }
            }
            State::WritingRequest { .. } => self.write_step(),
            State::ReadingSizePrefix { .. } => self.read_prefix_step(),
            State::ReadingBody { .. } => self.read_body_step(),
            State::ResponseRead { .. } => Ok(true),
        }
    }

    fn write_step(&mut self) -> Result<bool, RpcError> {
        let State::WritingRequest { written } = &mut self.state else {
            unreachable!("write_step outside WritingRequest");
        };
        match self.conn.try_write(&self.wire[*written..])? {
            None => Ok(false),
            Some(0) => Err(io::Error::from(ErrorKind::WriteZero).into()),
            Some(n) => {
                *written += n;
                if *written < self.wire.len() {
                    return Ok(false);
                }
                // Request fully flushed. A oneway call is done here and
                // must never wait for bytes from the peer.
                if self.oneway {
                    self.state = State::ResponseRead { frame: Vec::new() };
                    Ok(true)
                } else {
                    self.state = State::ReadingSizePrefix {
                        buf: [0; SIZE_PREFIX_LEN],
                        filled: 0,
                    };
                    Ok(false)
                }
            }
        }
    }

    fn read_prefix_step(&mut self) -> Result<bool, RpcError> {
        let State::ReadingSizePrefix { buf, filled } = &mut self.state else {
            unreachable!("read_prefix_step outside ReadingSizePrefix");
        };
        match self.conn.try_read(&mut buf[*filled..])? {
            None => Ok(false),
            Some(0) => Err(ProtocolViolation::TruncatedFrame.into()),
            Some(n) => {
                *filled += n;
                if *filled < SIZE_PREFIX_LEN {
                    return Ok(false);
                }
                let len = u32::from_be_bytes(*buf);
                if len > self.max_frame_len {
                    return Err(ProtocolViolation::FrameTooLarge {
                        len,
                        max: self.max_frame_len,
                    }
                    .into());
                }
                if len == 0 {
                    self.state = State::ResponseRead { frame: Vec::new() };
                    return Ok(true);
                }
                // The declared length sizes the body buffer exactly.
                self.state = State::ReadingBody {
                    body: vec![0; len as usize],
                    filled: 0,
                };
                Ok(false)
            }
        }
    }

    fn read_body_step(&mut self) -> Result<bool, RpcError> {
        let State::ReadingBody { body, filled } = &mut self.state else {
            unreachable!("read_body_step outside ReadingBody");
        };
        match self.conn.try_read(&mut body[*filled..])? {
            None => Ok(false),
            Some(0) => Err(ProtocolViolation::TruncatedFrame.into()),
            Some(n) => {
                *filled += n;
                if *filled < body.len() {
                    return Ok(false);
                }
                let frame = mem::take(body);
                self.state = State::ResponseRead { frame };
                Ok(true)
            }
        }
    }

    /// Consumes a terminally successful call, yielding the sink and the
    /// success completion carrying the frame and the surviving connection.
    pub(crate) fn into_success(self) -> (CompletionFn, Completion) {
        let Self {
            conn,
            state,
            complete,
            ..
        } = self;
        let State::ResponseRead { frame } = state else {
            unreachable!("into_success before terminal state");
        };
        (complete.take(), Completion::Success { frame, conn })
    }

    /// Consumes a failed call, yielding the sink and the failure
    /// completion. The connection is dropped here: a connection with an
    /// abandoned call on it cannot be trusted for reuse.
    pub(crate) fn into_failure(self, error: RpcError) -> (CompletionFn, Completion) {
        (self.complete.take(), Completion::Failure { error })
    }

    /// Recovers the sink without firing it. For the submission path that
    /// reports its failure synchronously instead: exactly one of the two
    /// notifications may happen.
    pub(crate) fn take_sink(self) -> CompletionFn {
        self.complete.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Endpoint;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn noop_sink() -> CompletionFn {
        Box::new(|_| {})
    }

    /// Connects a call to a fresh listener and returns the accepted peer.
    fn call_with_peer(request: &[u8], oneway: bool) -> (Call, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = Connection::connect(Endpoint::from(addr)).unwrap();
        let call = Call::new(conn, request, None, oneway, noop_sink());
        let (peer, _) = listener.accept().unwrap();
        (call, peer)
    }

    /// Steps until `done` or the attempt budget runs out.
    fn step_until_done(call: &mut Call) -> Result<bool, RpcError> {
        for _ in 0..200 {
            if call.step()? {
                return Ok(true);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(false)
    }

    #[test]
    fn dropped_call_fails_through_its_sink() {
        let (tx, rx) = std::sync::mpsc::channel();
        let sink: CompletionFn = Box::new(move |completion| {
            let _ = tx.send(match completion {
                Completion::Failure { error } => error,
                Completion::Success { .. } => panic!("unexpected success"),
            });
        });
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let conn = Connection::connect(Endpoint::from(listener.local_addr().unwrap())).unwrap();

        // Never registered, never driven: dropping the call must still
        // deliver exactly one failure.
        drop(Call::new(conn, &[1], None, false, sink));

        assert!(matches!(rx.try_recv().unwrap(), RpcError::Shutdown));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn completion_consumes_the_sink_exactly_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let sink: CompletionFn = Box::new(move |_| {
            let _ = tx.send(());
        });
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let conn = Connection::connect(Endpoint::from(listener.local_addr().unwrap())).unwrap();
        let call = Call::new(conn, &[1], None, true, sink);

        let (deliver, completion) = call.into_failure(RpcError::Timeout);
        deliver(completion);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn request_is_length_prefixed_on_the_wire() {
        let (mut call, mut peer) = call_with_peer(&[1, 2, 3], true);
        assert!(step_until_done(&mut call).unwrap());

        let mut wire = [0u8; 7];
        peer.read_exact(&mut wire).unwrap();
        assert_eq!(wire, [0, 0, 0, 3, 1, 2, 3]);
    }

    #[test]
    fn interest_follows_state() {
        let (mut call, mut peer) = call_with_peer(&[9], false);
        assert_eq!(call.interest(), Interest::WRITABLE);

        // Flush the request; the call flips to waiting for the response.
        for _ in 0..200 {
            call.step().unwrap();
            if call.interest() == Interest::READABLE {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(call.interest(), Interest::READABLE);

        let mut wire = [0u8; 5];
        peer.read_exact(&mut wire).unwrap();
    }

    #[test]
    fn response_read_across_partial_writes_from_peer() {
        let (mut call, mut peer) = call_with_peer(&[7], false);

        let handle = std::thread::spawn(move || {
            let mut req = [0u8; 5];
            peer.read_exact(&mut req).unwrap();
            // Prefix and body in separate writes, body split in two.
            peer.write_all(&4u32.to_be_bytes()).unwrap();
            peer.flush().unwrap();
            std::thread::sleep(Duration::from_millis(10));
            peer.write_all(&[0xaa, 0xbb]).unwrap();
            std::thread::sleep(Duration::from_millis(10));
            peer.write_all(&[0xcc, 0xdd]).unwrap();
        });

        assert!(step_until_done(&mut call).unwrap());
        handle.join().unwrap();

        let (_, completion) = call.into_success();
        match completion {
            Completion::Success { frame, .. } => assert_eq!(frame, vec![0xaa, 0xbb, 0xcc, 0xdd]),
            Completion::Failure { error } => panic!("unexpected failure: {error}"),
        }
    }

    #[test]
    fn oneway_finishes_without_reading() {
        let (mut call, mut peer) = call_with_peer(&[1], true);
        assert!(step_until_done(&mut call).unwrap());

        let (_, completion) = call.into_success();
        match completion {
            Completion::Success { frame, .. } => assert!(frame.is_empty()),
            Completion::Failure { error } => panic!("unexpected failure: {error}"),
        }

        // The request still made it out.
        let mut wire = [0u8; 5];
        peer.read_exact(&mut wire).unwrap();
        assert_eq!(wire, [0, 0, 0, 1, 1]);
    }

    #[test]
    fn oversized_prefix_is_a_protocol_violation() {
        let (mut call, mut peer) = call_with_peer(&[1], false);
        call.set_max_frame_len(1024);

        let handle = std::thread::spawn(move || {
            let mut req = [0u8; 5];
            peer.read_exact(&mut req).unwrap();
            peer.write_all(&(u32::MAX).to_be_bytes()).unwrap();
            // Keep the peer open so the error comes from the prefix check,
            // not from EOF.
            std::thread::sleep(Duration::from_millis(50));
        });

        let err = step_until_done(&mut call).unwrap_err();
        assert!(matches!(
            err,
            RpcError::Protocol(ProtocolViolation::FrameTooLarge { max: 1024, .. })
        ));
        handle.join().unwrap();
    }

    #[test]
    fn peer_close_mid_frame_is_truncated() {
        let (mut call, mut peer) = call_with_peer(&[1], false);

        let handle = std::thread::spawn(move || {
            let mut req = [0u8; 5];
            peer.read_exact(&mut req).unwrap();
            // Declare 8 bytes, deliver 2, hang up.
            peer.write_all(&8u32.to_be_bytes()).unwrap();
            peer.write_all(&[1, 2]).unwrap();
        });

        let err = step_until_done(&mut call).unwrap_err();
        handle.join().unwrap();
        assert!(matches!(
            err,
            RpcError::Protocol(ProtocolViolation::TruncatedFrame)
        ));
    }

    #[test]
    fn zero_length_frame_completes_empty() {
        let (mut call, mut peer) = call_with_peer(&[1], false);

        let handle = std::thread::spawn(move || {
            let mut req = [0u8; 5];
            peer.read_exact(&mut req).unwrap();
            peer.write_all(&0u32.to_be_bytes()).unwrap();
            std::thread::sleep(Duration::from_millis(20));
        });

        assert!(step_until_done(&mut call).unwrap());
        handle.join().unwrap();

        let (_, completion) = call.into_success();
        match completion {
            Completion::Success { frame, .. } => assert!(frame.is_empty()),
            Completion::Failure { error } => panic!("unexpected failure: {error}"),
        }
    }
}
