//! Caller-facing client handle.
//!
//! A [`Client`] is bound to exactly one connection and enforces at most one
//! in-flight call at a time. The dispatch thread writes the outcome fields
//! and clears the in-flight flag *before* the callback fires, so by the
//! time a callback runs, the client already accepts the next call.
//!
//! Outcome reads after a callback has observably fired are safe; reads
//! concurrent with an in-progress call are racy by design — the
//! single-flight invariant is the intended guard, not a general lock.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use minstant::Instant;

use crate::codec::{self, ReplyEnvelope};
use crate::net::{Connection, Endpoint};
use crate::trace::debug;

use super::call::{Call, Completion, CompletionFn};
use super::{Dispatcher, ProtocolViolation, RpcError, SubmitHandle};

/// Caller-supplied completion callback.
///
/// Exactly one of the two notifications fires, once: `Ok` with the decoded
/// reply payload (empty for oneway), or `Err` with the failure. Invoked on
/// the dispatch thread — keep it cheap or hand work elsewhere.
pub type ResponseCallback = Box<dyn FnOnce(Result<Vec<u8>, RpcError>) + Send>;

/// Outcome of the most recently completed call.
#[derive(Debug, Clone, Default)]
enum LastOutcome {
    /// No call has completed yet.
    #[default]
    Idle,
    Success,
    Failed(RpcError),
}

struct ClientShared {
    /// Single-flight guard: at most one outstanding call.
    in_flight: AtomicBool,
    /// The owned connection; `None` while a call has it in flight or after
    /// a failure discarded it.
    conn: Mutex<Option<Connection>>,
    outcome: Mutex<LastOutcome>,
}

/// A caller-facing handle bound to one connection.
///
/// Create with [`Client::connect`], then issue calls with
/// [`Client::start_call`]. After a failed call the connection is discarded
/// and [`Client::reconnect`] must be called before the next call.
pub struct Client {
    submit: SubmitHandle,
    endpoint: Endpoint,
    shared: Arc<ClientShared>,
}

impl Client {
    /// Creates a client with a fresh non-blocking connection to `endpoint`.
    ///
    /// The connect is initiated here and completed by the dispatch thread
    /// when the first call is driven; this never blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the connect cannot be initiated.
    pub fn connect(dispatcher: &Dispatcher, endpoint: Endpoint) -> io::Result<Self> {
        let conn = Connection::connect(endpoint)?;
        Ok(Self {
            submit: dispatcher.submit_handle(),
            endpoint,
            shared: Arc::new(ClientShared {
                in_flight: AtomicBool::new(false),
                conn: Mutex::new(Some(conn)),
                outcome: Mutex::new(LastOutcome::Idle),
            }),
        })
    }

    /// The endpoint this client is bound to.
    #[must_use]
    pub const fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Replaces a discarded connection with a fresh one.
    ///
    /// A connection that saw a failure or timeout cannot be trusted for
    /// reuse — bytes of an abandoned response may still be in flight — so
    /// the engine discards it and requires this explicit step.
    ///
    /// # Errors
    ///
    /// [`RpcError::InFlight`] if a call is outstanding, [`RpcError::Io`] if
    /// the new connect cannot be initiated.
    pub fn reconnect(&self) -> Result<(), RpcError> {
        if self.shared.in_flight.load(Ordering::Acquire) {
            return Err(RpcError::InFlight);
        }
        let conn = Connection::connect(self.endpoint)?;
        debug!(endpoint = %self.endpoint, "client reconnected");
        *self.shared.conn.lock().expect("lock poisoned") = Some(conn);
        Ok(())
    }

    /// Starts an asynchronous call and returns without blocking.
    ///
    /// `request` is the fully-serialized payload; the engine adds the
    /// length prefix. `timeout` is converted to an absolute deadline now;
    /// `None` means the call never times out. For a oneway call the
    /// callback fires with an empty payload as soon as the request is
    /// flushed, without waiting for any bytes from the peer.
    ///
    /// # Errors
    ///
    /// Fails synchronously, performing no I/O, with [`RpcError::InFlight`]
    /// if a call is already outstanding, [`RpcError::NotConnected`] if the
    /// connection was discarded, [`RpcError::RequestTooLarge`] if the
    /// payload length does not fit the 4-byte prefix, or
    /// [`RpcError::Shutdown`] if the dispatcher has stopped.
    pub fn start_call(
        &self,
        request: Vec<u8>,
        timeout: Option<Duration>,
        oneway: bool,
        callback: ResponseCallback,
    ) -> Result<(), RpcError> {
        if u32::try_from(request.len()).is_err() {
            return Err(RpcError::RequestTooLarge {
                len: request.len(),
            });
        }

        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(RpcError::InFlight);
        }

        let conn = match self.shared.conn.lock().expect("lock poisoned").take() {
            Some(conn) => conn,
            None => {
                self.shared.in_flight.store(false, Ordering::Release);
                return Err(RpcError::NotConnected);
            }
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        let shared = Arc::clone(&self.shared);
        let sink: CompletionFn = Box::new(move |completion| {
            let result = match completion {
                Completion::Success { frame, conn } => {
                    // The connection survived; return it for the next call.
                    *shared.conn.lock().expect("lock poisoned") = Some(conn);
                    if oneway {
                        Ok(Vec::new())
                    } else {
                        decode_reply(&frame)
                    }
                }
                Completion::Failure { error } => Err(error),
            };

            // Outcome and single-flight are settled before the callback so
            // the client is already eligible for a new call when it runs.
            let outcome = match &result {
                Ok(_) => LastOutcome::Success,
                Err(e) => LastOutcome::Failed(e.clone()),
            };
            *shared.outcome.lock().expect("lock poisoned") = outcome;
            shared.in_flight.store(false, Ordering::Release);

            callback(result);
        });

        let call = Call::new(conn, &request, deadline, oneway, sink);
        match self.submit.submit(call) {
            Ok(()) => Ok(()),
            Err(abandoned) => {
                // The synchronous error is the single notification here;
                // recover the sink so it cannot also fire on drop.
                drop(abandoned.take_sink());
                self.shared.in_flight.store(false, Ordering::Release);
                Err(RpcError::Shutdown)
            }
        }
    }

    /// Whether the most recently completed call failed (any kind,
    /// including timeout). `false` before any call completes.
    #[must_use]
    pub fn has_error(&self) -> bool {
        matches!(
            *self.shared.outcome.lock().expect("lock poisoned"),
            LastOutcome::Failed(_)
        )
    }

    /// Whether the most recently completed call failed with a timeout.
    #[must_use]
    pub fn has_timeout(&self) -> bool {
        matches!(
            *self.shared.outcome.lock().expect("lock poisoned"),
            LastOutcome::Failed(RpcError::Timeout)
        )
    }

    /// The error of the most recently completed call, if it failed.
    #[must_use]
    pub fn get_error(&self) -> Option<RpcError> {
        match &*self.shared.outcome.lock().expect("lock poisoned") {
            LastOutcome::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }
}

/// Maps a response frame to the callback's result. Runs on the dispatch
/// thread, so deserialization cost lands there, not on the caller.
fn decode_reply(frame: &[u8]) -> Result<Vec<u8>, RpcError> {
    match codec::decode_envelope(frame) {
        Ok(ReplyEnvelope::Ok(payload)) => Ok(payload),
        Ok(ReplyEnvelope::Fault(fault)) => Err(RpcError::Declared(fault)),
        Ok(ReplyEnvelope::Error(msg)) => Err(RpcError::Remote(msg)),
        Err(_) => Err(RpcError::Protocol(ProtocolViolation::MalformedEnvelope)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Fault;

    #[test]
    fn reply_envelope_maps_to_callback_result() {
        let ok = codec::encode_envelope(&ReplyEnvelope::Ok(vec![1, 2])).unwrap();
        assert_eq!(decode_reply(&ok).unwrap(), vec![1, 2]);

        let fault = codec::encode_envelope(&ReplyEnvelope::Fault(Fault::new("blah"))).unwrap();
        match decode_reply(&fault).unwrap_err() {
            RpcError::Declared(f) => {
                assert_eq!(f.message, "blah");
                assert!(f.fields.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }

        let remote =
            codec::encode_envelope(&ReplyEnvelope::Error("Unexpected!".to_string())).unwrap();
        assert!(matches!(
            decode_reply(&remote).unwrap_err(),
            RpcError::Remote(msg) if msg == "Unexpected!"
        ));
    }

    #[test]
    fn malformed_envelope_is_a_protocol_violation() {
        assert!(matches!(
            decode_reply(&[0xff, 0xff, 0xff]).unwrap_err(),
            RpcError::Protocol(ProtocolViolation::MalformedEnvelope)
        ));
    }
}
