//! Asynchronous RPC client engine.
//!
//! Callers issue a remote-procedure-call without blocking their own thread.
//! A single dedicated dispatch thread multiplexes all outstanding calls over
//! non-blocking sockets, enforces per-call deadlines, and delivers exactly
//! one outcome (success, declared remote fault, or failure) to a
//! caller-supplied callback.
//!
//! # Architecture
//!
//! - [`runtime::Dispatcher`]: owns the poll loop thread; new calls are handed
//!   off through a concurrent queue and a waker.
//! - [`runtime::Client`]: a caller-facing handle bound to one connection;
//!   enforces at most one in-flight call at a time.
//! - [`net::Connection`]: non-blocking TCP wrapper registered with the poll.
//! - [`codec`]: the narrow reply-envelope surface shared with servers.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//!
//! use tether::codec;
//! use tether::net::Endpoint;
//! use tether::runtime::{Client, DispatchConfig, Dispatcher};
//!
//! let dispatcher = Dispatcher::spawn(DispatchConfig::default())?;
//! let client = Client::connect(&dispatcher, Endpoint::localhost(9090))?;
//!
//! let request = codec::encode_message(&1i32)?;
//! client.start_call(request, Some(Duration::from_secs(5)), false, Box::new(|result| {
//!     match result {
//!         Ok(payload) => println!("reply: {:?}", codec::decode_message::<i32>(&payload)),
//!         Err(err) => eprintln!("call failed: {err}"),
//!     }
//! }))?;
//! ```

pub mod codec;
pub mod net;
pub mod runtime;

mod trace;

pub use trace::init_tracing;
