//! Networking primitives for the dispatch loop.
//!
//! Currently mio-based; endpoint types are kept transport-agnostic so the
//! engine can grow alternative stream transports without API churn.

pub mod endpoint;
pub mod socket;

pub use endpoint::Endpoint;
pub use socket::Connection;
