//! Wire layer between the caller and owner sides of a remote handle.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, Response, ErrorEnvelope)
//! - **codec**: Length-prefixed framing over a pluggable value codec
//! - **channel**: Duplex endpoints, per-endpoint locks, listening state

pub mod channel;
pub mod codec;
pub mod protocol;
