//! remoteobj: deferred operation chains against objects owned by a service loop.
//!
//! The owner exposes a [`Target`] and runs the service loop; callers build
//! chains on a [`RemoteHandle`] and resolve them over a local channel.

pub mod bridge;
pub mod chain;
pub mod config;
pub mod error;
pub mod handle;
pub mod logging;
pub mod service;
pub mod session;
pub mod target;

pub use bridge::codec::{Codec, CodecError, JsonCodec};
pub use bridge::protocol::HandleId;
pub use chain::{Chain, ChainError, Operation};
pub use config::{AccessPolicy, HandleConfig};
pub use error::{Fault, RemoteError, RemoteFault};
pub use handle::{RemoteHandle, Reply, Side};
pub use service::{HandleStats, ServiceState};
pub use session::Session;
pub use target::{Args, FunctionTable, Member, Output, SharedMap, Subject, Target};
