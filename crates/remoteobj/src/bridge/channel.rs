//! Duplex channel between the caller and owner sides of a handle.
//!
//! Each side has one endpoint behind its own async mutex, so at most one
//! request is in flight per endpoint. The channel also carries the shared
//! listening state used by both sides.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::{FutureExt, SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{Codec, FrameCodec, JsonCodec};
use super::protocol::{Request, Response};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The message could not be encoded. Nothing was written.
    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("channel closed by peer")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One side of the channel: sends `Tx`, receives `Rx`.
pub struct Endpoint<Tx, Rx> {
    reader: FramedRead<BoxedReader, FrameCodec<Rx>>,
    writer: FramedWrite<BoxedWriter, FrameCodec<Tx>>,
    /// Message found by `poll` and not yet taken by `recv`.
    pending: Option<Rx>,
}

impl<Tx, Rx> Endpoint<Tx, Rx>
where
    Tx: Serialize,
    Rx: DeserializeOwned,
{
    fn new(reader: BoxedReader, writer: BoxedWriter, codec: &Arc<dyn Codec>) -> Self {
        Self {
            reader: FramedRead::new(reader, FrameCodec::new(Arc::clone(codec))),
            writer: FramedWrite::new(writer, FrameCodec::new(Arc::clone(codec))),
            pending: None,
        }
    }

    pub async fn send(&mut self, message: Tx) -> Result<(), ChannelError> {
        self.writer.send(message).await
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Result<Rx, ChannelError> {
        if let Some(message) = self.pending.take() {
            return Ok(message);
        }
        match self.reader.next().await {
            Some(result) => result,
            None => Err(ChannelError::Closed),
        }
    }

    /// Whether a message is ready, without waiting. A message found here is
    /// returned by the next `recv`.
    pub fn poll(&mut self) -> Result<bool, ChannelError> {
        if self.pending.is_some() {
            return Ok(true);
        }
        match self.reader.next().now_or_never() {
            None => Ok(false),
            Some(None) => Err(ChannelError::Closed),
            Some(Some(result)) => {
                self.pending = Some(result?);
                Ok(true)
            }
        }
    }
}

/// Whether a service loop is listening, and which task runs it.
#[derive(Debug, Default)]
pub struct ListenState {
    listening: AtomicBool,
    owner: StdMutex<Option<tokio::task::Id>>,
}

impl ListenState {
    pub fn begin(&self, owner: tokio::task::Id) {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = Some(owner);
        self.listening.store(true, Ordering::SeqCst);
    }

    /// Drop the listening flag. The owner identity stays until `release`.
    pub fn end(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    pub fn release(&self) {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// True when called from the task currently running the service loop.
    pub fn is_current_context(&self) -> bool {
        let owner = *self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        match (tokio::task::try_id(), owner) {
            (Some(current), Some(owner)) => current == owner,
            _ => false,
        }
    }
}

pub struct Channel {
    caller: Mutex<Endpoint<Request, Response>>,
    owner: Mutex<Endpoint<Response, Request>>,
    listen: ListenState,
    codec_name: &'static str,
}

impl Channel {
    /// Connected Unix socket pair with the JSON codec.
    pub fn pair() -> Result<Self, ChannelError> {
        Self::pair_with_codec(Arc::new(JsonCodec))
    }

    pub fn pair_with_codec(codec: Arc<dyn Codec>) -> Result<Self, ChannelError> {
        let (caller, owner) = UnixStream::pair()?;
        Ok(Self::from_streams(caller, owner, codec))
    }

    /// Build a channel over two already-connected streams.
    pub fn from_streams<C, O>(caller: C, owner: O, codec: Arc<dyn Codec>) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        O: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (caller_rx, caller_tx) = tokio::io::split(caller);
        let (owner_rx, owner_tx) = tokio::io::split(owner);
        tracing::debug!(codec = codec.name(), "Creating handle channel");
        Self {
            caller: Mutex::new(Endpoint::new(
                Box::new(caller_rx),
                Box::new(caller_tx),
                &codec,
            )),
            owner: Mutex::new(Endpoint::new(Box::new(owner_rx), Box::new(owner_tx), &codec)),
            listen: ListenState::default(),
            codec_name: codec.name(),
        }
    }

    pub fn caller(&self) -> &Mutex<Endpoint<Request, Response>> {
        &self.caller
    }

    pub fn owner(&self) -> &Mutex<Endpoint<Response, Request>> {
        &self.owner
    }

    pub fn listen_state(&self) -> &ListenState {
        &self.listen
    }

    pub fn codec_name(&self) -> &'static str {
        self.codec_name
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("codec", &self.codec_name)
            .field("listen", &self.listen)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Payload;
    use crate::chain::Operation;
    use serde_json::json;
    use std::time::Duration;

    async fn wait_for_pending(endpoint: &mut Endpoint<Response, Request>) -> bool {
        for _ in 0..200 {
            if endpoint.poll().unwrap() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn request_and_response_cross_the_pair() {
        let channel = Channel::pair().unwrap();
        let request = Request::new(vec![Operation::item("x")]);

        channel.caller().lock().await.send(request.clone()).await.unwrap();
        let received = channel.owner().lock().await.recv().await.unwrap();
        assert_eq!(received, request);

        channel
            .owner()
            .lock()
            .await
            .send(Response::value(json!(1)))
            .await
            .unwrap();
        let reply = channel.caller().lock().await.recv().await.unwrap();
        assert_eq!(reply, Response::value(json!(1)));
    }

    #[tokio::test]
    async fn poll_without_message_is_false() {
        let channel = Channel::pair().unwrap();
        let mut owner = channel.owner().lock().await;
        assert!(!owner.poll().unwrap());
        assert!(!owner.poll().unwrap());
    }

    #[tokio::test]
    async fn polled_message_is_returned_by_recv() {
        let channel = Channel::pair().unwrap();
        let request = Request::new(vec![Operation::attr("a")]);
        channel.caller().lock().await.send(request.clone()).await.unwrap();

        let mut owner = channel.owner().lock().await;
        assert!(wait_for_pending(&mut owner).await);
        // Still pending until received.
        assert!(owner.poll().unwrap());
        assert_eq!(owner.recv().await.unwrap(), request);
        assert!(!owner.poll().unwrap());
    }

    #[tokio::test]
    async fn encode_failure_leaves_channel_usable() {
        let channel = Channel::pair().unwrap();
        let mut owner = channel.owner().lock().await;

        let err = owner
            .send(Response(Payload::opaque("'Widget' object"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Encode(_)));

        owner.send(Response::value(json!(null))).await.unwrap();
        let reply = channel.caller().lock().await.recv().await.unwrap();
        assert_eq!(reply, Response::value(json!(null)));
    }

    #[tokio::test]
    async fn dropped_peer_reports_closed() {
        let (caller, peer) = UnixStream::pair().unwrap();
        drop(peer);
        let (owner, _unused) = tokio::io::duplex(64);
        let channel = Channel::from_streams(caller, owner, Arc::new(JsonCodec));
        let err = channel.caller().lock().await.recv().await.unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }

    #[tokio::test]
    async fn listen_state_tracks_owner_task() {
        let state = Arc::new(ListenState::default());
        assert!(!state.is_listening());
        assert!(!state.is_current_context());

        let inner = Arc::clone(&state);
        tokio::spawn(async move {
            inner.begin(tokio::task::id());
            assert!(inner.is_current_context());
        })
        .await
        .unwrap();

        assert!(state.is_listening());
        assert!(!state.is_current_context());

        state.end();
        assert!(!state.is_listening());
        state.release();
        assert!(!state.is_current_context());
    }
}
