//! Remote handles: a chain bound to a channel and an owning target.
//!
//! The owner exposes a [`Target`] and drives the service loop (see
//! [`crate::service`]). Callers build chains with the builder methods and
//! resolve them; resolution is the only step that touches the channel.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use serde_json::Value;

use crate::bridge::channel::{Channel, ChannelError};
use crate::bridge::protocol::{HandleId, Payload, Request, Response};
use crate::chain::{Chain, Operation, ResolveContext, Resolved};
use crate::config::HandleConfig;
use crate::error::RemoteError;
use crate::service::{Stats, Worker};
use crate::target::{Args, FunctionTable, Target};

/// State shared by every view of one exposed target.
pub(crate) struct Core {
    pub(crate) id: HandleId,
    pub(crate) channel: Channel,
    pub(crate) target: Arc<dyn Target>,
    pub(crate) context: ResolveContext,
    pub(crate) config: HandleConfig,
    pub(crate) worker: tokio::sync::Mutex<Option<Worker>>,
    pub(crate) stopping: AtomicBool,
    pub(crate) stats: Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Exposed the target; may drive the service loop.
    Owner,
    Caller,
}

/// A deferred reference to a value reachable from a remote target.
#[derive(Clone)]
pub struct RemoteHandle {
    pub(crate) core: Arc<Core>,
    chain: Chain,
    default: Option<Value>,
    eager: bool,
    side: Side,
}

/// What resolving a handle produced.
#[derive(Debug, Clone)]
pub enum Reply {
    Value(Value),
    /// The chain resolved to the target itself.
    Handle(RemoteHandle),
}

impl Reply {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Handle(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Handle(_) => None,
        }
    }

    pub fn into_handle(self) -> Option<RemoteHandle> {
        match self {
            Self::Handle(handle) => Some(handle),
            Self::Value(_) => None,
        }
    }

    pub fn is_handle(&self) -> bool {
        matches!(self, Self::Handle(_))
    }
}

impl RemoteHandle {
    /// Expose `target` on a fresh channel. The returned handle is the owner
    /// view with an empty chain; nothing listens until `start()`.
    pub fn expose(target: Arc<dyn Target>, config: HandleConfig) -> Result<Self, RemoteError> {
        Self::expose_with(target, config, FunctionTable::default())
    }

    /// Like [`RemoteHandle::expose`], with functions available to pass-to.
    pub fn expose_with(
        target: Arc<dyn Target>,
        config: HandleConfig,
        functions: FunctionTable,
    ) -> Result<Self, RemoteError> {
        let channel = Channel::pair_with_codec(Arc::clone(&config.codec))?;
        let id = HandleId::new();
        tracing::debug!(handle = %id, target = target.type_name(), codec = channel.codec_name(), "Exposing target");

        let core = Core {
            id,
            channel,
            target,
            context: ResolveContext::new(functions, config.access.clone()),
            worker: tokio::sync::Mutex::new(None),
            stopping: AtomicBool::new(false),
            stats: Stats::default(),
            config,
        };
        Ok(Self {
            default: core.config.default.clone(),
            eager: core.config.eager,
            core: Arc::new(core),
            chain: Chain::new(),
            side: Side::Owner,
        })
    }

    pub fn id(&self) -> HandleId {
        self.core.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_owner(&self) -> bool {
        self.side == Side::Owner
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Render the chain, e.g. `(?.method(1, 2))`.
    pub fn describe(&self) -> String {
        self.chain.describe()
    }

    /// Same side and settings, empty chain.
    pub fn root(&self) -> Self {
        Self {
            chain: Chain::new(),
            ..self.clone()
        }
    }

    /// A caller view of this handle.
    pub fn caller(&self) -> Self {
        Self {
            side: Side::Caller,
            ..self.clone()
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn without_default(mut self) -> Self {
        self.default = None;
        self
    }

    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn is_eager(&self) -> bool {
        self.eager
    }

    /// A new handle with `op` appended to the chain.
    pub fn extend(&self, op: Operation) -> Result<Self, RemoteError> {
        Ok(Self {
            chain: self.chain.extend(op)?,
            ..self.clone()
        })
    }

    pub fn attr(&self, name: impl Into<String>) -> Result<Self, RemoteError> {
        self.extend(Operation::attr(name))
    }

    pub fn item(&self, key: impl Into<Value>) -> Result<Self, RemoteError> {
        self.extend(Operation::item(key))
    }

    pub fn call(&self, args: Vec<Value>) -> Result<Self, RemoteError> {
        self.call_with(Args::new(args))
    }

    pub fn call_with(&self, args: Args) -> Result<Self, RemoteError> {
        self.extend(Operation::call(args))
    }

    pub fn pass_to(
        &self,
        function: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Self, RemoteError> {
        self.extend(Operation::pass_to(function, Args::new(args)))
    }

    /// Extend the chain; resolve right away when the handle is eager.
    pub async fn apply(&self, op: Operation) -> Result<Reply, RemoteError> {
        let extended = self.extend(op)?;
        if extended.eager {
            extended.resolve().await
        } else {
            Ok(Reply::Handle(extended))
        }
    }

    /// Assign an attribute of the current value. Always resolved immediately.
    pub async fn set_attr(
        &self,
        name: impl Into<String>,
        value: Value,
    ) -> Result<(), RemoteError> {
        self.extend(Operation::set_attr(name, value))?.resolve().await?;
        Ok(())
    }

    /// Assign an item of the current value. Always resolved immediately.
    pub async fn set_item(
        &self,
        key: impl Into<Value>,
        value: Value,
    ) -> Result<(), RemoteError> {
        self.extend(Operation::set_item(key, value))?.resolve().await?;
        Ok(())
    }

    /// Resolve the chain, falling back to the handle's default when no
    /// service loop is listening.
    pub async fn resolve(&self) -> Result<Reply, RemoteError> {
        self.resolve_with(self.default.clone()).await
    }

    pub async fn resolve_or(&self, default: Value) -> Result<Reply, RemoteError> {
        self.resolve_with(Some(default)).await
    }

    async fn resolve_with(&self, default: Option<Value>) -> Result<Reply, RemoteError> {
        let core = &self.core;
        let listen = core.channel.listen_state();

        if listen.is_current_context() {
            tracing::trace!(handle = %core.id, chain = %self.chain, "Resolving in service context");
            let resolved = self
                .chain
                .resolve(&core.target, &core.context)
                .await
                .map_err(RemoteError::Resolution)?;
            return self.local_reply(resolved);
        }

        // The exchange runs on its own task so a dropped resolve cannot leave
        // a response behind for the next caller to read.
        let exchange = tokio::spawn(exchange(
            Arc::clone(core),
            Request::from(&self.chain),
            self.chain.describe(),
        ));
        let response = match exchange.await {
            Ok(response) => response?,
            Err(e) => return Err(RemoteError::Panicked(e.to_string())),
        };
        let Some(Response(payload, error)) = response else {
            tracing::trace!(handle = %core.id, chain = %self.chain, "Not listening, using default");
            return default.map(Reply::Value).ok_or(RemoteError::NotRunning);
        };

        if let Some(envelope) = error {
            tracing::debug!(handle = %core.id, kind = %envelope.kind, "Chain raised remotely");
            return Err(RemoteError::Remote(envelope.into()));
        }
        match payload {
            Payload::SelfRef => Ok(Reply::Handle(self.root())),
            Payload::Value(value) => Ok(Reply::Value(value)),
            Payload::Opaque(description) => Err(ChannelError::Decode(format!(
                "unexpected opaque payload: {description}"
            ))
            .into()),
        }
    }

    /// Reply for a chain resolved without crossing the channel. Values with no
    /// representation follow the same encoding policy as the service loop.
    fn local_reply(&self, resolved: Resolved) -> Result<Reply, RemoteError> {
        match resolved {
            Resolved::Root => Ok(Reply::Handle(self.root())),
            Resolved::Value(value) => Ok(Reply::Value(value)),
            Resolved::Opaque(description) => {
                self.core.stats.record_encoding_failure();
                if self.core.config.strict_encoding {
                    return Err(ChannelError::Encode(format!(
                        "{description} has no value representation"
                    ))
                    .into());
                }
                tracing::warn!(
                    handle = %self.core.id,
                    chain = %self.chain,
                    %description,
                    "Result has no value representation, replying null"
                );
                Ok(Reply::Value(Value::Null))
            }
        }
    }
}

/// Send one request and wait for its response under the caller-side lock.
/// `None` when no service loop is listening.
async fn exchange(
    core: Arc<Core>,
    request: Request,
    chain: String,
) -> Result<Option<Response>, ChannelError> {
    let mut caller = core.channel.caller().lock().await;
    // Racy against a concurrent stop(); the final drain of the loop
    // answers requests that got in before the flag dropped.
    if !core.channel.listen_state().is_listening() {
        return Ok(None);
    }
    tracing::debug!(handle = %core.id, %chain, "Sending chain");
    caller.send(request).await?;
    caller.recv().await.map(Some)
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("id", &self.core.id)
            .field("chain", &self.chain.describe())
            .field("side", &self.side)
            .field("eager", &self.eager)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::SharedMap;
    use serde_json::json;

    fn exposed() -> RemoteHandle {
        let target: Arc<dyn Target> = Arc::new(SharedMap::from_value(json!({"x": 1})));
        RemoteHandle::expose(target, HandleConfig::new()).unwrap()
    }

    #[tokio::test]
    async fn builders_leave_receiver_unchanged() {
        let root = exposed();
        let x = root.item("x").unwrap();
        assert_eq!(root.describe(), "(?)");
        assert_eq!(x.describe(), "(?[\"x\"])");
        assert_eq!(x.root().describe(), "(?)");
        assert_eq!(x.id(), root.id());
    }

    #[tokio::test]
    async fn describe_method_call() {
        let handle = exposed()
            .attr("method")
            .unwrap()
            .call(vec![json!(1), json!(2)])
            .unwrap();
        assert_eq!(handle.describe(), "(?.method(1, 2))");
    }

    #[tokio::test]
    async fn caller_view_keeps_chain() {
        let owner = exposed().item("x").unwrap();
        let caller = owner.caller();
        assert!(owner.is_owner());
        assert_eq!(caller.side(), Side::Caller);
        assert_eq!(caller.describe(), owner.describe());
    }

    #[tokio::test]
    async fn frozen_handle_cannot_be_extended() {
        let assigned = exposed().extend(Operation::set_item("x", 2)).unwrap();
        let err = assigned.attr("y").unwrap_err();
        assert!(matches!(err, RemoteError::Chain(_)));
    }

    #[tokio::test]
    async fn not_running_uses_defaults() {
        let handle = exposed().item("x").unwrap();
        assert!(handle.resolve().await.unwrap_err().is_not_running());

        let reply = handle.resolve_or(json!("fallback")).await.unwrap();
        assert_eq!(reply.into_value(), Some(json!("fallback")));

        let reply = handle.clone().with_default(json!(null)).resolve().await.unwrap();
        assert_eq!(reply.as_value(), Some(&json!(null)));
    }

    #[tokio::test]
    async fn lazy_apply_returns_extended_handle() {
        let handle = exposed();
        let reply = handle.apply(Operation::item("x")).await.unwrap();
        let extended = reply.into_handle().unwrap();
        assert_eq!(extended.describe(), "(?[\"x\"])");
    }

    #[tokio::test]
    async fn config_seeds_handle_settings() {
        let target: Arc<dyn Target> = Arc::new(SharedMap::default());
        let config = HandleConfig::new().with_eager(true).with_default(json!(0));
        let handle = RemoteHandle::expose(target, config).unwrap();
        assert!(handle.is_eager());

        // Eager apply resolves immediately; nothing listens, so the default comes back.
        let reply = handle.apply(Operation::item("x")).await.unwrap();
        assert_eq!(reply.into_value(), Some(json!(0)));
    }
}
