//! Owner side of a remote handle: the service loop and its lifecycle.
//!
//! A worker task owns the listening state while it runs. It drains pending
//! requests, pauses for `poll_interval`, and repeats until cancelled. On the
//! way out it always drops the listening flag and drains once more, so a
//! caller that got its request in before the flag dropped still gets an answer.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::channel::ChannelError;
use crate::bridge::protocol::{ErrorEnvelope, Payload, Request, Response};
use crate::chain::{Chain, Resolved};
use crate::error::{Fault, RemoteError};
use crate::handle::{Core, RemoteHandle, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// No service loop is running.
    Idle,
    Listening,
    /// `stop()` was requested; the loop is finishing its last drain.
    Stopping,
}

/// Counters for one exposed target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleStats {
    pub requests_served: u64,
    pub resolution_faults: u64,
    pub encoding_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Stats {
    served: AtomicU64,
    faults: AtomicU64,
    encoding_failures: AtomicU64,
}

impl Stats {
    fn record_served(&self) {
        self.served.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_encoding_failure(&self) {
        self.encoding_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HandleStats {
        HandleStats {
            requests_served: self.served.load(Ordering::Relaxed),
            resolution_faults: self.faults.load(Ordering::Relaxed),
            encoding_failures: self.encoding_failures.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct Worker {
    cancel: CancellationToken,
    join: JoinHandle<Result<(), RemoteError>>,
}

impl RemoteHandle {
    fn owner_core(&self) -> Result<&Arc<Core>, RemoteError> {
        match self.side() {
            Side::Owner => Ok(&self.core),
            Side::Caller => Err(RemoteError::NotOwner),
        }
    }

    /// Serve one pending request, if any. Returns whether one was served.
    pub async fn poll(&self) -> Result<bool, RemoteError> {
        serve_one(self.owner_core()?).await
    }

    /// Spawn the service loop. Returns once it is listening; does nothing if
    /// a loop is already running.
    pub async fn start(&self) -> Result<(), RemoteError> {
        let core = self.owner_core()?;
        let mut slot = core.worker.lock().await;

        if let Some(worker) = slot.as_ref() {
            if !worker.join.is_finished() {
                return Ok(());
            }
        }
        // A loop that exited on its own is reaped before starting a new one.
        if let Some(finished) = slot.take() {
            if let Err(e) = join_worker(finished.join).await {
                tracing::warn!(handle = %core.id, error = %e, "Previous service loop had failed");
            }
        }

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let join = tokio::spawn(run_worker(Arc::clone(core), cancel.clone(), ready_tx));
        *slot = Some(Worker { cancel, join });

        if ready_rx.await.is_err() {
            let failed = slot.take();
            drop(slot);
            if let Some(worker) = failed {
                join_worker(worker.join).await?;
            }
            return Err(RemoteError::Panicked(
                "service loop exited before listening".to_string(),
            ));
        }
        Ok(())
    }

    /// Stop the service loop and wait for it to terminate. Reports the loop's
    /// fatal error, if it had one.
    pub async fn stop(&self) -> Result<(), RemoteError> {
        let core = self.owner_core()?;
        let mut slot = core.worker.lock().await;
        let Some(worker) = slot.take() else {
            return Ok(());
        };

        core.stopping.store(true, Ordering::SeqCst);
        worker.cancel.cancel();
        let outcome = join_worker(worker.join).await;
        core.stopping.store(false, Ordering::SeqCst);
        outcome
    }

    /// Run `body` with the service loop started. The loop is stopped even if
    /// `body` panics; the panic then resumes.
    pub async fn scoped<F, Fut, T>(&self, body: F) -> Result<T, RemoteError>
    where
        F: FnOnce(RemoteHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        self.start().await?;
        let outcome = AssertUnwindSafe(body(self.caller())).catch_unwind().await;
        let stopped = self.stop().await;
        match outcome {
            Ok(value) => stopped.map(|()| value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    pub fn state(&self) -> ServiceState {
        if self.core.stopping.load(Ordering::SeqCst) {
            ServiceState::Stopping
        } else if self.core.channel.listen_state().is_listening() {
            ServiceState::Listening
        } else {
            ServiceState::Idle
        }
    }

    pub fn is_listening(&self) -> bool {
        self.core.channel.listen_state().is_listening()
    }

    pub fn stats(&self) -> HandleStats {
        self.core.stats.snapshot()
    }
}

async fn join_worker(join: JoinHandle<Result<(), RemoteError>>) -> Result<(), RemoteError> {
    match join.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(RemoteError::Panicked(panic_message(&*e.into_panic()))),
        Err(e) => Err(RemoteError::Panicked(e.to_string())),
    }
}

async fn run_worker(
    core: Arc<Core>,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
) -> Result<(), RemoteError> {
    let listen = core.channel.listen_state();
    listen.begin(tokio::task::id());
    let _ = ready.send(());
    tracing::info!(handle = %core.id, poll_interval = ?core.config.poll_interval, "Service loop listening");

    let outcome = AssertUnwindSafe(serve_until_cancelled(&core, &cancel))
        .catch_unwind()
        .await;

    listen.end();
    // Owner identity is kept through the final drain so targets can still
    // call back into their own handle.
    let drained = drain(&core).await;
    listen.release();

    match outcome {
        Ok(Ok(())) => {
            drained?;
            tracing::info!(handle = %core.id, "Service loop stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            if let Err(drain_err) = drained {
                tracing::debug!(handle = %core.id, error = %drain_err, "Final drain failed");
            }
            tracing::error!(handle = %core.id, error = %e, "Service loop failed");
            Err(e)
        }
        Err(panic) => {
            let message = panic_message(&*panic);
            tracing::error!(handle = %core.id, %message, "Service loop panicked");
            Err(RemoteError::Panicked(message))
        }
    }
}

async fn serve_until_cancelled(core: &Core, cancel: &CancellationToken) -> Result<(), RemoteError> {
    loop {
        drain(core).await?;
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(core.config.poll_interval) => {}
        }
    }
}

async fn drain(core: &Core) -> Result<(), RemoteError> {
    while serve_one(core).await? {}
    Ok(())
}

pub(crate) async fn serve_one(core: &Core) -> Result<bool, RemoteError> {
    let mut owner = core.channel.owner().lock().await;
    if !owner.poll()? {
        return Ok(false);
    }
    let request = owner.recv().await?;
    let (chain, response) = respond(core, request).await;
    let envelope = response.1.clone();

    let sent = match (owner.send(response).await, envelope) {
        (Err(ChannelError::Encode(reason)), Some(envelope)) => {
            // The codec refused the full error; keep the fault, drop the rest.
            core.stats.record_encoding_failure();
            tracing::warn!(handle = %core.id, %chain, %reason, "Error could not be encoded, sending kind and message only");
            let minimal = ErrorEnvelope {
                kind: envelope.kind,
                message: envelope.message,
                trace: String::new(),
            };
            owner.send(Response::error(minimal)).await
        }
        (sent, _) => sent,
    };

    match sent {
        Ok(()) => {}
        Err(ChannelError::Encode(reason)) => {
            core.stats.record_encoding_failure();
            if core.config.strict_encoding {
                tracing::error!(handle = %core.id, %chain, %reason, "Result could not be encoded");
                let envelope = ErrorEnvelope {
                    kind: "EncodeError".to_string(),
                    message: reason.clone(),
                    trace: format!("while encoding the result of {chain}\nEncodeError: {reason}"),
                };
                owner.send(Response::error(envelope)).await?;
                return Err(ChannelError::Encode(reason).into());
            }
            tracing::warn!(handle = %core.id, %chain, %reason, "Result could not be encoded, replying null");
            owner.send(Response::value(Value::Null)).await?;
        }
        Err(e) => return Err(e.into()),
    }

    core.stats.record_served();
    Ok(true)
}

/// Resolve a request against the target. Returns the chain rendering for
/// diagnostics alongside the response.
async fn respond(core: &Core, request: Request) -> (String, Response) {
    let chain = match Chain::from_ops(request.ops) {
        Ok(chain) => chain,
        Err(e) => {
            core.stats.record_fault();
            let fault = Fault::value(e.to_string());
            return (
                "(?)".to_string(),
                Response::error(ErrorEnvelope::from_fault("request", &fault)),
            );
        }
    };
    let rendered = chain.describe();
    tracing::debug!(handle = %core.id, chain = %rendered, "Resolving chain");

    let outcome = AssertUnwindSafe(chain.resolve(&core.target, &core.context))
        .catch_unwind()
        .await;
    let response = match outcome {
        Ok(Ok(Resolved::Root)) => Response::selfref(),
        Ok(Ok(Resolved::Value(value))) => Response::value(value),
        Ok(Ok(Resolved::Opaque(description))) => Response(Payload::Opaque(description), None),
        Ok(Err(failure)) => {
            core.stats.record_fault();
            tracing::debug!(handle = %core.id, chain = %rendered, fault = %failure, "Chain raised");
            Response::error(ErrorEnvelope::from_failure(&failure))
        }
        Err(panic) => {
            core.stats.record_fault();
            let fault = Fault::new("Panic", panic_message(&*panic));
            tracing::warn!(handle = %core.id, chain = %rendered, %fault, "Target panicked");
            Response::error(ErrorEnvelope::from_fault(&rendered, &fault))
        }
    };
    (rendered, response)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
