//! Demo: expose a small target, resolve a few chains from a caller task.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use remoteobj::{
    Args, Fault, FunctionTable, HandleConfig, Member, Output, RemoteHandle, SharedMap, Subject,
    Target,
};

struct Counter {
    count: AtomicI64,
    settings: Arc<SharedMap>,
}

#[async_trait]
impl Target for Counter {
    async fn get_attr(&self, name: &str) -> Result<Member, Fault> {
        match name {
            "count" => Ok(Member::Value(json!(self.count.load(Ordering::SeqCst)))),
            "settings" => Ok(Member::Object(self.settings.clone())),
            "add" | "increment" => Ok(Member::Method),
            _ => Err(Fault::no_attribute(self.type_name(), name)),
        }
    }

    async fn set_attr(&self, name: &str, value: Value) -> Result<(), Fault> {
        match name {
            "count" => {
                let count = value
                    .as_i64()
                    .ok_or_else(|| Fault::type_error("count must be an integer"))?;
                self.count.store(count, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(Fault::no_attribute(self.type_name(), name)),
        }
    }

    async fn call_method(&self, name: &str, args: Args) -> Result<Output, Fault> {
        match name {
            "add" => {
                args.expect_positional("add", 2)?;
                Ok(json!(args.int("add", 0)? + args.int("add", 1)?).into())
            }
            "increment" => {
                self.count.fetch_add(1, Ordering::SeqCst);
                Ok(Output::Receiver)
            }
            _ => Err(Fault::no_attribute(self.type_name(), name)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    remoteobj::logging::init_tracing();

    let functions = FunctionTable::new().with("double", |subject, _args| async move {
        match subject {
            Subject::Value(value) => value
                .as_i64()
                .map(|n| Output::Value(json!(n * 2)))
                .ok_or_else(|| Fault::type_error("double() expects an integer")),
            Subject::Object(object) => Err(Fault::type_error(format!(
                "double() expects an integer, not a '{}' object",
                object.type_name()
            ))),
        }
    });

    let counter = Arc::new(Counter {
        count: AtomicI64::new(0),
        settings: Arc::new(SharedMap::from_value(json!({"name": "demo", "step": 1}))),
    });
    let owner = RemoteHandle::expose_with(counter, HandleConfig::from_env(), functions)?;
    owner.start().await?;

    let caller = owner.caller();
    let worker = tokio::spawn(async move {
        let sum = caller.attr("add")?.call(vec![json!(2), json!(3)])?;
        let reply = sum.resolve().await?;
        tracing::info!(chain = %sum.describe(), ?reply, "Resolved");

        let doubled = sum.pass_to("double", vec![])?;
        let reply = doubled.resolve().await?;
        tracing::info!(chain = %doubled.describe(), ?reply, "Resolved");

        let fluent = caller.attr("increment")?.call(vec![])?.resolve().await?;
        tracing::info!(is_root = fluent.is_handle(), "Fluent call returned the target");

        caller.attr("settings")?.set_item("step", json!(5)).await?;
        let step = caller.attr("settings")?.item("step")?.resolve().await?;
        tracing::info!(reply = ?step, "Updated nested setting");

        match caller.attr("missing")?.resolve().await {
            Err(e) => tracing::info!(error = %e, "Remote fault re-raised"),
            Ok(reply) => tracing::warn!(?reply, "Expected a fault"),
        }
        anyhow::Ok(())
    });
    worker.await??;

    let stats = owner.stats();
    owner.stop().await?;
    tracing::info!(
        served = stats.requests_served,
        faults = stats.resolution_faults,
        "Demo finished"
    );
    Ok(())
}
