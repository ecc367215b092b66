//! Owner-side object model.
//!
//! A [`Target`] is the real object behind a remote handle. It is reached only
//! through the six operation kinds of a chain: attribute get/set, item get/set,
//! call, and being passed to a registered function.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Fault;

/// Result of reading an attribute or item from a live object.
pub enum Member {
    /// Plain data, copied out of the object.
    Value(Value),
    /// A method of the object; resolved by a following call.
    Method,
    /// A nested live object.
    Object(Arc<dyn Target>),
}

impl From<Value> for Member {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Result of calling a live object or one of its methods.
pub enum Output {
    Value(Value),
    Object(Arc<dyn Target>),
    /// The receiver itself (fluent methods that return their own object).
    Receiver,
}

impl From<Value> for Output {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Positional and keyword arguments of a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keyword: Map<String, Value>,
}

impl Args {
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keyword: Map::new(),
        }
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.keyword.insert(name.into(), value);
        self
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }

    /// Check that exactly `count` positional arguments were passed to `method`.
    pub fn expect_positional(&self, method: &str, count: usize) -> Result<&[Value], Fault> {
        if self.positional.len() != count {
            return Err(Fault::type_error(format!(
                "{method}() takes {count} positional argument{} but {} {} given",
                if count == 1 { "" } else { "s" },
                self.positional.len(),
                if self.positional.len() == 1 { "was" } else { "were" },
            )));
        }
        Ok(&self.positional)
    }

    /// Positional argument `index` as an i64.
    pub fn int(&self, method: &str, index: usize) -> Result<i64, Fault> {
        let value = self.positional.get(index).ok_or_else(|| {
            Fault::type_error(format!(
                "{method}() missing required positional argument {index}"
            ))
        })?;
        value.as_i64().ok_or_else(|| {
            Fault::type_error(format!(
                "{method}() argument {index} must be an integer, not {}",
                value_type_name(value)
            ))
        })
    }
}

/// The real object behind a remote handle.
///
/// Every method has a default that raises the fault a dynamic object model
/// would raise for an unsupported operation, so implementors only override
/// what they support. Methods take `&self`: targets are shared with the
/// service loop and use their own interior mutability.
#[async_trait]
pub trait Target: Send + Sync + 'static {
    /// Short type name used in fault messages.
    fn type_name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    async fn get_attr(&self, name: &str) -> Result<Member, Fault> {
        Err(Fault::no_attribute(self.type_name(), name))
    }

    async fn set_attr(&self, name: &str, _value: Value) -> Result<(), Fault> {
        Err(Fault::attribute(format!(
            "'{}' object attribute '{name}' is read-only",
            self.type_name()
        )))
    }

    async fn get_item(&self, _key: &Value) -> Result<Member, Fault> {
        Err(Fault::type_error(format!(
            "'{}' object is not subscriptable",
            self.type_name()
        )))
    }

    async fn set_item(&self, _key: Value, _value: Value) -> Result<(), Fault> {
        Err(Fault::type_error(format!(
            "'{}' object does not support item assignment",
            self.type_name()
        )))
    }

    /// Call the object itself.
    async fn call(&self, _args: Args) -> Result<Output, Fault> {
        Err(Fault::type_error(format!(
            "'{}' object is not callable",
            self.type_name()
        )))
    }

    /// Call a method previously reported as [`Member::Method`].
    async fn call_method(&self, name: &str, _args: Args) -> Result<Output, Fault> {
        Err(Fault::no_attribute(self.type_name(), name))
    }

    /// Plain-data view of this object, used when a nested object is the final
    /// result of a chain. `None` means the object cannot leave its context.
    fn snapshot(&self) -> Option<Value> {
        None
    }
}

/// What a pass-to function receives as its first argument.
pub enum Subject {
    Object(Arc<dyn Target>),
    Value(Value),
}

type RemoteFn =
    Arc<dyn Fn(Subject, Args) -> BoxFuture<'static, Result<Output, Fault>> + Send + Sync>;

/// Functions a chain may pass its current value to, looked up by name.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: HashMap<String, RemoteFn>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(Subject, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Output, Fault>> + Send + 'static,
    {
        let function: RemoteFn = Arc::new(move |subject, args| function(subject, args).boxed());
        self.functions.insert(name.into(), function);
    }

    pub fn with<F, Fut>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(Subject, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Output, Fault>> + Send + 'static,
    {
        self.register(name, function);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub(crate) async fn invoke(
        &self,
        name: &str,
        subject: Subject,
        args: Args,
    ) -> Result<Output, Fault> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| Fault::name(format!("function '{name}' is not registered")))?;
        function(subject, args).await
    }
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionTable").field("functions", &names).finish()
    }
}

/// Name of a JSON value's type, as used in fault messages.
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A mapping target: string keys to JSON values.
///
/// Supports item get/set and the methods `keys()`, `len()`, `get(key, default)`
/// and `pop(key)`.
#[derive(Debug, Default)]
pub struct SharedMap {
    entries: RwLock<Map<String, Value>>,
}

impl SharedMap {
    pub fn new(entries: Map<String, Value>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Build from a JSON object; any other value yields an empty map.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(entries) => Self::new(entries),
            _ => Self::default(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Map<String, Value>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Map<String, Value>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key_str(key: &Value) -> Result<&str, Fault> {
        key.as_str().ok_or_else(|| {
            Fault::type_error(format!(
                "map keys must be strings, not {}",
                value_type_name(key)
            ))
        })
    }
}

#[async_trait]
impl Target for SharedMap {
    fn type_name(&self) -> &str {
        "map"
    }

    async fn get_attr(&self, name: &str) -> Result<Member, Fault> {
        match name {
            "keys" | "len" | "get" | "pop" => Ok(Member::Method),
            _ => Err(Fault::no_attribute(self.type_name(), name)),
        }
    }

    async fn get_item(&self, key: &Value) -> Result<Member, Fault> {
        let name = Self::key_str(key)?;
        self.read()
            .get(name)
            .cloned()
            .map(Member::Value)
            .ok_or_else(|| Fault::key(key.to_string()))
    }

    async fn set_item(&self, key: Value, value: Value) -> Result<(), Fault> {
        let name = Self::key_str(&key)?.to_string();
        self.write().insert(name, value);
        Ok(())
    }

    async fn call_method(&self, name: &str, args: Args) -> Result<Output, Fault> {
        match name {
            "keys" => {
                args.expect_positional("keys", 0)?;
                let keys = self.read().keys().cloned().map(Value::String).collect();
                Ok(Output::Value(Value::Array(keys)))
            }
            "len" => {
                args.expect_positional("len", 0)?;
                Ok(Output::Value(Value::from(self.read().len())))
            }
            "get" => {
                let fallback = match args.positional.len() {
                    1 => Value::Null,
                    2 => args.positional[1].clone(),
                    given => {
                        return Err(Fault::type_error(format!(
                            "get() takes 1 or 2 positional arguments but {given} were given"
                        )));
                    }
                };
                let key = Self::key_str(&args.positional[0])?;
                Ok(Output::Value(self.read().get(key).cloned().unwrap_or(fallback)))
            }
            "pop" => {
                let positional = args.expect_positional("pop", 1)?;
                let key = Self::key_str(&positional[0])?;
                self.write()
                    .remove(key)
                    .map(Output::Value)
                    .ok_or_else(|| Fault::key(positional[0].to_string()))
            }
            _ => Err(Fault::no_attribute(self.type_name(), name)),
        }
    }

    fn snapshot(&self) -> Option<Value> {
        Some(Value::Object(self.read().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Opaque;

    #[async_trait]
    impl Target for Opaque {}

    #[tokio::test]
    async fn default_methods_raise_descriptive_faults() {
        let target = Opaque;
        assert_eq!(target.type_name(), "Opaque");

        let err = target.get_attr("x").await.err().unwrap();
        assert_eq!(err.message(), "'Opaque' object has no attribute 'x'");

        let err = target.get_item(&json!(0)).await.err().unwrap();
        assert_eq!(err.kind(), "TypeError");
        assert_eq!(err.message(), "'Opaque' object is not subscriptable");

        let err = target.call(Args::default()).await.err().unwrap();
        assert_eq!(err.message(), "'Opaque' object is not callable");
        assert!(target.snapshot().is_none());
    }

    #[test]
    fn expect_positional_reports_arity() {
        let args = Args::new(vec![json!(1), json!(2), json!(3)]);
        let err = args.expect_positional("add", 2).unwrap_err();
        assert_eq!(
            err.message(),
            "add() takes 2 positional arguments but 3 were given"
        );
        assert!(Args::new(vec![json!(1)]).expect_positional("neg", 1).is_ok());
    }

    #[test]
    fn int_argument_checks_type() {
        let args = Args::new(vec![json!("two")]);
        let err = args.int("add", 0).unwrap_err();
        assert_eq!(
            err.message(),
            "add() argument 0 must be an integer, not string"
        );
        assert_eq!(Args::new(vec![json!(7)]).int("add", 0).unwrap(), 7);
    }

    #[tokio::test]
    async fn shared_map_items_and_methods() {
        let map = SharedMap::from_value(json!({"x": 1}));

        match map.get_item(&json!("x")).await.unwrap() {
            Member::Value(v) => assert_eq!(v, json!(1)),
            _ => panic!("expected value"),
        }

        let err = map.get_item(&json!("y")).await.err().unwrap();
        assert_eq!(err.kind(), "KeyError");
        assert_eq!(err.message(), "\"y\"");

        map.set_item(json!("y"), json!([1, 2])).await.unwrap();
        match map.call_method("len", Args::default()).await.unwrap() {
            Output::Value(v) => assert_eq!(v, json!(2)),
            _ => panic!("expected value"),
        }
        match map
            .call_method("get", Args::new(vec![json!("z"), json!("none")]))
            .await
            .unwrap()
        {
            Output::Value(v) => assert_eq!(v, json!("none")),
            _ => panic!("expected value"),
        }
        assert_eq!(map.snapshot(), Some(json!({"x": 1, "y": [1, 2]})));
    }

    #[tokio::test]
    async fn function_table_invokes_by_name() {
        let table = FunctionTable::new().with("double", |subject, _args| async move {
            match subject {
                Subject::Value(v) => Ok(Output::Value(json!(v.as_i64().unwrap_or(0) * 2))),
                Subject::Object(_) => Err(Fault::type_error("expected a value")),
            }
        });
        assert!(table.contains("double"));

        match table
            .invoke("double", Subject::Value(json!(21)), Args::default())
            .await
            .unwrap()
        {
            Output::Value(v) => assert_eq!(v, json!(42)),
            _ => panic!("expected value"),
        }

        let err = table
            .invoke("triple", Subject::Value(json!(1)), Args::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "NameError");
        assert_eq!(err.message(), "function 'triple' is not registered");
    }
}
