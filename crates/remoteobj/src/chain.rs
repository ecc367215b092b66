//! Operation chains: deferred operations against an unknown root object.
//!
//! A chain is built incrementally (every extension yields a new chain) and is
//! later resolved against a concrete [`Target`]. Chains carry no I/O.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::AccessPolicy;
use crate::error::Fault;
use crate::target::{Args, FunctionTable, Member, Output, Subject, Target, value_type_name};

/// One deferred operation.
///
/// Wire form: `{"kind": "attr-get", "payload": {"name": "x"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum Operation {
    AttrGet {
        name: String,
    },
    ItemGet {
        key: Value,
    },
    AttrSet {
        name: String,
        value: Value,
    },
    ItemSet {
        key: Value,
        value: Value,
    },
    Call {
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
    },
    PassTo {
        function: String,
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
    },
}

impl Operation {
    pub fn attr(name: impl Into<String>) -> Self {
        Self::AttrGet { name: name.into() }
    }

    pub fn item(key: impl Into<Value>) -> Self {
        Self::ItemGet { key: key.into() }
    }

    pub fn set_attr(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::AttrSet {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn set_item(key: impl Into<Value>, value: impl Into<Value>) -> Self {
        Self::ItemSet {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn call(args: Args) -> Self {
        Self::Call {
            args: args.positional,
            kwargs: args.keyword,
        }
    }

    pub fn pass_to(function: impl Into<String>, args: Args) -> Self {
        Self::PassTo {
            function: function.into(),
            args: args.positional,
            kwargs: args.keyword,
        }
    }

    /// Assignments terminate a chain.
    pub fn is_assignment(&self) -> bool {
        matches!(self, Self::AttrSet { .. } | Self::ItemSet { .. })
    }

    /// Render this operation applied to the expression `subject`.
    fn render_onto(&self, subject: &str) -> String {
        match self {
            Self::AttrGet { name } => format!("{subject}.{name}"),
            Self::ItemGet { key } => format!("{subject}[{key}]"),
            Self::AttrSet { name, value } => format!("{subject}.{name} = {value}"),
            Self::ItemSet { key, value } => format!("{subject}[{key}] = {value}"),
            Self::Call { args, kwargs } => {
                format!("{subject}({})", render_arguments(args, kwargs))
            }
            Self::PassTo {
                function,
                args,
                kwargs,
            } => {
                let rest = render_arguments(args, kwargs);
                if rest.is_empty() {
                    format!("{function}({subject})")
                } else {
                    format!("{function}({subject}, {rest})")
                }
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_onto(""))
    }
}

fn render_arguments(args: &[Value], kwargs: &Map<String, Value>) -> String {
    let mut out = String::new();
    for value in args {
        if !out.is_empty() {
            out.push_str(", ");
        }
        let _ = write!(out, "{value}");
    }
    for (name, value) in kwargs {
        if !out.is_empty() {
            out.push_str(", ");
        }
        let _ = write!(out, "{name}={value}");
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("chain {chain} ends in an assignment and cannot be extended")]
    Frozen { chain: String },

    #[error("assignment at position {index} must be the final operation of a chain")]
    MisplacedAssignment { index: usize },
}

/// An immutable sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chain {
    ops: Vec<Operation>,
    frozen: bool,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a chain from wire records.
    pub fn from_ops(ops: Vec<Operation>) -> Result<Self, ChainError> {
        if let Some(index) = ops
            .iter()
            .position(Operation::is_assignment)
            .filter(|&index| index + 1 != ops.len())
        {
            return Err(ChainError::MisplacedAssignment { index });
        }
        let frozen = ops.last().is_some_and(Operation::is_assignment);
        Ok(Self { ops, frozen })
    }

    /// A new chain with `op` appended. The receiver is left untouched.
    pub fn extend(&self, op: Operation) -> Result<Self, ChainError> {
        if self.frozen {
            return Err(ChainError::Frozen {
                chain: self.describe(),
            });
        }
        let frozen = op.is_assignment();
        let mut ops = Vec::with_capacity(self.ops.len() + 1);
        ops.extend_from_slice(&self.ops);
        ops.push(op);
        Ok(Self { ops, frozen })
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Deterministic rendering, e.g. `(?.method(1, 2))`.
    pub fn describe(&self) -> String {
        let expr = self
            .ops
            .iter()
            .fold(String::from("?"), |subject, op| op.render_onto(&subject));
        format!("({expr})")
    }

    /// Apply every operation in order to `root`.
    pub async fn resolve(
        &self,
        root: &Arc<dyn Target>,
        context: &ResolveContext,
    ) -> Result<Resolved, ResolveFailure> {
        let mut cursor = Cursor::Object(Arc::clone(root));
        for (index, op) in self.ops.iter().enumerate() {
            cursor = cursor
                .apply(op, context)
                .await
                .map_err(|fault| ResolveFailure {
                    chain: self.describe(),
                    index,
                    step: op.to_string(),
                    fault,
                })?;
        }
        Ok(cursor.finish(root))
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Owner-side environment a chain is resolved in.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub functions: FunctionTable,
    pub access: AccessPolicy,
}

impl ResolveContext {
    pub fn new(functions: FunctionTable, access: AccessPolicy) -> Self {
        Self { functions, access }
    }
}

/// Final value of a resolved chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// The root object itself.
    Root,
    Value(Value),
    /// A live object or method with no value representation.
    Opaque(String),
}

/// A fault raised at a particular step of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveFailure {
    chain: String,
    index: usize,
    step: String,
    fault: Fault,
}

impl ResolveFailure {
    pub fn fault(&self) -> &Fault {
        &self.fault
    }

    /// Zero-based index of the failing operation.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Human-readable trace of where the fault was raised.
    pub fn trace(&self) -> String {
        format!(
            "while resolving {}\n  step {}: {}\n{}",
            self.chain,
            self.index + 1,
            self.step,
            self.fault
        )
    }
}

impl fmt::Display for ResolveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.fault, f)
    }
}

/// Where a plain value was read from, for writing nested assignments back.
struct Place {
    owner: Arc<dyn Target>,
    anchor: Anchor,
    path: Vec<Value>,
}

enum Anchor {
    Attr(String),
    Item(Value),
}

enum Cursor {
    Object(Arc<dyn Target>),
    Method {
        owner: Arc<dyn Target>,
        name: String,
    },
    Data {
        value: Value,
        place: Option<Place>,
    },
}

impl Cursor {
    fn from_member(member: Member, owner: Arc<dyn Target>, anchor: Anchor) -> Self {
        match member {
            Member::Value(value) => Self::Data {
                value,
                place: Some(Place {
                    owner,
                    anchor,
                    path: Vec::new(),
                }),
            },
            Member::Method => match anchor {
                Anchor::Attr(name) => Self::Method { owner, name },
                Anchor::Item(key) => Self::Method {
                    owner,
                    name: key.to_string(),
                },
            },
            Member::Object(object) => Self::Object(object),
        }
    }

    fn from_output(output: Output, receiver: Arc<dyn Target>) -> Self {
        match output {
            Output::Value(value) => Self::Data { value, place: None },
            Output::Object(object) => Self::Object(object),
            Output::Receiver => Self::Object(receiver),
        }
    }

    async fn apply(self, op: &Operation, context: &ResolveContext) -> Result<Self, Fault> {
        match (self, op) {
            (Self::Object(object), Operation::AttrGet { name }) => {
                context.access.check(name)?;
                let member = object.get_attr(name).await?;
                Ok(Self::from_member(member, object, Anchor::Attr(name.clone())))
            }
            (Self::Object(object), Operation::ItemGet { key }) => {
                let member = object.get_item(key).await?;
                Ok(Self::from_member(member, object, Anchor::Item(key.clone())))
            }
            (Self::Object(object), Operation::AttrSet { name, value }) => {
                context.access.check(name)?;
                object.set_attr(name, value.clone()).await?;
                Ok(Self::unit())
            }
            (Self::Object(object), Operation::ItemSet { key, value }) => {
                object.set_item(key.clone(), value.clone()).await?;
                Ok(Self::unit())
            }
            (Self::Object(object), Operation::Call { args, kwargs }) => {
                let output = object.call(call_args(args, kwargs)).await?;
                Ok(Self::from_output(output, object))
            }
            (Self::Method { owner, name }, Operation::Call { args, kwargs }) => {
                let output = owner.call_method(&name, call_args(args, kwargs)).await?;
                Ok(Self::from_output(output, owner))
            }
            (Self::Method { name, .. }, Operation::AttrGet { name: attr })
            | (Self::Method { name, .. }, Operation::AttrSet { name: attr, .. }) => Err(
                Fault::attribute(format!("method '{name}' has no attribute '{attr}'")),
            ),
            (Self::Method { name, .. }, Operation::ItemGet { .. })
            | (Self::Method { name, .. }, Operation::ItemSet { .. }) => Err(Fault::type_error(
                format!("method '{name}' is not subscriptable"),
            )),
            (Self::Data { value, .. }, Operation::AttrGet { name })
            | (Self::Data { value, .. }, Operation::AttrSet { name, .. }) => {
                Err(Fault::attribute(format!(
                    "'{}' value has no attribute '{name}'",
                    value_type_name(&value)
                )))
            }
            (Self::Data { value, place }, Operation::ItemGet { key }) => {
                let element = index_value(&value, key)?.clone();
                let place = place.map(|mut place| {
                    place.path.push(key.clone());
                    place
                });
                Ok(Self::Data {
                    value: element,
                    place,
                })
            }
            (Self::Data { value, place }, Operation::ItemSet { key, value: new }) => {
                let Some(place) = place else {
                    return Err(Fault::type_error(format!(
                        "cannot assign into a temporary '{}' value",
                        value_type_name(&value)
                    )));
                };
                write_back(place, key.clone(), new.clone()).await?;
                Ok(Self::unit())
            }
            (Self::Data { value, .. }, Operation::Call { .. }) => Err(Fault::type_error(
                format!("'{}' value is not callable", value_type_name(&value)),
            )),
            (cursor, Operation::PassTo {
                function,
                args,
                kwargs,
            }) => {
                let (subject, receiver) = match cursor {
                    Self::Object(object) => (Subject::Object(Arc::clone(&object)), Some(object)),
                    Self::Data { value, .. } => (Subject::Value(value), None),
                    Self::Method { name, .. } => {
                        return Err(Fault::type_error(format!(
                            "method '{name}' cannot be passed to '{function}' without calling it"
                        )));
                    }
                };
                let output = context
                    .functions
                    .invoke(function, subject, call_args(args, kwargs))
                    .await?;
                match (output, receiver) {
                    (Output::Receiver, None) => Err(Fault::type_error(format!(
                        "'{function}' returned its subject, but the subject is not an object"
                    ))),
                    (output, Some(receiver)) => Ok(Self::from_output(output, receiver)),
                    (Output::Value(value), None) => Ok(Self::Data { value, place: None }),
                    (Output::Object(object), None) => Ok(Self::Object(object)),
                }
            }
        }
    }

    fn unit() -> Self {
        Self::Data {
            value: Value::Null,
            place: None,
        }
    }

    fn finish(self, root: &Arc<dyn Target>) -> Resolved {
        match self {
            Self::Object(object) if same_object(&object, root) => Resolved::Root,
            Self::Object(object) => match object.snapshot() {
                Some(value) => Resolved::Value(value),
                None => Resolved::Opaque(format!("'{}' object", object.type_name())),
            },
            Self::Method { owner, name } => Resolved::Opaque(format!(
                "bound method '{}.{name}'",
                owner.type_name()
            )),
            Self::Data { value, .. } => Resolved::Value(value),
        }
    }
}

fn same_object(a: &Arc<dyn Target>, b: &Arc<dyn Target>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn call_args(args: &[Value], kwargs: &Map<String, Value>) -> Args {
    Args {
        positional: args.to_vec(),
        keyword: kwargs.clone(),
    }
}

fn array_position(items: &[Value], key: &Value) -> Result<usize, Fault> {
    let index = key.as_i64().ok_or_else(|| {
        Fault::type_error(format!(
            "array indices must be integers, not {}",
            value_type_name(key)
        ))
    })?;
    let len = items.len() as i64;
    let position = if index < 0 { index + len } else { index };
    if position < 0 || position >= len {
        return Err(Fault::index("array index out of range"));
    }
    Ok(position as usize)
}

fn index_value<'a>(value: &'a Value, key: &Value) -> Result<&'a Value, Fault> {
    match value {
        Value::Array(items) => Ok(&items[array_position(items, key)?]),
        Value::Object(entries) => {
            let name = key.as_str().ok_or_else(|| Fault::key(key.to_string()))?;
            entries.get(name).ok_or_else(|| Fault::key(key.to_string()))
        }
        other => Err(Fault::type_error(format!(
            "'{}' value is not subscriptable",
            value_type_name(other)
        ))),
    }
}

fn index_value_mut<'a>(value: &'a mut Value, key: &Value) -> Result<&'a mut Value, Fault> {
    match value {
        Value::Array(items) => {
            let position = array_position(items, key)?;
            Ok(&mut items[position])
        }
        Value::Object(entries) => {
            let name = key.as_str().ok_or_else(|| Fault::key(key.to_string()))?;
            entries
                .get_mut(name)
                .ok_or_else(|| Fault::key(key.to_string()))
        }
        other => Err(Fault::type_error(format!(
            "'{}' value is not subscriptable",
            value_type_name(other)
        ))),
    }
}

fn assign_item(container: &mut Value, key: Value, value: Value) -> Result<(), Fault> {
    match container {
        Value::Array(items) => {
            let position = array_position(items, &key)
                .map_err(|_| Fault::index("array assignment index out of range"))?;
            items[position] = value;
            Ok(())
        }
        Value::Object(entries) => match key {
            Value::String(name) => {
                entries.insert(name, value);
                Ok(())
            }
            other => Err(Fault::type_error(format!(
                "object keys must be strings, not {}",
                value_type_name(&other)
            ))),
        },
        other => Err(Fault::type_error(format!(
            "'{}' value does not support item assignment",
            value_type_name(other)
        ))),
    }
}

/// Re-read the anchor member, update the nested location, store it back.
async fn write_back(place: Place, key: Value, value: Value) -> Result<(), Fault> {
    let Place {
        owner,
        anchor,
        path,
    } = place;

    let member = match &anchor {
        Anchor::Attr(name) => owner.get_attr(name).await?,
        Anchor::Item(item) => owner.get_item(item).await?,
    };
    let Member::Value(mut current) = member else {
        return Err(Fault::type_error(
            "target member changed from a value while assigning into it",
        ));
    };

    let mut slot = &mut current;
    for step in &path {
        slot = index_value_mut(slot, step)?;
    }
    assign_item(slot, key, value)?;

    match anchor {
        Anchor::Attr(name) => owner.set_attr(&name, current).await,
        Anchor::Item(item) => owner.set_item(item, current).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::SharedMap;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct Calculator {
        memory: Mutex<Value>,
    }

    impl Calculator {
        fn new() -> Arc<dyn Target> {
            Arc::new(Self {
                memory: Mutex::new(json!({"slots": [0, 0, 0], "label": "calc"})),
            })
        }
    }

    #[async_trait]
    impl Target for Calculator {
        async fn get_attr(&self, name: &str) -> Result<Member, Fault> {
            match name {
                "add" | "reset" => Ok(Member::Method),
                "memory" => Ok(Member::Value(self.memory.lock().unwrap().clone())),
                _ => Err(Fault::no_attribute(self.type_name(), name)),
            }
        }

        async fn set_attr(&self, name: &str, value: Value) -> Result<(), Fault> {
            match name {
                "memory" => {
                    *self.memory.lock().unwrap() = value;
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
                "reset" => {
                    *self.memory.lock().unwrap() = json!({"slots": [], "label": ""});
                    Ok(Output::Receiver)
                }
                _ => Err(Fault::no_attribute(self.type_name(), name)),
            }
        }
    }

    fn chain(ops: Vec<Operation>) -> Chain {
        ops.into_iter()
            .try_fold(Chain::new(), |chain, op| chain.extend(op))
            .unwrap()
    }

    #[test]
    fn extend_returns_a_new_chain() {
        let base = Chain::new().extend(Operation::attr("a")).unwrap();
        let longer = base.extend(Operation::item("b")).unwrap();
        assert_eq!(base.len(), 1);
        assert_eq!(longer.len(), 2);
        assert_eq!(longer.ops()[0], base.ops()[0]);
    }

    #[test]
    fn assignment_freezes_the_chain() {
        let frozen = Chain::new()
            .extend(Operation::attr("a"))
            .unwrap()
            .extend(Operation::set_attr("b", 3))
            .unwrap();
        assert!(frozen.is_frozen());

        let err = frozen.extend(Operation::attr("c")).unwrap_err();
        assert_eq!(
            err,
            ChainError::Frozen {
                chain: "(?.a.b = 3)".to_string()
            }
        );
    }

    #[test]
    fn from_ops_rejects_assignment_before_the_end() {
        let err = Chain::from_ops(vec![Operation::set_item("k", 1), Operation::attr("a")])
            .unwrap_err();
        assert_eq!(err, ChainError::MisplacedAssignment { index: 0 });

        let ok = Chain::from_ops(vec![Operation::attr("a"), Operation::set_item("k", 1)]).unwrap();
        assert!(ok.is_frozen());
    }

    #[test]
    fn describe_renders_calls() {
        let c = chain(vec![
            Operation::attr("method"),
            Operation::call(Args::new(vec![json!(1), json!(2)])),
        ]);
        assert_eq!(c.describe(), "(?.method(1, 2))");
        assert_eq!(c.to_string(), "(?.method(1, 2))");
        assert_eq!(Chain::new().describe(), "(?)");
    }

    #[test]
    fn describe_renders_items_kwargs_and_pass_to() {
        let c = chain(vec![
            Operation::item("rows"),
            Operation::item(-1),
            Operation::pass_to("fmt", Args::new(vec![json!("csv")]).with_kwarg("sep", json!(";"))),
            Operation::attr("upper"),
            Operation::call(Args::default()),
        ]);
        assert_eq!(
            c.describe(),
            "(fmt(?[\"rows\"][-1], \"csv\", sep=\";\").upper())"
        );

        let assign = chain(vec![Operation::attr("cfg"), Operation::set_item("port", 80)]);
        assert_eq!(assign.describe(), "(?.cfg[\"port\"] = 80)");
        assert_eq!(Operation::set_attr("x", json!(null)).to_string(), ".x = null");
    }

    #[tokio::test]
    async fn resolves_item_of_a_mapping() {
        let root: Arc<dyn Target> = Arc::new(SharedMap::from_value(json!({"x": 1})));
        let resolved = chain(vec![Operation::item("x")])
            .resolve(&root, &ResolveContext::default())
            .await
            .unwrap();
        assert_eq!(resolved, Resolved::Value(json!(1)));
    }

    #[tokio::test]
    async fn resolves_method_calls() {
        let root = Calculator::new();
        let resolved = chain(vec![
            Operation::attr("add"),
            Operation::call(Args::new(vec![json!(2), json!(3)])),
        ])
        .resolve(&root, &ResolveContext::default())
        .await
        .unwrap();
        assert_eq!(resolved, Resolved::Value(json!(5)));
    }

    #[tokio::test]
    async fn missing_attribute_reports_step() {
        let root = Calculator::new();
        let failure = chain(vec![Operation::attr("missing")])
            .resolve(&root, &ResolveContext::default())
            .await
            .unwrap_err();
        assert_eq!(failure.index(), 0);
        assert_eq!(failure.fault().kind(), "AttributeError");
        assert_eq!(
            failure.fault().message(),
            "'Calculator' object has no attribute 'missing'"
        );
        assert_eq!(
            failure.trace(),
            "while resolving (?.missing)\n  step 1: .missing\nAttributeError: 'Calculator' object has no attribute 'missing'"
        );
    }

    #[tokio::test]
    async fn bad_arity_is_a_type_error() {
        let root = Calculator::new();
        let failure = chain(vec![
            Operation::attr("add"),
            Operation::call(Args::new(vec![json!(1)])),
        ])
        .resolve(&root, &ResolveContext::default())
        .await
        .unwrap_err();
        assert_eq!(failure.index(), 1);
        assert_eq!(failure.fault().kind(), "TypeError");
    }

    #[tokio::test]
    async fn root_and_receiver_resolve_to_root() {
        let root = Calculator::new();
        let context = ResolveContext::default();
        assert_eq!(
            Chain::new().resolve(&root, &context).await.unwrap(),
            Resolved::Root
        );
        let fluent = chain(vec![
            Operation::attr("reset"),
            Operation::call(Args::default()),
        ]);
        assert_eq!(fluent.resolve(&root, &context).await.unwrap(), Resolved::Root);
    }

    #[tokio::test]
    async fn uncalled_method_is_opaque() {
        let root = Calculator::new();
        let resolved = chain(vec![Operation::attr("add")])
            .resolve(&root, &ResolveContext::default())
            .await
            .unwrap();
        assert_eq!(
            resolved,
            Resolved::Opaque("bound method 'Calculator.add'".to_string())
        );
    }

    #[tokio::test]
    async fn nested_item_assignment_writes_back() {
        let root = Calculator::new();
        let context = ResolveContext::default();
        chain(vec![
            Operation::attr("memory"),
            Operation::item("slots"),
            Operation::set_item(-1, 9),
        ])
        .resolve(&root, &context)
        .await
        .unwrap();

        let slots = chain(vec![Operation::attr("memory"), Operation::item("slots")])
            .resolve(&root, &context)
            .await
            .unwrap();
        assert_eq!(slots, Resolved::Value(json!([0, 0, 9])));
    }

    #[tokio::test]
    async fn assignment_into_temporary_is_rejected() {
        let root = Calculator::new();
        let failure = chain(vec![
            Operation::attr("add"),
            Operation::call(Args::new(vec![json!(1), json!(1)])),
            Operation::set_item(0, 1),
        ])
        .resolve(&root, &ResolveContext::default())
        .await
        .unwrap_err();
        assert_eq!(
            failure.fault().message(),
            "cannot assign into a temporary 'number' value"
        );
    }

    #[tokio::test]
    async fn data_indexing_errors() {
        let root = Calculator::new();
        let context = ResolveContext::default();

        let out_of_range = chain(vec![
            Operation::attr("memory"),
            Operation::item("slots"),
            Operation::item(3),
        ])
        .resolve(&root, &context)
        .await
        .unwrap_err();
        assert_eq!(out_of_range.fault().kind(), "IndexError");

        let missing_key = chain(vec![Operation::attr("memory"), Operation::item("nope")])
            .resolve(&root, &context)
            .await
            .unwrap_err();
        assert_eq!(missing_key.fault().kind(), "KeyError");
        assert_eq!(missing_key.fault().message(), "\"nope\"");

        let attr_on_data = chain(vec![Operation::attr("memory"), Operation::attr("label")])
            .resolve(&root, &context)
            .await
            .unwrap_err();
        assert_eq!(
            attr_on_data.fault().message(),
            "'object' value has no attribute 'label'"
        );
    }

    #[tokio::test]
    async fn access_policy_hides_private_names() {
        let root = Calculator::new();
        let failure = chain(vec![Operation::attr("_secret")])
            .resolve(&root, &ResolveContext::default())
            .await
            .unwrap_err();
        assert_eq!(failure.fault().kind(), "PermissionError");
    }

    #[tokio::test]
    async fn pass_to_receives_current_value() {
        let root = Calculator::new();
        let functions = FunctionTable::new().with("scale", |subject, args| async move {
            let Subject::Value(value) = subject else {
                return Err(Fault::type_error("scale() expects a value"));
            };
            args.int("scale", 0)
                .map(|factor| Output::Value(json!(value.as_i64().unwrap_or(0) * factor)))
        });
        let context = ResolveContext::new(functions, AccessPolicy::default());

        let resolved = chain(vec![
            Operation::attr("add"),
            Operation::call(Args::new(vec![json!(2), json!(3)])),
            Operation::pass_to("scale", Args::new(vec![json!(10)])),
        ])
        .resolve(&root, &context)
        .await
        .unwrap();
        assert_eq!(resolved, Resolved::Value(json!(50)));

        let unknown = chain(vec![Operation::pass_to("nope", Args::default())])
            .resolve(&root, &context)
            .await
            .unwrap_err();
        assert_eq!(unknown.fault().kind(), "NameError");
    }
}
