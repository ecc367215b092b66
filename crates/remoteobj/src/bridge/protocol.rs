//! Wire protocol types for handle traffic.
//!
//! One request per resolve, one response per request:
//! - **Request**: the chain as a list of operation records
//! - **Response**: `[result, error]`, where result is `"self"` or `{"value": v}`

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::chain::{Chain, Operation, ResolveFailure};
use crate::error::Fault;

/// Identifier for an exposed handle, used in log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(uuid::Uuid);

impl HandleId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller to owner: the operations to apply to the root object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Request {
    pub ops: Vec<Operation>,
}

impl Request {
    pub fn new(ops: Vec<Operation>) -> Self {
        Self { ops }
    }
}

impl From<&Chain> for Request {
    fn from(chain: &Chain) -> Self {
        Self::new(chain.ops().to_vec())
    }
}

/// Result half of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// The result is the root object itself.
    #[serde(rename = "self")]
    SelfRef,

    #[serde(rename = "value")]
    Value(Value),

    /// A live object with no value form. Never encodes.
    #[serde(
        rename = "opaque",
        serialize_with = "refuse_opaque",
        skip_deserializing
    )]
    Opaque(String),
}

impl Payload {
    pub fn opaque(description: impl Into<String>) -> Self {
        Self::Opaque(description.into())
    }
}

fn refuse_opaque<S: Serializer>(description: &str, _serializer: S) -> Result<S::Ok, S::Error> {
    Err(serde::ser::Error::custom(format!(
        "{description} has no value representation"
    )))
}

/// Error half of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: String,
    pub message: String,
    pub trace: String,
}

impl ErrorEnvelope {
    pub fn from_failure(failure: &ResolveFailure) -> Self {
        let fault = failure.fault();
        Self {
            kind: fault.kind().to_string(),
            message: fault.message().to_string(),
            trace: failure.trace(),
        }
    }

    /// Envelope for a fault raised outside any chain step.
    pub fn from_fault(chain: &str, fault: &Fault) -> Self {
        Self {
            kind: fault.kind().to_string(),
            message: fault.message().to_string(),
            trace: format!("while resolving {chain}\n{fault}"),
        }
    }
}

/// Owner to caller: `[result, error]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response(pub Payload, pub Option<ErrorEnvelope>);

impl Response {
    pub fn value(value: Value) -> Self {
        Self(Payload::Value(value), None)
    }

    pub fn selfref() -> Self {
        Self(Payload::SelfRef, None)
    }

    pub fn error(envelope: ErrorEnvelope) -> Self {
        Self(Payload::Value(Value::Null), Some(envelope))
    }
}
