//! Export tasks.
//!
//! Starting an export returns a task id; the task's progress is then polled with
//! `SYNO.Virtualization.API.Task.Info`. This module interprets those envelopes.

use std::fmt;

use serde_json::Value;

use crate::client::Envelope;
use crate::codes;

/// Opaque export task token.
///
/// DSM hands these out as strings or numbers; both are kept in their query-string
/// form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Read a task id from a JSON string or number.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How an export task ended, judged from its last status envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task reported `data.success`.
    Succeeded,
    /// DSM no longer (or not yet) knew the task id. Not a failure.
    LookupRaced,
    /// The task finished without success. `code` is the task's own error code,
    /// falling back to the envelope's.
    Failed { code: Option<i64> },
}

impl TaskOutcome {
    pub fn classify(envelope: &Envelope) -> Self {
        if envelope.error_code() == Some(codes::TASK_NOT_FOUND) {
            return Self::LookupRaced;
        }
        if envelope.data_field("success").is_some_and(truthy) {
            return Self::Succeeded;
        }
        let code = envelope
            .data_field("error")
            .and_then(nested_code)
            .or_else(|| envelope.error_code());
        Self::Failed { code }
    }
}

/// Whether a status envelope means the task is over.
///
/// A successful envelope is over once `data.finish` is set; an envelope failing
/// with "Cannot find task_id" is over too, since there is nothing left to poll.
pub fn is_finished(envelope: &Envelope) -> bool {
    if envelope.success {
        envelope.data_field("finish").is_some_and(truthy)
    } else {
        envelope.error_code() == Some(codes::TASK_NOT_FOUND)
    }
}

fn nested_code(error: &Value) -> Option<i64> {
    match error {
        Value::Number(n) => n.as_i64(),
        Value::Object(map) => map.get("code").and_then(Value::as_i64),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
