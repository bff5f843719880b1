//! The `Outcome` sum type: the persisted shape of a task or execution result

use serde::{Deserialize, Serialize};

/// Ok/Err variant persisted as `Task.result` / `Execution.result`.
///
/// Both orchestrator and activity bodies return this directly — there is no
/// implicit wrapping at the worker boundary. [`Outcome::ok`] and
/// [`Outcome::err`] cover the common cases of building one from a value or a
/// message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(serde_json::Value),
    Err(String),
}

impl Outcome {
    pub fn ok(value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Outcome::Ok(v),
            Err(e) => Outcome::Err(format!("failed to serialize outcome value: {e}")),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Outcome::Err(message.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Outcome::Err(_))
    }

    /// The success payload, deserialized into `T`. Fails if this is an `Err`
    /// or if the payload doesn't match `T`'s shape.
    pub fn value<T: for<'de> Deserialize<'de>>(&self) -> Result<T, String> {
        match self {
            Outcome::Ok(v) => {
                serde_json::from_value(v.clone()).map_err(|e| format!("decode outcome: {e}"))
            }
            Outcome::Err(e) => Err(e.clone()),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Outcome::Err(e) => Some(e.as_str()),
            Outcome::Ok(_) => None,
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome
where
    T: Serialize,
    E: std::fmt::Display,
{
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Outcome::ok(v),
            Err(e) => Outcome::err(e.to_string()),
        }
    }
}
