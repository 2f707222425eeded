//! Controller ↔ agent message types.
//!
//! Messages travel as `Value::Object`s discriminated by a `type` field.
//! Decoding (`TryFrom<Value>`) is the only narrowing step. The `is_*`
//! predicates inspect a borrowed message, accept the same shapes decoding
//! does and never fail.

use std::collections::BTreeMap;

use thiserror::Error;

use super::{Event, MessageEvent};
use crate::value::Value;

/// Per-controller call correlation id.
pub type Uid = u64;

/// A received value does not have the shape the receiver expects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("not a MessageEvent")]
    NotMessageEvent,

    #[error("not a message of the expected shape: {0}")]
    Malformed(String),

    #[error("unrecognized message type: {0}")]
    UnknownType(String),
}

/// Request sent from controller to agent.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerMessage {
    /// Invoke an exposed method.
    Run {
        uid: Uid,
        method: String,
        args: Vec<Value>,
    },
    /// Stop accepting calls.
    Terminate,
}

/// Response sent from agent to controller.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// Agent is ready to accept calls (sent once per connection).
    Ready { methods: Vec<String> },
    /// Call succeeded.
    Result { uid: Uid, value: Value },
    /// Call failed; `error` is the failure's display form.
    Error { uid: Uid, error: String },
}

/// Require a transport event to carry a message.
pub fn assert_message_event(event: Event) -> Result<MessageEvent, ProtocolError> {
    match event {
        Event::Message(message) => Ok(message),
        Event::Error(_) => Err(ProtocolError::NotMessageEvent),
    }
}

pub fn is_run_message(value: &Value) -> bool {
    Shape::of(value).is_some_and(|m| {
        m.has_type("run") && m.has_uid() && m.has_string("method") && m.has_array("args")
    })
}

pub fn is_terminate_message(value: &Value) -> bool {
    Shape::of(value).is_some_and(|m| m.has_type("terminate"))
}

pub fn is_ready_message(value: &Value) -> bool {
    Shape::of(value).is_some_and(|m| m.has_type("ready") && m.has_string_array("methods"))
}

pub fn is_result_message(value: &Value) -> bool {
    Shape::of(value).is_some_and(|m| m.has_type("result") && m.has_uid() && m.has("value"))
}

pub fn is_error_message(value: &Value) -> bool {
    Shape::of(value).is_some_and(|m| m.has_type("error") && m.has_uid() && m.has_string("error"))
}

/// Borrowed view of a message object. Accepts exactly what decoding accepts.
struct Shape<'a>(&'a BTreeMap<String, Value>);

impl<'a> Shape<'a> {
    fn of(value: &'a Value) -> Option<Self> {
        value.as_object().map(Self)
    }

    fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    fn has_type(&self, message_type: &str) -> bool {
        self.0.get("type").and_then(Value::as_str) == Some(message_type)
    }

    fn has_uid(&self) -> bool {
        matches!(self.0.get("uid"), Some(Value::Int(i)) if *i >= 0)
    }

    fn has_string(&self, key: &str) -> bool {
        matches!(self.0.get(key), Some(Value::String(_)))
    }

    fn has_array(&self, key: &str) -> bool {
        matches!(self.0.get(key), Some(Value::Array(_)))
    }

    fn has_string_array(&self, key: &str) -> bool {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .is_some_and(|items| items.iter().all(|item| matches!(item, Value::String(_))))
    }
}

impl From<ControllerMessage> for Value {
    fn from(message: ControllerMessage) -> Self {
        match message {
            ControllerMessage::Run { uid, method, args } => Self::object([
                ("type", Self::from("run")),
                ("uid", encode_uid(uid)),
                ("method", Self::String(method)),
                ("args", Self::Array(args)),
            ]),
            ControllerMessage::Terminate => Self::object([("type", "terminate")]),
        }
    }
}

impl From<WorkerMessage> for Value {
    fn from(message: WorkerMessage) -> Self {
        match message {
            WorkerMessage::Ready { methods } => Self::object([
                ("type", Self::from("ready")),
                (
                    "methods",
                    Self::Array(methods.into_iter().map(Self::String).collect()),
                ),
            ]),
            WorkerMessage::Result { uid, value } => Self::object([
                ("type", Self::from("result")),
                ("uid", encode_uid(uid)),
                ("value", value),
            ]),
            WorkerMessage::Error { uid, error } => Self::object([
                ("type", Self::from("error")),
                ("uid", encode_uid(uid)),
                ("error", Self::String(error)),
            ]),
        }
    }
}

impl TryFrom<Value> for ControllerMessage {
    type Error = ProtocolError;

    fn try_from(value: Value) -> Result<Self, ProtocolError> {
        let mut fields = Fields::new(value)?;
        match fields.message_type()?.as_str() {
            "run" => Ok(Self::Run {
                uid: fields.uid()?,
                method: fields.string("method")?,
                args: fields.array("args")?,
            }),
            "terminate" => Ok(Self::Terminate),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

// `Self::Error` is ambiguous with `TryFrom::Error` here.
#[allow(clippy::use_self)]
impl TryFrom<Value> for WorkerMessage {
    type Error = ProtocolError;

    fn try_from(value: Value) -> Result<Self, ProtocolError> {
        let mut fields = Fields::new(value)?;
        match fields.message_type()?.as_str() {
            "ready" => {
                let methods = fields
                    .array("methods")?
                    .into_iter()
                    .map(|name| match name {
                        Value::String(name) => Ok(name),
                        other => Err(ProtocolError::Malformed(format!(
                            "method name must be a string, got {}",
                            other.kind()
                        ))),
                    })
                    .collect::<Result<_, _>>()?;
                Ok(WorkerMessage::Ready { methods })
            }
            "result" => Ok(WorkerMessage::Result {
                uid: fields.uid()?,
                value: fields.take("value")?,
            }),
            "error" => Ok(WorkerMessage::Error {
                uid: fields.uid()?,
                error: fields.string("error")?,
            }),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn encode_uid(uid: Uid) -> Value {
    Value::Int(uid as i64)
}

/// Field access over a message object, consuming fields as they are read.
struct Fields(BTreeMap<String, Value>);

impl Fields {
    fn new(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(ProtocolError::Malformed(format!(
                "expected an object, got {}",
                other.kind()
            ))),
        }
    }

    fn take(&mut self, key: &str) -> Result<Value, ProtocolError> {
        self.0
            .remove(key)
            .ok_or_else(|| ProtocolError::Malformed(format!("missing field `{key}`")))
    }

    fn message_type(&mut self) -> Result<String, ProtocolError> {
        self.string("type")
    }

    fn string(&mut self, key: &str) -> Result<String, ProtocolError> {
        match self.take(key)? {
            Value::String(s) => Ok(s),
            other => Err(wrong_kind(key, "string", &other)),
        }
    }

    fn array(&mut self, key: &str) -> Result<Vec<Value>, ProtocolError> {
        match self.take(key)? {
            Value::Array(items) => Ok(items),
            other => Err(wrong_kind(key, "array", &other)),
        }
    }

    fn uid(&mut self) -> Result<Uid, ProtocolError> {
        match self.take("uid")? {
            Value::Int(i) => Uid::try_from(i)
                .map_err(|_| ProtocolError::Malformed(format!("negative uid {i}"))),
            other => Err(wrong_kind("uid", "int", &other)),
        }
    }
}

fn wrong_kind(key: &str, expected: &str, got: &Value) -> ProtocolError {
    ProtocolError::Malformed(format!(
        "field `{key}` must be {expected}, got {}",
        got.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ErrorEvent;

    #[test]
    fn predicates_reject_empty_object() {
        let empty = Value::Object(BTreeMap::new());
        assert!(!is_run_message(&empty));
        assert!(!is_terminate_message(&empty));
        assert!(!is_ready_message(&empty));
        assert!(!is_result_message(&empty));
        assert!(!is_error_message(&empty));
    }

    #[test]
    fn predicates_accept_well_formed_messages() {
        let run = Value::from(ControllerMessage::Run {
            uid: 1,
            method: "test".to_string(),
            args: vec![],
        });
        assert!(is_run_message(&run));
        assert!(!is_terminate_message(&run));

        let terminate = Value::from(ControllerMessage::Terminate);
        assert!(is_terminate_message(&terminate));
        assert!(!is_run_message(&terminate));

        let ready = Value::from(WorkerMessage::Ready {
            methods: vec!["a".to_string()],
        });
        assert!(is_ready_message(&ready));
    }

    #[test]
    fn run_without_args_is_rejected() {
        let value = Value::object([
            ("type", Value::from("run")),
            ("uid", Value::Int(1)),
            ("method", Value::from("test")),
        ]);
        assert!(!is_run_message(&value));
        assert_eq!(
            ControllerMessage::try_from(value),
            Err(ProtocolError::Malformed("missing field `args`".to_string()))
        );
    }

    #[test]
    fn unknown_discriminant_is_rejected() {
        let value = Value::object([("type", "launch")]);
        assert!(!is_run_message(&value));
        assert_eq!(
            ControllerMessage::try_from(value),
            Err(ProtocolError::UnknownType("launch".to_string()))
        );
    }

    #[test]
    fn wrong_field_kind_is_rejected() {
        let value = Value::object([
            ("type", Value::from("result")),
            ("uid", Value::from("7")),
            ("value", Value::Null),
        ]);
        assert!(!is_result_message(&value));
    }

    #[test]
    fn error_message_decodes() {
        let value = Value::from(WorkerMessage::Error {
            uid: 42,
            error: "boom".to_string(),
        });
        assert!(is_error_message(&value));
        assert_eq!(
            WorkerMessage::try_from(value),
            Ok(WorkerMessage::Error {
                uid: 42,
                error: "boom".to_string()
            })
        );
    }

    #[test]
    fn result_message_keeps_value() {
        let value = Value::from(WorkerMessage::Result {
            uid: 3,
            value: Value::object([("n", 1)]),
        });
        let WorkerMessage::Result { uid, value } = WorkerMessage::try_from(value).unwrap() else {
            panic!("expected a result message");
        };
        assert_eq!(uid, 3);
        assert_eq!(value.get("n"), Some(&Value::Int(1)));
    }

    #[test]
    fn predicates_agree_with_decoding() {
        let samples = [
            Value::from(ControllerMessage::Run {
                uid: 9,
                method: "scale".to_string(),
                args: vec![Value::from(crate::value::ArrayBuffer::zeroed(4096))],
            }),
            Value::from(ControllerMessage::Terminate),
            Value::from(WorkerMessage::Ready {
                methods: vec!["a".to_string(), "b".to_string()],
            }),
            Value::from(WorkerMessage::Result {
                uid: 1,
                value: Value::Null,
            }),
            Value::from(WorkerMessage::Error {
                uid: 2,
                error: "boom".to_string(),
            }),
            Value::object([
                ("type", Value::from("ready")),
                ("methods", Value::Array(vec![Value::Int(1)])),
            ]),
            Value::object([
                ("type", Value::from("result")),
                ("uid", Value::Int(-1)),
                ("value", Value::Null),
            ]),
            Value::object([("type", Value::from("error")), ("uid", Value::Int(4))]),
            Value::object([("type", Value::Int(1))]),
            Value::from("run"),
            Value::Null,
        ];

        for sample in &samples {
            let controller = ControllerMessage::try_from(sample.clone());
            let worker = WorkerMessage::try_from(sample.clone());
            assert_eq!(
                is_run_message(sample),
                matches!(controller, Ok(ControllerMessage::Run { .. })),
                "{sample:?}"
            );
            assert_eq!(
                is_terminate_message(sample),
                matches!(controller, Ok(ControllerMessage::Terminate)),
                "{sample:?}"
            );
            assert_eq!(
                is_ready_message(sample),
                matches!(worker, Ok(WorkerMessage::Ready { .. })),
                "{sample:?}"
            );
            assert_eq!(
                is_result_message(sample),
                matches!(worker, Ok(WorkerMessage::Result { .. })),
                "{sample:?}"
            );
            assert_eq!(
                is_error_message(sample),
                matches!(worker, Ok(WorkerMessage::Error { .. })),
                "{sample:?}"
            );
        }
    }

    #[test]
    fn assert_message_event_rejects_error_event() {
        let event = Event::Error(ErrorEvent {
            message: "error".to_string(),
        });
        assert_eq!(
            assert_message_event(event).unwrap_err(),
            ProtocolError::NotMessageEvent
        );

        let event = Event::Message(MessageEvent { data: Value::Null });
        assert!(assert_message_event(event).is_ok());
    }
}
