//! Transfer descriptors: a payload plus the buffers inside it that must be
//! moved rather than copied when it crosses the agent boundary.

use thiserror::Error;

use crate::value::{ArrayBuffer, Value};

/// Failure to build a transfer descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The value named for transfer is not a buffer.
    #[error("object is not transferable: {0}")]
    NotTransferable(&'static str),

    /// The buffer named for transfer is not reachable from the payload.
    #[error("object is not transferable: buffer is not part of the payload")]
    NotInPayload,
}

/// A payload paired with the buffers to move along with it.
///
/// Immutable once built; the only way back out is [`Transfer::into_parts`].
#[derive(Debug, Clone)]
pub struct Transfer {
    payload: Value,
    transfer_list: Vec<ArrayBuffer>,
}

impl Transfer {
    /// Transfer a value that is itself a buffer.
    pub fn new(payload: impl Into<Value>) -> Result<Self, TransferError> {
        let payload = payload.into();
        let buffer = match &payload {
            Value::Buffer(buffer) => buffer.clone(),
            other => return Err(TransferError::NotTransferable(other.kind())),
        };
        Ok(Self {
            payload,
            transfer_list: vec![buffer],
        })
    }

    /// Transfer a payload with an explicit list of buffers inside it.
    ///
    /// Every entry must be a buffer reachable from `payload`.
    pub fn with_list(
        payload: impl Into<Value>,
        list: impl IntoIterator<Item = Value>,
    ) -> Result<Self, TransferError> {
        let payload = payload.into();
        let reachable = payload.buffers();
        let mut transfer_list: Vec<ArrayBuffer> = Vec::new();

        for entry in list {
            let buffer = match entry {
                Value::Buffer(buffer) => buffer,
                other => return Err(TransferError::NotTransferable(other.kind())),
            };
            if !reachable.iter().any(|b| b.same(&buffer)) {
                return Err(TransferError::NotInPayload);
            }
            if !transfer_list.iter().any(|b| b.same(&buffer)) {
                transfer_list.push(buffer);
            }
        }

        Ok(Self {
            payload,
            transfer_list,
        })
    }

    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn transfer_list(&self) -> &[ArrayBuffer] {
        &self.transfer_list
    }

    /// Unwrap into the raw payload and the buffers to declare to the port.
    pub fn into_parts(self) -> (Value, Vec<ArrayBuffer>) {
        (self.payload, self.transfer_list)
    }
}

/// A call argument or return value: plain, or wrapped for transfer.
#[derive(Debug, Clone)]
pub enum Payload {
    Plain(Value),
    Transfer(Transfer),
}

impl Payload {
    pub fn into_parts(self) -> (Value, Vec<ArrayBuffer>) {
        match self {
            Self::Plain(value) => (value, Vec::new()),
            Self::Transfer(transfer) => transfer.into_parts(),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Plain(value)
    }
}

impl From<Transfer> for Payload {
    fn from(transfer: Transfer) -> Self {
        Self::Transfer(transfer)
    }
}

impl From<ArrayBuffer> for Payload {
    fn from(buffer: ArrayBuffer) -> Self {
        Self::Plain(Value::Buffer(buffer))
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Plain(Value::from(s))
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Plain(Value::String(s))
    }
}

impl From<i64> for Payload {
    fn from(i: i64) -> Self {
        Self::Plain(Value::Int(i))
    }
}
