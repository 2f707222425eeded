//! Structured clone with buffer transfer.
//!
//! Produces a value owned entirely by the receiver. Buffers on the transfer
//! list are moved (sender side detached, no byte copy); every other buffer is
//! copied. Validation happens before anything is detached, so a failed clone
//! leaves the sender untouched.

use std::collections::HashMap;

use thiserror::Error;

use crate::value::{buffer_key, ArrayBuffer, Value};

/// Failure to clone a value for posting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataCloneError {
    #[error("data clone error: array buffer is detached")]
    DetachedBuffer,

    #[error("data clone error: array buffer listed for transfer more than once")]
    DuplicateTransfer,
}

pub fn structured_clone(value: &Value, transfer: &[ArrayBuffer]) -> Result<Value, DataCloneError> {
    // Placeholders for transferred buffers; storage is moved in at the end.
    let mut memo: HashMap<usize, ArrayBuffer> = HashMap::with_capacity(transfer.len());
    let mut moves = Vec::with_capacity(transfer.len());
    for buffer in transfer {
        if buffer.is_detached() {
            return Err(DataCloneError::DetachedBuffer);
        }
        let target = ArrayBuffer::detached();
        if memo.insert(buffer_key(buffer), target.clone()).is_some() {
            return Err(DataCloneError::DuplicateTransfer);
        }
        moves.push((buffer, target));
    }

    let cloned = clone_value(value, &mut memo)?;

    for (source, target) in moves {
        if let Some(bytes) = source.detach() {
            target.attach(bytes);
        }
    }

    Ok(cloned)
}

fn clone_value(
    value: &Value,
    memo: &mut HashMap<usize, ArrayBuffer>,
) -> Result<Value, DataCloneError> {
    Ok(match value {
        Value::Buffer(buffer) => {
            let key = buffer_key(buffer);
            if let Some(existing) = memo.get(&key) {
                Value::Buffer(existing.clone())
            } else {
                let bytes = buffer
                    .to_vec()
                    .map_err(|_| DataCloneError::DetachedBuffer)?;
                let copy = ArrayBuffer::new(bytes);
                memo.insert(key, copy.clone());
                Value::Buffer(copy)
            }
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| clone_value(item, memo))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), clone_value(v, memo)?)))
                .collect::<Result<_, DataCloneError>>()?,
        ),
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Bool(*b),
        Value::Int(i) => Value::Int(*i),
        Value::Float(f) => Value::Float(*f),
        Value::String(s) => Value::String(s.clone()),
    })
}
