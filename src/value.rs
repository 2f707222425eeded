//! Values carried across the agent boundary.
//!
//! `Value` is the structured-clone data model: plain data plus detachable
//! byte buffers. Buffers are reference-like handles, so the same buffer can
//! be named both inside a payload and in a transfer list.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Attempted to read or write a buffer whose contents were moved away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("array buffer is detached")]
pub struct DetachedError;

/// A byte buffer whose ownership can be moved to another agent.
///
/// Cloning the handle aliases the same storage. Transferring the buffer
/// detaches every alias on the sending side.
#[derive(Clone)]
pub struct ArrayBuffer {
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
}

impl ArrayBuffer {
    /// Wrap owned bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(Some(bytes.into()))),
        }
    }

    /// A zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    /// Byte length, 0 once detached.
    pub fn byte_length(&self) -> usize {
        self.lock().as_ref().map_or(0, Vec::len)
    }

    pub fn is_detached(&self) -> bool {
        self.lock().is_none()
    }

    /// Whether both handles refer to the same underlying buffer.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    /// Copy the contents out.
    pub fn to_vec(&self) -> Result<Vec<u8>, DetachedError> {
        self.with_bytes(<[u8]>::to_vec)
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, DetachedError> {
        self.lock().as_deref().map(f).ok_or(DetachedError)
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, DetachedError> {
        self.lock().as_deref_mut().map(f).ok_or(DetachedError)
    }

    /// Move the storage out, leaving this handle (and its aliases) detached.
    pub(crate) fn detach(&self) -> Option<Vec<u8>> {
        self.lock().take()
    }

    /// A handle with no storage yet, filled in by [`ArrayBuffer::attach`].
    pub(crate) fn detached() -> Self {
        Self {
            bytes: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn attach(&self, bytes: Vec<u8>) {
        *self.lock() = Some(bytes);
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.bytes) as usize
    }
}

impl PartialEq for ArrayBuffer {
    fn eq(&self, other: &Self) -> bool {
        if self.same(other) {
            return true;
        }
        // Never hold both locks at once.
        let ours = self.lock().clone();
        ours == *other.lock()
    }
}

impl fmt::Debug for ArrayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lock().as_ref() {
            Some(bytes) => write!(f, "ArrayBuffer({} bytes)", bytes.len()),
            None => f.write_str("ArrayBuffer(detached)"),
        }
    }
}

impl From<Vec<u8>> for ArrayBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// Pointer identity of a buffer, used to memoize buffers during cloning.
pub(crate) fn buffer_key(buffer: &ArrayBuffer) -> usize {
    buffer.addr()
}

/// A structured-clone value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Buffer(ArrayBuffer),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Build an object from key/value pairs.
    pub fn object<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Self>,
    {
        Self::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Short name of the variant, for error messages.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Buffer(_) => "buffer",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub const fn as_buffer(&self) -> Option<&ArrayBuffer> {
        match self {
            Self::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub const fn as_object(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a field of an object value.
    pub fn get(&self, key: &str) -> Option<&Self> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Every buffer reachable from this value, in depth-first order.
    pub fn buffers(&self) -> Vec<&ArrayBuffer> {
        let mut out = Vec::new();
        self.collect_buffers(&mut out);
        out
    }

    fn collect_buffers<'a>(&'a self, out: &mut Vec<&'a ArrayBuffer>) {
        match self {
            Self::Buffer(b) => out.push(b),
            Self::Array(items) => items.iter().for_each(|v| v.collect_buffers(out)),
            Self::Object(map) => map.values().for_each(|v| v.collect_buffers(out)),
            _ => {}
        }
    }

    /// Render as JSON. Buffers become arrays of bytes; detached buffers
    /// become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Convert any serializable type into a value (buffers are not produced;
    /// byte sequences arrive as arrays of integers).
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::from)
    }

    /// Decode into a typed value through its JSON form.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_json())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::String(s) => serializer.serialize_str(s),
            Self::Buffer(buffer) => match buffer.to_vec() {
                Ok(bytes) => {
                    let mut seq = serializer.serialize_seq(Some(bytes.len()))?;
                    for byte in &bytes {
                        seq.serialize_element(byte)?;
                    }
                    seq.end()
                }
                Err(_) => serializer.serialize_unit(),
            },
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Object(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(entries) => Self::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<ArrayBuffer> for Value {
    fn from(buffer: ArrayBuffer) -> Self {
        Self::Buffer(buffer)
    }
}

impl From<Vec<Self>> for Value {
    fn from(items: Vec<Self>) -> Self {
        Self::Array(items)
    }
}

impl From<BTreeMap<String, Self>> for Value {
    fn from(entries: BTreeMap<String, Self>) -> Self {
        Self::Object(entries)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
