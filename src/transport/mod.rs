//! Transport layer for controller ↔ agent communication.
//!
//! Provides the `Transport` trait (the native handle a controller is spawned
//! from), the event types ports deliver, and the in-process agent contexts:
//! `Worker` (single client) and `SharedWorker` (many clients).

mod clone;
pub mod port;
pub mod protocol;
pub mod worker;

pub use clone::{structured_clone, DataCloneError};
pub use port::{MessageChannel, MessagePort, PortReceiver, PortSender};
pub use protocol::{ControllerMessage, ProtocolError, Uid, WorkerMessage};
pub use worker::{SharedWorker, SharedWorkerConnection, Worker};

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{WorkerKind, WorkerOptions};
use crate::value::Value;

/// What a port delivers.
#[derive(Debug)]
pub enum Event {
    Message(MessageEvent),
    Error(ErrorEvent),
}

/// A posted value, already owned by the receiver.
#[derive(Debug)]
pub struct MessageEvent {
    pub data: Value,
}

/// A failure reported by the agent context itself, not tied to any call.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub message: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("message port is closed")]
    Closed,

    #[error(transparent)]
    DataClone(#[from] DataCloneError),

    #[error("failed to spawn agent thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("message port was already taken")]
    PortTaken,
}

/// Abstraction over a native agent context.
///
/// The controller only needs the port to talk over and a way to tear the
/// context down.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand out this client's port. Succeeds once.
    fn take_port(&mut self) -> Result<MessagePort, TransportError>;

    /// Release the native context.
    async fn terminate(&mut self) -> Result<(), TransportError>;

    /// Check whether the underlying context is still running.
    fn is_alive(&self) -> bool;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn take_port(&mut self) -> Result<MessagePort, TransportError> {
        (**self).take_port()
    }

    async fn terminate(&mut self) -> Result<(), TransportError> {
        (**self).terminate().await
    }

    fn is_alive(&self) -> bool {
        (**self).is_alive()
    }
}

/// Spawn an agent of the kind named in `options` and return a transport for
/// one client of it.
pub fn spawn<F>(entry: F, options: &WorkerOptions) -> Result<Box<dyn Transport>, TransportError>
where
    F: FnOnce() + Send + 'static,
{
    match options.kind {
        WorkerKind::Dedicated => Ok(Box::new(Worker::spawn(entry, options)?)),
        WorkerKind::Shared => {
            let worker = SharedWorker::spawn(entry, options)?;
            Ok(Box::new(worker.connect()?))
        }
    }
}
