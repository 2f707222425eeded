//! esthread
//!
//! Call functions running in another thread as if they were local async
//! functions:
//! - Agents expose a named method table with `expose_api`
//! - Controllers spawn over a transport, wait for the agent to be ready and
//!   proxy each method as an awaitable call
//! - Values cross by structured clone; buffers can be transferred instead

pub mod agent;
pub mod config;
pub mod controller;
pub mod transfer;
pub mod transport;
pub mod value;

pub use agent::{expose_api, Api, ApiBuilder};
pub use config::{Config, ThreadConfig, WorkerKind, WorkerOptions};
pub use controller::{CallError, CallHandle, EsThread, Method, ThreadError};
pub use transfer::{Payload, Transfer};
pub use transport::{SharedWorker, Transport, Worker};
pub use value::{ArrayBuffer, Value};
