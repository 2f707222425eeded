//! Calling-side controller.
//!
//! `EsThread` owns one agent connection. Every exposed method becomes a
//! [`Method`] proxy whose calls are correlated by uid, tracked in a pending
//! table until the agent answers, and surfaced as [`CallHandle`] futures.
//!
//! Termination rejects every outstanding call with [`CallError::Terminated`];
//! later calls fail immediately.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ThreadConfig;
use crate::transfer::Payload;
use crate::transport::{
    ControllerMessage, Event, PortReceiver, PortSender, Transport, TransportError, Uid,
    WorkerMessage,
};
use crate::value::Value;

/// Failure to create or manage a thread.
#[derive(Debug, Error)]
pub enum ThreadError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("agent did not send Ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("agent failed before becoming ready: {0}")]
    AgentFailed(String),

    #[error("agent closed its channel before becoming ready")]
    Closed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("agent does not expose expected methods: {0:?}")]
    MissingMethods(Vec<String>),

    #[error("unknown method: {0}")]
    UnknownMethod(String),
}

/// Why a single call did not produce a value.
#[derive(Debug, Error)]
pub enum CallError {
    /// The method failed inside the agent; carries its error text verbatim.
    #[error("{0}")]
    Remote(String),

    #[error("thread terminated")]
    Terminated,

    #[error("agent disconnected")]
    Disconnected,

    #[error("failed to post call: {0}")]
    Post(#[source] TransportError),
}

type Reply = Result<Value, CallError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Terminated,
    Disconnected,
}

impl State {
    const fn error(self) -> CallError {
        match self {
            Self::Open | Self::Terminated => CallError::Terminated,
            Self::Disconnected => CallError::Disconnected,
        }
    }
}

struct CallTable {
    state: State,
    sender: Option<PortSender>,
    pending: HashMap<Uid, oneshot::Sender<Reply>>,
}

/// State shared by the controller, its method proxies and its listener.
struct Inner {
    calls: Mutex<CallTable>,
    /// Mirrors `pending.len()`; updated under the `calls` lock.
    depth: watch::Sender<usize>,
    next_uid: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, CallTable> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call(&self, method: &str, args: Vec<Payload>) -> CallHandle {
        let mut transfer = Vec::new();
        let args: Vec<Value> = args
            .into_iter()
            .map(|arg| {
                let (value, buffers) = arg.into_parts();
                transfer.extend(buffers);
                value
            })
            .collect();

        let (tx, rx) = oneshot::channel();
        let (uid, sender) = {
            let mut calls = self.lock();
            let sender = match (&calls.state, &calls.sender) {
                (State::Open, Some(sender)) => sender.clone(),
                (state, _) => return CallHandle::failed(state.error()),
            };
            let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
            calls.pending.insert(uid, tx);
            self.depth.send_replace(calls.pending.len());
            (uid, sender)
        };

        debug!(uid, method, transferred = transfer.len(), "Posting call");
        let message = ControllerMessage::Run {
            uid,
            method: method.to_string(),
            args,
        };
        if let Err(e) = sender.post_message(&message.into(), &transfer) {
            warn!(uid, method, error = %e, "Failed to post call");
            self.settle(uid, Err(CallError::Post(e)));
        }

        CallHandle::pending(rx)
    }

    /// Resolve the call with `uid`, if it is still outstanding.
    fn settle(&self, uid: Uid, reply: Reply) {
        let waiter = {
            let mut calls = self.lock();
            let waiter = calls.pending.remove(&uid);
            if waiter.is_some() {
                self.depth.send_replace(calls.pending.len());
            }
            waiter
        };

        match waiter {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => debug!(uid, "Discarding response for unknown uid"),
        }
    }

    /// Stop accepting calls and reject everything outstanding.
    ///
    /// Returns how many calls were rejected.
    fn close(&self, state: State) -> usize {
        let (drained, sender, effective) = {
            let mut calls = self.lock();
            if state == State::Terminated || calls.state == State::Open {
                calls.state = state;
            }
            let drained: Vec<_> = calls.pending.drain().collect();
            self.depth.send_replace(0);
            (drained, calls.sender.take(), calls.state)
        };
        drop(sender);

        let rejected = drained.len();
        for (_, waiter) in drained {
            let _ = waiter.send(Err(effective.error()));
        }
        rejected
    }

    fn sender(&self) -> Option<PortSender> {
        let calls = self.lock();
        match calls.state {
            State::Open => calls.sender.clone(),
            State::Terminated | State::Disconnected => None,
        }
    }
}

/// Pending result of one call.
///
/// Resolves with the method's return value, or rejects with the agent's
/// error, termination or disconnection.
#[must_use = "a call's outcome is only observable by awaiting its handle"]
pub struct CallHandle {
    state: CallState,
}

enum CallState {
    Pending(oneshot::Receiver<Reply>),
    Failed(Option<CallError>),
}

impl CallHandle {
    const fn pending(rx: oneshot::Receiver<Reply>) -> Self {
        Self {
            state: CallState::Pending(rx),
        }
    }

    const fn failed(error: CallError) -> Self {
        Self {
            state: CallState::Failed(Some(error)),
        }
    }
}

impl Future for CallHandle {
    type Output = Reply;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Reply> {
        match &mut self.get_mut().state {
            CallState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(CallError::Disconnected))),
            CallState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(CallError::Terminated)))
            }
        }
    }
}

/// Callable proxy for one exposed method.
#[derive(Clone)]
pub struct Method {
    name: Arc<str>,
    inner: Arc<Inner>,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post a call and return its handle without waiting.
    ///
    /// Arguments wrapped in [`Transfer`](crate::Transfer) have their buffers
    /// moved to the agent; the caller's handles become detached.
    pub fn call<I, A>(&self, args: I) -> CallHandle
    where
        I: IntoIterator<Item = A>,
        A: Into<Payload>,
    {
        self.inner
            .call(&self.name, args.into_iter().map(Into::into).collect())
    }

    pub fn call_no_args(&self) -> CallHandle {
        self.inner.call(&self.name, Vec::new())
    }
}

/// Controller for one agent connection.
pub struct EsThread {
    inner: Arc<Inner>,
    methods: Vec<String>,
    listener: JoinHandle<()>,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
}

impl EsThread {
    /// Spawn over `transport` with default settings.
    pub async fn spawn<T>(transport: T) -> Result<Self, ThreadError>
    where
        T: Transport + 'static,
    {
        Self::spawn_with(transport, &ThreadConfig::default()).await
    }

    /// Take the transport's port, wait for the agent's Ready and start
    /// listening for responses.
    #[instrument(skip_all, fields(ready_timeout = ?config.ready_timeout))]
    pub async fn spawn_with<T>(transport: T, config: &ThreadConfig) -> Result<Self, ThreadError>
    where
        T: Transport + 'static,
    {
        let mut transport: Box<dyn Transport> = Box::new(transport);

        let (sender, mut receiver) = transport.take_port()?.split();

        let handshake = tokio::time::timeout(config.ready_timeout, wait_ready(&mut receiver))
            .await
            .unwrap_or(Err(ThreadError::ReadyTimeout(config.ready_timeout)))
            .and_then(|methods| check_expected(methods, &config.expected_methods));

        let methods = match handshake {
            Ok(methods) => methods,
            Err(e) => {
                if let Err(shutdown) = transport.terminate().await {
                    warn!(error = %shutdown, "Failed to release agent after handshake failure");
                }
                return Err(e);
            }
        };

        let (depth, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            calls: Mutex::new(CallTable {
                state: State::Open,
                sender: Some(sender),
                pending: HashMap::new(),
            }),
            depth,
            next_uid: AtomicU64::new(1),
        });

        let listener = tokio::spawn(listen(Arc::clone(&inner), receiver));
        info!(methods = ?methods, "Thread ready");

        Ok(Self {
            inner,
            methods,
            listener,
            transport: tokio::sync::Mutex::new(transport),
        })
    }

    /// Names of the methods the agent advertised.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(String::as_str)
    }

    /// Proxy for an advertised method.
    pub fn method(&self, name: &str) -> Result<Method, ThreadError> {
        if !self.methods.iter().any(|m| m == name) {
            return Err(ThreadError::UnknownMethod(name.to_string()));
        }
        Ok(Method {
            name: Arc::from(name),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Calls issued and not yet settled.
    pub fn num_queued_jobs(&self) -> usize {
        *self.inner.depth.borrow()
    }

    /// Wait until no calls are outstanding.
    ///
    /// Resolves immediately if nothing is queued. Calls queued while waiting
    /// extend the wait.
    pub async fn settled(&self) {
        let mut depth = self.inner.depth.subscribe();
        // The sender lives in `self.inner`, so this cannot observe a close.
        let _ = depth.wait_for(|queued| *queued == 0).await;
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().state != State::Open
    }

    /// Whether the underlying native context is still running.
    pub async fn is_alive(&self) -> bool {
        self.transport.lock().await.is_alive()
    }

    /// Ask the agent to stop, reject outstanding calls and release the
    /// native context. Idempotent.
    pub async fn terminate(&self) -> Result<(), ThreadError> {
        if let Some(sender) = self.inner.sender() {
            if let Err(e) = sender.post_message(&ControllerMessage::Terminate.into(), &[]) {
                warn!(error = %e, "Graceful terminate failed");
            }
        }

        let rejected = self.inner.close(State::Terminated);
        self.listener.abort();

        self.transport.lock().await.terminate().await?;
        info!(rejected, "Thread terminated");
        Ok(())
    }
}

impl Drop for EsThread {
    fn drop(&mut self) {
        self.inner.close(State::Terminated);
        self.listener.abort();
    }
}

async fn wait_ready(receiver: &mut PortReceiver) -> Result<Vec<String>, ThreadError> {
    match receiver.recv().await.ok_or(ThreadError::Closed)? {
        Event::Error(event) => Err(ThreadError::AgentFailed(event.message)),
        Event::Message(event) => match WorkerMessage::try_from(event.data) {
            Ok(WorkerMessage::Ready { methods }) => Ok(methods),
            Ok(other) => Err(ThreadError::Handshake(format!(
                "expected Ready, got {other:?}"
            ))),
            Err(e) => Err(ThreadError::Handshake(e.to_string())),
        },
    }
}

fn check_expected(methods: Vec<String>, expected: &[String]) -> Result<Vec<String>, ThreadError> {
    let missing: Vec<String> = expected
        .iter()
        .filter(|name| !methods.contains(name))
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(methods)
    } else {
        Err(ThreadError::MissingMethods(missing))
    }
}

/// Route agent responses to their pending calls until the channel closes.
async fn listen(inner: Arc<Inner>, mut receiver: PortReceiver) {
    while let Some(event) = receiver.recv().await {
        let data = match event {
            Event::Message(event) => event.data,
            Event::Error(event) => {
                error!(error = %event.message, "Agent reported a fault");
                continue;
            }
        };

        match WorkerMessage::try_from(data) {
            Ok(WorkerMessage::Result { uid, value }) => {
                debug!(uid, "Call resolved");
                inner.settle(uid, Ok(value));
            }
            Ok(WorkerMessage::Error { uid, error }) => {
                debug!(uid, error = %error, "Call rejected");
                inner.settle(uid, Err(CallError::Remote(error)));
            }
            Ok(WorkerMessage::Ready { .. }) => debug!("Ignoring repeated Ready"),
            Err(e) => warn!(error = %e, "Discarding malformed message"),
        }
    }

    let rejected = inner.close(State::Disconnected);
    warn!(rejected, "Agent channel closed");
}
