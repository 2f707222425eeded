//! In-process agent contexts.
//!
//! Each agent runs on its own OS thread with a current-thread tokio runtime
//! and a `LocalSet` as its run loop. The worker scope is installed on that
//! thread before the entry function runs, so the entry can call
//! [`expose_api`](crate::agent::expose_api).

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tracing::{debug, error, warn};

use super::{MessageChannel, MessagePort, PortSender, Transport, TransportError};
use crate::agent::panic_message;
use crate::agent::scope::{self, Inbound, ScopeKind};
use crate::config::WorkerOptions;

/// A single-client agent.
///
/// The agent thread runs until [`Transport::terminate`] is called or the
/// handle is dropped.
pub struct Worker {
    name: String,
    port: Option<MessagePort>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<AgentThread>,
    terminate_timeout: Duration,
}

impl Worker {
    /// Start an agent thread running `entry`.
    pub fn spawn<F>(entry: F, options: &WorkerOptions) -> Result<Self, TransportError>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = options.thread_name();
        let (client, agent) = MessageChannel::new();
        let faults = agent.sender().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        let scope_name = options.name.clone();

        let handle = options
            .thread_builder()
            .spawn(move || {
                run_agent(
                    entry,
                    ScopeKind::Dedicated,
                    scope_name,
                    Inbound::Port(agent),
                    shutdown_rx,
                    Some(faults),
                    exited_tx,
                );
            })
            .map_err(TransportError::Spawn)?;

        debug!(worker = %name, "Spawned dedicated worker");

        Ok(Self {
            name,
            port: Some(client),
            shutdown: Some(shutdown_tx),
            thread: Some(AgentThread {
                handle,
                exited: exited_rx,
            }),
            terminate_timeout: options.terminate_timeout(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Transport for Worker {
    fn take_port(&mut self) -> Result<MessagePort, TransportError> {
        self.port.take().ok_or(TransportError::PortTaken)
    }

    async fn terminate(&mut self) -> Result<(), TransportError> {
        let Some(shutdown) = self.shutdown.take() else {
            return Ok(());
        };
        let _ = shutdown.send(());
        self.port = None;

        if let Some(thread) = self.thread.take() {
            thread.join(&self.name, self.terminate_timeout).await;
        }
        debug!(worker = %self.name, "Worker terminated");
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.shutdown.is_some() && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// A multi-client agent.
///
/// Every [`SharedWorker::connect`] yields an independent client with its own
/// port. The agent lives while any handle or connection is alive, or until
/// [`SharedWorker::terminate`].
#[derive(Clone)]
pub struct SharedWorker {
    inner: Arc<SharedInner>,
}

struct SharedInner {
    name: String,
    connections: mpsc::UnboundedSender<MessagePort>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<AgentThread>>,
    terminate_timeout: Duration,
}

impl SharedWorker {
    /// Start a shared agent thread running `entry`.
    pub fn spawn<F>(entry: F, options: &WorkerOptions) -> Result<Self, TransportError>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = options.thread_name();
        let (connections_tx, connections_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        let scope_name = options.name.clone();

        let handle = options
            .thread_builder()
            .spawn(move || {
                run_agent(
                    entry,
                    ScopeKind::Shared,
                    scope_name,
                    Inbound::Connections(connections_rx),
                    shutdown_rx,
                    None,
                    exited_tx,
                );
            })
            .map_err(TransportError::Spawn)?;

        debug!(worker = %name, "Spawned shared worker");

        Ok(Self {
            inner: Arc::new(SharedInner {
                name,
                connections: connections_tx,
                shutdown: Mutex::new(Some(shutdown_tx)),
                thread: Mutex::new(Some(AgentThread {
                    handle,
                    exited: exited_rx,
                })),
                terminate_timeout: options.terminate_timeout(),
            }),
        })
    }

    /// Open a new client connection to the agent.
    pub fn connect(&self) -> Result<SharedWorkerConnection, TransportError> {
        let (client, agent) = MessageChannel::new();
        self.inner
            .connections
            .send(agent)
            .map_err(|_| TransportError::Closed)?;
        debug!(worker = %self.inner.name, "Connected to shared worker");
        Ok(SharedWorkerConnection {
            worker: self.clone(),
            port: Some(client),
            open: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Stop the agent for every client.
    pub async fn terminate(&self) -> Result<(), TransportError> {
        let shutdown = lock(&self.inner.shutdown).take();
        let Some(shutdown) = shutdown else {
            return Ok(());
        };
        let _ = shutdown.send(());

        let thread = lock(&self.inner.thread).take();
        if let Some(thread) = thread {
            thread.join(&self.inner.name, self.inner.terminate_timeout).await;
        }
        debug!(worker = %self.inner.name, "Shared worker terminated");
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        lock(&self.inner.shutdown).is_some()
            && lock(&self.inner.thread)
                .as_ref()
                .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SharedInner {
    fn drop(&mut self) {
        let shutdown = self
            .shutdown
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
    }
}

/// One client of a [`SharedWorker`].
pub struct SharedWorkerConnection {
    worker: SharedWorker,
    port: Option<MessagePort>,
    open: bool,
}

impl SharedWorkerConnection {
    pub const fn worker(&self) -> &SharedWorker {
        &self.worker
    }
}

#[async_trait]
impl Transport for SharedWorkerConnection {
    fn take_port(&mut self) -> Result<MessagePort, TransportError> {
        self.port.take().ok_or(TransportError::PortTaken)
    }

    /// Close this client only; the agent keeps serving other connections.
    async fn terminate(&mut self) -> Result<(), TransportError> {
        if self.open {
            self.open = false;
            self.port = None;
            debug!(worker = %self.worker.name(), "Shared worker connection closed");
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.open && self.worker.is_alive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An agent's OS thread and the signal it fires on its way out.
struct AgentThread {
    handle: JoinHandle<()>,
    /// Closed once the agent has left its run loop and dropped its scope.
    exited: oneshot::Receiver<()>,
}

impl AgentThread {
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait up to `timeout` for the agent to exit, then join its thread.
    /// A thread that overruns is detached and left to finish on its own.
    async fn join(self, name: &str, timeout: Duration) {
        let Self { handle, exited } = self;
        if tokio::time::timeout(timeout, exited).await.is_err() {
            // Dropping `handle` detaches the thread.
            warn!(worker = %name, ?timeout, "Agent thread did not exit, detaching it");
            return;
        }
        // Only thread teardown is left at this point.
        if let Err(e) = tokio::task::spawn_blocking(move || handle.join()).await {
            warn!(worker = %name, error = %e, "Failed to join agent thread");
        }
    }
}

/// Agent thread body: build the run loop, install the scope, run `entry`,
/// then serve until shut down. `exited` is dropped last, on every path.
fn run_agent<F>(
    entry: F,
    kind: ScopeKind,
    name: Option<String>,
    inbound: Inbound,
    shutdown: oneshot::Receiver<()>,
    faults: Option<PortSender>,
    exited: oneshot::Sender<()>,
) where
    F: FnOnce(),
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            report_fault(faults.as_ref(), format!("failed to build agent runtime: {e}"));
            return;
        }
    };

    scope::install(kind, name, inbound);

    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(entry)) {
            let message = format!("agent entry panicked: {}", panic_message(&*panic));
            report_fault(faults.as_ref(), message);
            return;
        }
        // Faults after startup have no call to attach to.
        drop(faults);
        // Resolves on terminate, or when the owning handle is dropped.
        let _ = shutdown.await;
    });

    // Cancels whatever the agent still has in flight.
    drop(local);
    scope::uninstall();
    drop(exited);
}

fn report_fault(faults: Option<&PortSender>, message: String) {
    error!(error = %message, "Agent fault");
    if let Some(faults) = faults {
        let _ = faults.post_error(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::scope::{is_dedicated_worker_scope, is_shared_worker_scope, worker_name};
    use crate::transport::Event;

    fn options(name: &str) -> WorkerOptions {
        WorkerOptions {
            name: Some(name.to_string()),
            ..WorkerOptions::default()
        }
    }

    #[tokio::test]
    async fn dedicated_worker_installs_scope() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut worker = Worker::spawn(
            move || {
                let _ = tx.send((
                    is_dedicated_worker_scope(),
                    is_shared_worker_scope(),
                    worker_name(),
                ));
            },
            &options("scoped"),
        )
        .unwrap();

        let (dedicated, shared, name) = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert!(dedicated);
        assert!(!shared);
        assert_eq!(name.as_deref(), Some("scoped"));
        assert!(worker.is_alive());

        worker.terminate().await.unwrap();
        assert!(!worker.is_alive());
    }

    #[tokio::test]
    async fn shared_worker_installs_scope() {
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = SharedWorker::spawn(
            move || {
                let _ = tx.send(is_shared_worker_scope());
            },
            &options("shared-scoped"),
        )
        .unwrap();

        let shared = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert!(shared);
        worker.terminate().await.unwrap();
        assert!(!worker.is_alive());
        assert!(worker.connect().is_err());
    }

    #[tokio::test]
    async fn entry_panic_is_reported_as_error_event() {
        let mut worker = Worker::spawn(|| panic!("bad entry"), &options("panics")).unwrap();
        let mut port = worker.take_port().unwrap();

        match port.recv().await {
            Some(Event::Error(event)) => {
                assert_eq!(event.message, "agent entry panicked: bad entry");
            }
            other => panic!("expected an error event, got {other:?}"),
        }
        assert!(port.recv().await.is_none());
    }

    #[tokio::test]
    async fn overrunning_agent_is_detached() {
        let options = WorkerOptions {
            terminate_timeout_ms: 50,
            ..options("stuck")
        };
        let mut worker =
            Worker::spawn(|| std::thread::sleep(Duration::from_millis(1500)), &options).unwrap();

        let begun = std::time::Instant::now();
        worker.terminate().await.unwrap();
        assert!(begun.elapsed() < Duration::from_secs(1));
        assert!(!worker.is_alive());
    }

    #[tokio::test]
    async fn prompt_agent_is_joined() {
        let options = WorkerOptions {
            terminate_timeout_ms: 5_000,
            ..options("prompt")
        };
        let mut worker = Worker::spawn(|| {}, &options).unwrap();
        let thread = worker.thread.take().unwrap();
        let _ = worker.shutdown.take().unwrap().send(());

        let begun = std::time::Instant::now();
        thread.join("prompt", options.terminate_timeout()).await;
        assert!(begun.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn port_can_be_taken_once() {
        let mut worker = Worker::spawn(|| {}, &options("once")).unwrap();
        assert!(worker.take_port().is_ok());
        assert!(matches!(
            worker.take_port(),
            Err(TransportError::PortTaken)
        ));
        worker.terminate().await.unwrap();
        // Idempotent.
        worker.terminate().await.unwrap();
    }
}
