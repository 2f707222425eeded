//! Agent-side dispatcher.
//!
//! `expose_api` turns an [`Api`] into a message-driven server inside the
//! agent: every Run message becomes its own local task, and exactly one
//! Result or Error goes back per Run, in completion order.

mod api;
pub mod scope;

pub use api::{Api, ApiBuilder, ApiError, Handler, HandlerFuture};
pub use scope::{
    assert_shared_worker_scope, assert_worker_scope, is_dedicated_worker_scope,
    is_shared_worker_scope, is_worker_scope, worker_name, ScopeError, ScopeKind,
};

use std::any::Any;
use std::rc::Rc;

use tokio::task::{spawn_local, JoinError};
use tracing::{debug, warn};

use crate::transfer::Payload;
use crate::transport::protocol::assert_message_event;
use crate::transport::{ControllerMessage, MessagePort, PortSender, Uid, WorkerMessage};
use crate::value::Value;
use scope::Inbound;

/// Serve `api` from the current agent.
///
/// Must be called on an agent thread, once. Fails with
/// [`ScopeError::NotShared`] if the API requires a shared worker and this is
/// not one.
pub fn expose_api(api: Api) -> Result<(), ScopeError> {
    if api.requires_shared() {
        assert_shared_worker_scope()?;
    } else {
        assert_worker_scope()?;
    }

    let api = Rc::new(api);
    match scope::take_inbound()? {
        Inbound::Port(port) => {
            spawn_local(serve(api, port));
        }
        Inbound::Connections(mut connections) => {
            spawn_local(async move {
                while let Some(port) = connections.recv().await {
                    debug!("Accepted shared worker connection");
                    spawn_local(serve(Rc::clone(&api), port));
                }
            });
        }
    }
    Ok(())
}

/// Handle one client: advertise the methods, then dispatch until the client
/// terminates or goes away.
async fn serve(api: Rc<Api>, port: MessagePort) {
    let (sender, mut receiver) = port.split();

    let ready = WorkerMessage::Ready {
        methods: api.method_names(),
    };
    if let Err(e) = sender.post_message(&ready.into(), &[]) {
        warn!(error = %e, "Failed to send Ready");
        return;
    }

    while let Some(event) = receiver.recv().await {
        let data = match assert_message_event(event) {
            Ok(message) => message.data,
            Err(e) => {
                warn!(error = %e, "Ignoring non-message event");
                continue;
            }
        };

        match ControllerMessage::try_from(data) {
            Ok(ControllerMessage::Run { uid, method, args }) => {
                debug!(uid, method = %method, "Run");
                spawn_local(invoke(Rc::clone(&api), sender.clone(), uid, method, args));
            }
            Ok(ControllerMessage::Terminate) => {
                debug!("Terminate received, no longer accepting calls");
                break;
            }
            Err(e) => warn!(error = %e, "Discarding malformed message"),
        }
    }
}

async fn invoke(api: Rc<Api>, sender: PortSender, uid: Uid, method: String, args: Vec<Value>) {
    let outcome = match api.handler(&method) {
        Ok(handler) => {
            // Own task, so a panicking handler is caught by the join.
            let task = spawn_local(async move { handler.call(args).await });
            match task.await {
                Ok(Ok(payload)) => Ok(payload),
                Ok(Err(err)) => Err(format!("{err:#}")),
                Err(join) => Err(describe_join_error(join)),
            }
        }
        Err(unknown) => Err(unknown.to_string()),
    };

    match outcome {
        Ok(payload) => {
            let (value, transfer) = Payload::into_parts(payload);
            let message = WorkerMessage::Result { uid, value };
            if let Err(e) = sender.post_message(&message.into(), &transfer) {
                warn!(uid, error = %e, "Failed to post result, reporting as error");
                report_error(&sender, uid, e.to_string());
            }
        }
        Err(error) => {
            debug!(uid, method = %method, error = %error, "Call failed");
            report_error(&sender, uid, error);
        }
    }
}

fn report_error(sender: &PortSender, uid: Uid, error: String) {
    let message = WorkerMessage::Error { uid, error };
    if let Err(e) = sender.post_message(&message.into(), &[]) {
        warn!(uid, error = %e, "Failed to post error");
    }
}

fn describe_join_error(join: JoinError) -> String {
    if join.is_panic() {
        format!("panicked: {}", panic_message(&*join.into_panic()))
    } else {
        join.to_string()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerOptions;
    use crate::transport::protocol::{is_ready_message, WorkerMessage};
    use crate::transport::{Event, Transport, Worker};

    fn hello_api() -> Api {
        Api::builder()
            .sync_method("hello_world", |_| Ok(Value::from("Hello World!")))
            .build()
            .unwrap()
    }

    async fn next_message(port: &mut MessagePort) -> WorkerMessage {
        let event = port.recv().await.expect("port closed");
        let data = assert_message_event(event).unwrap().data;
        WorkerMessage::try_from(data).unwrap()
    }

    #[test]
    fn expose_outside_worker_fails() {
        assert_eq!(expose_api(hello_api()).err(), Some(ScopeError::NotWorker));
    }

    #[test]
    fn panic_message_reads_str_and_string() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*boxed), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }

    #[tokio::test]
    async fn shared_only_api_fails_in_dedicated_worker() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut worker = Worker::spawn(
            move || {
                let api = Api::builder()
                    .sync_method("x", |_| Ok(Value::Null))
                    .require_shared()
                    .build()
                    .unwrap();
                let _ = tx.send(expose_api(api));
            },
            &WorkerOptions::default(),
        )
        .unwrap();

        let result = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert_eq!(result, Err(ScopeError::NotShared));
        worker.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn second_expose_fails() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut worker = Worker::spawn(
            move || {
                let first = expose_api(hello_api());
                let second = expose_api(hello_api());
                let _ = tx.send((first, second));
            },
            &WorkerOptions::default(),
        )
        .unwrap();

        let (first, second) = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert_eq!(first, Ok(()));
        assert_eq!(second, Err(ScopeError::AlreadyExposed));
        worker.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn dispatches_over_raw_port() {
        let mut worker = Worker::spawn(
            || {
                let api = Api::builder()
                    .sync_method("hello_world", |_| Ok(Value::from("Hello World!")))
                    .sync_method("fail", |_| -> anyhow::Result<Value> {
                        anyhow::bail!("Hello World!")
                    })
                    .build()
                    .unwrap();
                expose_api(api).unwrap();
            },
            &WorkerOptions::default(),
        )
        .unwrap();
        let mut port = worker.take_port().unwrap();

        let event = port.recv().await.unwrap();
        let Event::Message(ready) = event else {
            panic!("expected the ready message");
        };
        assert!(is_ready_message(&ready.data));

        let run = |uid, method: &str| {
            Value::from(ControllerMessage::Run {
                uid,
                method: method.to_string(),
                args: vec![],
            })
        };
        port.post_message(&run(1, "hello_world"), &[]).unwrap();
        assert_eq!(
            next_message(&mut port).await,
            WorkerMessage::Result {
                uid: 1,
                value: Value::from("Hello World!")
            }
        );

        port.post_message(&run(2, "fail"), &[]).unwrap();
        assert_eq!(
            next_message(&mut port).await,
            WorkerMessage::Error {
                uid: 2,
                error: "Hello World!".to_string()
            }
        );

        port.post_message(&run(3, "missing"), &[]).unwrap();
        assert_eq!(
            next_message(&mut port).await,
            WorkerMessage::Error {
                uid: 3,
                error: "unknown method: missing".to_string()
            }
        );

        // Malformed input is skipped, not answered.
        port.post_message(&Value::object([("type", "bogus")]), &[])
            .unwrap();
        port.post_message(&Value::from(ControllerMessage::Terminate), &[])
            .unwrap();
        port.post_message(&run(4, "hello_world"), &[]).unwrap();

        // After Terminate the agent drops its end of the channel without answering.
        let after = tokio::time::timeout(std::time::Duration::from_secs(5), port.recv())
            .await
            .unwrap();
        assert!(after.is_none());

        worker.terminate().await.unwrap();
    }
}
