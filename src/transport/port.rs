//! Entangled message ports.
//!
//! Each port posts into its peer's queue. Posting structured-clones the value
//! so the receiver never shares memory with the sender, except for buffers
//! explicitly transferred (which the sender loses).

use tokio::sync::mpsc;
use tracing::trace;

use super::clone::structured_clone;
use super::{ErrorEvent, Event, MessageEvent, TransportError};
use crate::value::{ArrayBuffer, Value};

/// Factory for a connected pair of ports.
pub struct MessageChannel;

impl MessageChannel {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MessagePort, MessagePort) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MessagePort {
                sender: PortSender { tx: b_tx },
                receiver: PortReceiver { rx: a_rx },
            },
            MessagePort {
                sender: PortSender { tx: a_tx },
                receiver: PortReceiver { rx: b_rx },
            },
        )
    }
}

/// One end of a [`MessageChannel`].
pub struct MessagePort {
    sender: PortSender,
    receiver: PortReceiver,
}

impl MessagePort {
    pub fn post_message(&self, data: &Value, transfer: &[ArrayBuffer]) -> Result<(), TransportError> {
        self.sender.post_message(data, transfer)
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub const fn sender(&self) -> &PortSender {
        &self.sender
    }

    /// Separate the halves so sending and receiving can live in different tasks.
    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a port. Cheap to clone.
#[derive(Clone)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl PortSender {
    /// Clone `data` into the peer, moving the buffers in `transfer`.
    pub fn post_message(&self, data: &Value, transfer: &[ArrayBuffer]) -> Result<(), TransportError> {
        // Checked first so a dead peer never costs the caller its buffers.
        if self.tx.is_closed() {
            return Err(TransportError::Closed);
        }
        let data = structured_clone(data, transfer)?;
        trace!(transferred = transfer.len(), "Posting message");
        self.tx
            .send(Event::Message(MessageEvent { data }))
            .map_err(|_| TransportError::Closed)
    }

    /// Deliver an error event to the peer.
    pub fn post_error(&self, message: impl Into<String>) -> Result<(), TransportError> {
        self.tx
            .send(Event::Error(ErrorEvent {
                message: message.into(),
            }))
            .map_err(|_| TransportError::Closed)
    }

    /// Whether the peer's receiving half is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a port.
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl PortReceiver {
    /// Next event, or `None` once every sender on the peer side is dropped.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::protocol::assert_message_event;

    #[tokio::test]
    async fn messages_arrive_in_send_order() {
        let (left, mut right) = MessageChannel::new();
        for i in 0..5 {
            left.post_message(&Value::Int(i), &[]).unwrap();
        }
        for i in 0..5 {
            let event = right.recv().await.unwrap();
            assert_eq!(assert_message_event(event).unwrap().data, Value::Int(i));
        }
    }

    #[tokio::test]
    async fn transfer_moves_buffer_to_peer() {
        let (left, mut right) = MessageChannel::new();
        let buffer = ArrayBuffer::new((0u8..10).collect::<Vec<_>>());

        left.post_message(&Value::from(buffer.clone()), &[buffer.clone()])
            .unwrap();
        assert!(buffer.is_detached());

        let event = right.recv().await.unwrap();
        let data = assert_message_event(event).unwrap().data;
        let received = data.as_buffer().unwrap();
        assert_eq!(received.to_vec().unwrap(), (0u8..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn post_to_dropped_peer_keeps_buffers() {
        let (left, right) = MessageChannel::new();
        drop(right);

        let buffer = ArrayBuffer::zeroed(8);
        let err = left
            .post_message(&Value::from(buffer.clone()), &[buffer.clone()])
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(!buffer.is_detached());
        assert!(left.sender().is_closed());
    }

    #[tokio::test]
    async fn recv_ends_when_peer_dropped() {
        let (left, mut right) = MessageChannel::new();
        left.sender().post_error("agent failed").unwrap();
        drop(left);

        match right.recv().await {
            Some(Event::Error(ErrorEvent { message })) => assert_eq!(message, "agent failed"),
            other => panic!("expected an error event, got {other:?}"),
        }
        assert!(right.recv().await.is_none());
    }

    #[tokio::test]
    async fn split_halves_work_independently() {
        let (left, right) = MessageChannel::new();
        let (tx, _rx) = left.split();
        let (_right_tx, mut right_rx) = right.split();

        let sender = tx.clone();
        tokio::spawn(async move {
            sender.post_message(&Value::from("from task"), &[]).unwrap();
        })
        .await
        .unwrap();

        let event = right_rx.recv().await.unwrap();
        assert_eq!(
            assert_message_event(event).unwrap().data,
            Value::from("from task")
        );
    }
}
