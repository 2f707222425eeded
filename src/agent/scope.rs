//! Worker scope detection.
//!
//! An agent thread installs its scope before running the entry function.
//! Code anywhere on that thread can then ask whether it runs inside an
//! agent, and of which kind. Every other thread has no scope.

use std::cell::RefCell;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::transport::MessagePort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Single client, one port.
    Dedicated,
    /// Many clients, one port per connection.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("not in a worker context")]
    NotWorker,

    #[error("not in a shared worker context")]
    NotShared,

    #[error("an API is already exposed in this worker")]
    AlreadyExposed,
}

/// Where an agent's inbound messages come from.
pub(crate) enum Inbound {
    Port(MessagePort),
    Connections(mpsc::UnboundedReceiver<MessagePort>),
}

struct Scope {
    kind: ScopeKind,
    name: Option<String>,
    inbound: Option<Inbound>,
}

thread_local! {
    static SCOPE: RefCell<Option<Scope>> = const { RefCell::new(None) };
}

pub(crate) fn install(kind: ScopeKind, name: Option<String>, inbound: Inbound) {
    SCOPE.with(|scope| {
        *scope.borrow_mut() = Some(Scope {
            kind,
            name,
            inbound: Some(inbound),
        });
    });
}

pub(crate) fn uninstall() {
    // Take first so the inbound side is dropped outside the borrow.
    let previous = SCOPE.with(|scope| scope.borrow_mut().take());
    drop(previous);
}

fn current_kind() -> Option<ScopeKind> {
    SCOPE.with(|scope| scope.borrow().as_ref().map(|s| s.kind))
}

pub fn is_worker_scope() -> bool {
    current_kind().is_some()
}

pub fn is_dedicated_worker_scope() -> bool {
    current_kind() == Some(ScopeKind::Dedicated)
}

pub fn is_shared_worker_scope() -> bool {
    current_kind() == Some(ScopeKind::Shared)
}

/// The name the agent was spawned with, if any.
pub fn worker_name() -> Option<String> {
    SCOPE.with(|scope| scope.borrow().as_ref().and_then(|s| s.name.clone()))
}

pub fn assert_worker_scope() -> Result<ScopeKind, ScopeError> {
    current_kind().ok_or(ScopeError::NotWorker)
}

pub fn assert_shared_worker_scope() -> Result<(), ScopeError> {
    match current_kind() {
        Some(ScopeKind::Shared) => Ok(()),
        _ => Err(ScopeError::NotShared),
    }
}

/// Claim the inbound message source. Only the first caller gets it.
pub(crate) fn take_inbound() -> Result<Inbound, ScopeError> {
    SCOPE.with(|scope| {
        let mut scope = scope.borrow_mut();
        let scope = scope.as_mut().ok_or(ScopeError::NotWorker)?;
        scope.inbound.take().ok_or(ScopeError::AlreadyExposed)
    })
}
