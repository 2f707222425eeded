//! The method table an agent exposes.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use thiserror::Error;

use crate::transfer::Payload;
use crate::value::Value;

/// Boxed future produced by a handler. Not `Send`: handlers run on the
/// agent's own single-threaded run loop.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Payload>>>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("method name must not be empty")]
    EmptyName,

    #[error("method `{0}` is registered more than once")]
    DuplicateMethod(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),
}

/// Something that can serve calls to one exposed method.
pub trait Handler: 'static {
    fn call(&self, args: Vec<Value>) -> HandlerFuture;
}

struct AsyncFn<F>(F);

impl<F, Fut, R> Handler for AsyncFn<F>
where
    F: Fn(Vec<Value>) -> Fut + 'static,
    Fut: Future<Output = anyhow::Result<R>> + 'static,
    R: Into<Payload>,
{
    fn call(&self, args: Vec<Value>) -> HandlerFuture {
        let fut = (self.0)(args);
        Box::pin(async move { fut.await.map(Into::into) })
    }
}

struct SyncFn<F>(F);

impl<F, R> Handler for SyncFn<F>
where
    F: Fn(Vec<Value>) -> anyhow::Result<R> + 'static,
    R: Into<Payload>,
{
    fn call(&self, args: Vec<Value>) -> HandlerFuture {
        let result = (self.0)(args).map(Into::into);
        Box::pin(std::future::ready(result))
    }
}

/// A validated mapping from method names to handlers.
pub struct Api {
    handlers: BTreeMap<String, Rc<dyn Handler>>,
    require_shared: bool,
}

impl Api {
    pub fn builder() -> ApiBuilder {
        ApiBuilder::default()
    }

    /// Exposed method names, sorted.
    pub fn method_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn handler(&self, method: &str) -> Result<Rc<dyn Handler>, ApiError> {
        self.handlers
            .get(method)
            .cloned()
            .ok_or_else(|| ApiError::UnknownMethod(method.to_string()))
    }

    /// Whether the API may only be exposed from a shared worker.
    pub const fn requires_shared(&self) -> bool {
        self.require_shared
    }
}

#[derive(Default)]
pub struct ApiBuilder {
    handlers: Vec<(String, Rc<dyn Handler>)>,
    require_shared: bool,
}

impl ApiBuilder {
    /// Register an asynchronous method.
    #[must_use]
    pub fn method<F, Fut, R>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<R>> + 'static,
        R: Into<Payload>,
    {
        self.handler(name, AsyncFn(f))
    }

    /// Register a method that completes immediately.
    #[must_use]
    pub fn sync_method<F, R>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<R> + 'static,
        R: Into<Payload>,
    {
        self.handler(name, SyncFn(f))
    }

    #[must_use]
    pub fn handler(mut self, name: impl Into<String>, handler: impl Handler) -> Self {
        self.handlers.push((name.into(), Rc::new(handler)));
        self
    }

    /// Refuse to be exposed anywhere but a shared worker.
    #[must_use]
    pub const fn require_shared(mut self) -> Self {
        self.require_shared = true;
        self
    }

    pub fn build(self) -> Result<Api, ApiError> {
        let mut handlers = BTreeMap::new();
        for (name, handler) in self.handlers {
            if name.is_empty() {
                return Err(ApiError::EmptyName);
            }
            if handlers.contains_key(&name) {
                return Err(ApiError::DuplicateMethod(name));
            }
            handlers.insert(name, handler);
        }
        Ok(Api {
            handlers,
            require_shared: self.require_shared,
        })
    }
}
