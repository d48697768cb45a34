//! RPC handler table.
//!
//! Handlers are registered on the builder, once, before the runtime
//! starts; the table is frozen afterwards. Whether a call is admitted is
//! decided per invocation (election state is inspected on every call, not
//! at registration time).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use lodestone_types::{ErrorEnvelope, RpcRequest};

/// Outcome of one handler invocation.
pub type HandlerResult = Result<Value, ErrorEnvelope>;

/// Boxed handler future.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// A registered RPC handler.
pub(crate) type HandlerFn = Arc<dyn Fn(RpcRequest) -> HandlerFuture + Send + Sync>;

/// Immutable method → handler table.
#[derive(Clone, Default)]
pub(crate) struct HandlerTable {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerTable {
    pub(crate) fn insert<F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.insert(
            method.into(),
            Arc::new(move |request| Box::pin(handler(request))),
        );
    }

    pub(crate) fn get(&self, method: &str) -> Option<HandlerFn> {
        self.handlers.get(method).cloned()
    }

    pub(crate) fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
