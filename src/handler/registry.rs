//! Middleware chains.
//!
//! Each chain is an ordered list of handlers. Composing a chain wraps a
//! terminal step so that the first registered handler runs outermost and
//! hands over to the next one through [`Next`].
//!
//! # Example
//!
//! ```
//! use hprose_client::handler::{Call, HandlerRegistry};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.add_invoke(|call: Call, ctx, next| async move {
//!     tracing::debug!(name = %call.name, "calling");
//!     next.run(call, ctx).await
//! });
//! assert_eq!(registry.invoke.len(), 1);
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use super::{BatchCall, Call, InvokeContext, Reply};
use crate::error::Result;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for middleware handlers.
pub trait Middleware<Req, Res>: Send + Sync + 'static {
    /// Handle `request`, usually by delegating to `next`.
    fn handle(
        &self,
        request: Req,
        ctx: InvokeContext,
        next: Next<Req, Res>,
    ) -> BoxFuture<'static, Result<Res>>;
}

/// Adapter turning an async closure into a [`Middleware`].
pub struct FnMiddleware<F, Fut> {
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnMiddleware<F, Fut> {
    /// Wrap `handler`.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<Req, Res, F, Fut> Middleware<Req, Res> for FnMiddleware<F, Fut>
where
    Req: 'static,
    Res: 'static,
    F: Fn(Req, InvokeContext, Next<Req, Res>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res>> + Send + 'static,
{
    fn handle(
        &self,
        request: Req,
        ctx: InvokeContext,
        next: Next<Req, Res>,
    ) -> BoxFuture<'static, Result<Res>> {
        Box::pin((self.handler)(request, ctx, next))
    }
}

/// The rest of a chain, as seen from one handler.
pub struct Next<Req, Res> {
    run: Arc<dyn Fn(Req, InvokeContext) -> BoxFuture<'static, Result<Res>> + Send + Sync>,
}

impl<Req, Res> Next<Req, Res> {
    /// Wrap a terminal step.
    pub fn new<F>(run: F) -> Self
    where
        F: Fn(Req, InvokeContext) -> BoxFuture<'static, Result<Res>> + Send + Sync + 'static,
    {
        Self { run: Arc::new(run) }
    }

    /// Continue down the chain.
    pub fn run(&self, request: Req, ctx: InvokeContext) -> BoxFuture<'static, Result<Res>> {
        (self.run)(request, ctx)
    }
}

impl<Req, Res> Clone for Next<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
        }
    }
}

/// Ordered list of handlers of one kind.
pub struct Chain<Req, Res> {
    handlers: Vec<Arc<dyn Middleware<Req, Res>>>,
}

impl<Req: 'static, Res: 'static> Chain<Req, Res> {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Append a handler; it runs inside every handler added before it.
    pub fn push(&mut self, handler: Arc<dyn Middleware<Req, Res>>) {
        self.handlers.push(handler);
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the chain has no handlers.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Wrap `terminal` with every handler, first registered outermost.
    pub fn compose(&self, terminal: Next<Req, Res>) -> Next<Req, Res> {
        self.handlers.iter().rev().fold(terminal, |next, handler| {
            let handler = handler.clone();
            Next::new(move |request, ctx| handler.handle(request, ctx, next.clone()))
        })
    }
}

impl<Req: 'static, Res: 'static> Default for Chain<Req, Res> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Res> Clone for Chain<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

/// Chain around the encoding and decoding of a single call.
pub type InvokeChain = Chain<Call, Reply>;

/// Chain around a flushed batch; results are per call, in order.
pub type BatchInvokeChain = Chain<Vec<BatchCall>, Vec<Result<Reply>>>;

/// Chain around the request bytes, before or after the filters.
pub type FilterChain = Chain<Bytes, Bytes>;

/// The four middleware chains of a client.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    /// Wraps single calls.
    pub invoke: InvokeChain,
    /// Wraps batches.
    pub batch_invoke: BatchInvokeChain,
    /// Wraps the filters and the transport.
    pub before_filter: FilterChain,
    /// Wraps the transport only.
    pub after_filter: FilterChain,
}

impl HandlerRegistry {
    /// Create a registry with empty chains.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invoke handler.
    pub fn add_invoke<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Call, InvokeContext, Next<Call, Reply>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        self.invoke.push(Arc::new(FnMiddleware::new(handler)));
    }

    /// Register a batch invoke handler.
    pub fn add_batch_invoke<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Vec<BatchCall>, InvokeContext, Next<Vec<BatchCall>, Vec<Result<Reply>>>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<Vec<Result<Reply>>>> + Send + 'static,
    {
        self.batch_invoke.push(Arc::new(FnMiddleware::new(handler)));
    }

    /// Register a handler that sees the request before the filters run.
    pub fn add_before_filter<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Bytes, InvokeContext, Next<Bytes, Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.before_filter.push(Arc::new(FnMiddleware::new(handler)));
    }

    /// Register a handler that sees the request after the filters ran.
    pub fn add_after_filter<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Bytes, InvokeContext, Next<Bytes, Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.after_filter.push(Arc::new(FnMiddleware::new(handler)));
    }
}
