//! Client builder and invocation engine.
//!
//! The [`ClientBuilder`] provides a fluent API for endpoints, settings,
//! filters and middleware. The [`Client`] runs every call through the same
//! pipeline:
//! 1. Merge the client settings with the call-site options
//! 2. Encode the call envelope (invoke chain)
//! 3. Apply output filters and send (before/after-filter chains, transport)
//! 4. On transport failure, rotate endpoints and retry as the context allows
//! 5. Apply input filters, decode the reply and settle the caller's handle
//!
//! Calls are spawned on the current Tokio runtime when they are made, so
//! every method returning [`Pending`] must be called from within a runtime.
//!
//! # Example
//!
//! ```no_run
//! use hprose_client::{Client, InvokeOptions, Value};
//!
//! #[tokio::main]
//! async fn main() -> hprose_client::Result<()> {
//!     let client = Client::builder()
//!         .uris(["http://10.0.0.1:8080/", "http://10.0.0.2:8080/"])
//!         .failswitch(true)
//!         .build()?;
//!
//!     let hello = client.invoke("hello", vec![Value::from("world")]).await?;
//!     println!("{hello:?}");
//!
//!     client.begin_batch();
//!     let sum = client.invoke("sum", vec![1.into(), 2.into()]);
//!     let swap = client.invoke_with("swap", vec![1.into(), 2.into()], InvokeOptions::new().byref(true));
//!     client.end_batch(Default::default()).await?;
//!     println!("{:?} {:?}", sum.await?, swap.await?.args);
//!     Ok(())
//! }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;
use url::Url;

use crate::codec::Value;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::handler::{
    BatchCall, BatchOptions, Call, ErrorCallback, Filter, HandlerRegistry, InvokeContext,
    InvokeOptions, Next, Reply,
};
use crate::pending::Pending;
use crate::protocol::{
    decode_batch_reply, decode_functions, decode_reply, encode_call, finish_request,
    function_names, BatchItemMode, FUNCTIONS_REQUEST,
};
use crate::topic::{SubscribeOptions, TopicCallback, Topics};
use crate::transport::{self, parse_endpoints, Scheme, Transport};

/// Backoff added per consumed retry.
const RETRY_STEP_MS: i64 = 500;

/// Longest wait between two attempts.
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_millis(5_000);

/// Called after the client rotated to another endpoint.
pub type FailswitchCallback = Arc<dyn Fn(&Client) + Send + Sync>;

type Settle<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Outcome of one call of a flushed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    /// Procedure name.
    pub name: String,
    /// Arguments after the call.
    pub args: Vec<Value>,
    /// Result, `Null` when the call failed.
    pub result: Value,
    /// Error message of a failed call.
    pub error: Option<String>,
}

/// Builder for configuring and creating a [`Client`].
pub struct ClientBuilder {
    uris: Vec<String>,
    functions: Option<Vec<String>>,
    settings: Settings,
    filters: Vec<Arc<dyn Filter>>,
    transport: Option<Arc<dyn Transport>>,
    handlers: HandlerRegistry,
    on_error: Option<ErrorCallback>,
    on_failswitch: Option<FailswitchCallback>,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            uris: Vec::new(),
            functions: None,
            settings: Settings::default(),
            filters: Vec::new(),
            transport: None,
            handlers: HandlerRegistry::new(),
            on_error: None,
            on_failswitch: None,
        }
    }

    /// Add an endpoint.
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uris.push(uri.into());
        self
    }

    /// Add several endpoints, tried in the given order.
    pub fn uris<I, S>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.uris.extend(uris.into_iter().map(Into::into));
        self
    }

    /// Known procedure names, skipping discovery.
    pub fn functions<I, S>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.functions = Some(functions.into_iter().map(Into::into).collect());
        self
    }

    /// Replace all settings.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Byte-accurate string encoding.
    pub fn binary(mut self, binary: bool) -> Self {
        self.settings.binary = binary;
        self
    }

    /// Ask the server to echo mutated arguments.
    pub fn byref(mut self, byref: bool) -> Self {
        self.settings.byref = byref;
        self
    }

    /// Disable reference tracking.
    pub fn simple(mut self, simple: bool) -> Self {
        self.settings.simple = simple;
        self
    }

    /// Call timeout in milliseconds, 0 disables it.
    ///
    /// Default: 30000
    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.settings.timeout = timeout_ms;
        self
    }

    /// Retry budget of idempotent calls.
    ///
    /// Default: 10
    pub fn retry(mut self, retry: u32) -> Self {
        self.settings.retry = retry;
        self
    }

    /// Treat calls as safe to send again.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.settings.idempotent = idempotent;
        self
    }

    /// Rotate endpoints on failure.
    pub fn failswitch(mut self, failswitch: bool) -> Self {
        self.settings.failswitch = failswitch;
        self
    }

    /// Keep connections open between calls.
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.settings.keep_alive = keep_alive;
        self
    }

    /// Decode maps as ordered maps.
    pub fn use_harmony_map(mut self, use_harmony_map: bool) -> Self {
        self.settings.use_harmony_map = use_harmony_map;
        self
    }

    /// Disable Nagle's algorithm on sockets.
    pub fn no_delay(mut self, no_delay: bool) -> Self {
        self.settings.no_delay = no_delay;
        self
    }

    /// Multiplex socket requests by correlation id.
    pub fn full_duplex(mut self, full_duplex: bool) -> Self {
        self.settings.full_duplex = full_duplex;
        self
    }

    /// Bound of the socket connection pool.
    ///
    /// Default: 10
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.settings.max_pool_size = size;
        self
    }

    /// Idle time in milliseconds before a pooled connection is closed.
    pub fn pool_timeout(mut self, timeout_ms: u64) -> Self {
        self.settings.pool_timeout = timeout_ms;
        self
    }

    /// Add an HTTP request header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.headers.insert(name.into(), value.into());
        self
    }

    /// Add a filter.
    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Use `transport` instead of the one matching the endpoint scheme.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Client-wide error handler, used when a call has none.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Hook run after every endpoint rotation.
    pub fn on_failswitch<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.on_failswitch = Some(Arc::new(callback));
        self
    }

    /// Register an invoke handler.
    pub fn use_invoke<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Call, InvokeContext, Next<Call, Reply>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        self.handlers.add_invoke(handler);
        self
    }

    /// Register a batch invoke handler.
    pub fn use_batch_invoke<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Vec<BatchCall>, InvokeContext, Next<Vec<BatchCall>, Vec<Result<Reply>>>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<Vec<Result<Reply>>>> + Send + 'static,
    {
        self.handlers.add_batch_invoke(handler);
        self
    }

    /// Register a handler running before the filters.
    pub fn use_before_filter<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Bytes, InvokeContext, Next<Bytes, Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.handlers.add_before_filter(handler);
        self
    }

    /// Register a handler running after the filters.
    pub fn use_after_filter<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Bytes, InvokeContext, Next<Bytes, Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.handlers.add_after_filter(handler);
        self
    }

    /// Build the client.
    ///
    /// Fails when no endpoint is set, an endpoint is malformed, or, unless a
    /// transport was supplied, the endpoints mix protocol families or use a
    /// scheme without a transport.
    pub fn build(self) -> Result<Client> {
        let settings = self.settings.normalized();
        let (scheme, uris, transport) = match self.transport {
            Some(transport) => {
                let uris = self
                    .uris
                    .iter()
                    .map(|u| Url::parse(u).map_err(|_| Error::InvalidUri(u.clone())))
                    .collect::<Result<Vec<_>>>()?;
                if uris.is_empty() {
                    return Err(Error::InvalidUri("You should set server uri first!".into()));
                }
                (Scheme::of(&uris[0]).ok(), uris, transport)
            }
            None => {
                let (scheme, uris) = parse_endpoints(&self.uris)?;
                let transport = transport::for_scheme(scheme, &settings)?;
                (Some(scheme), uris, transport)
            }
        };

        tracing::debug!(endpoints = uris.len(), ?scheme, "client created");

        Ok(Client {
            inner: Arc::new(Inner {
                settings: RwLock::new(settings),
                endpoints: Mutex::new(Endpoints::new(uris)),
                scheme,
                transport,
                filters: RwLock::new(self.filters),
                handlers: RwLock::new(self.handlers),
                lock: Mutex::new(SyncLock::default()),
                batch: Mutex::new(BatchQueue::default()),
                topics: Mutex::new(Topics::default()),
                functions: RwLock::new(self.functions),
                id: OnceCell::new(),
                on_error: RwLock::new(self.on_error),
                on_failswitch: RwLock::new(self.on_failswitch),
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered endpoint list with the current position.
struct Endpoints {
    uris: Vec<Url>,
    index: usize,
    failround: u64,
}

impl Endpoints {
    fn new(uris: Vec<Url>) -> Self {
        Self {
            uris,
            index: 0,
            failround: 0,
        }
    }

    fn current(&self) -> Option<Url> {
        self.uris.get(self.index).cloned()
    }

    /// Move to the next endpoint; wrapping around starts a new round.
    fn advance(&mut self) {
        let n = self.uris.len();
        if n > 1 {
            self.index += 1;
            if self.index >= n {
                self.index = 0;
                self.failround += 1;
            }
        } else {
            self.failround += 1;
        }
    }
}

enum Task {
    Invoke {
        call: Call,
        ctx: InvokeContext,
        batch: bool,
        settle: Settle<Reply>,
    },
    EndBatch {
        options: BatchOptions,
        settle: Settle<Vec<BatchResult>>,
    },
}

/// Set while a sync call settles; tasks submitted meanwhile wait here.
#[derive(Default)]
struct SyncLock {
    locked: bool,
    tasks: VecDeque<Task>,
}

struct Queued {
    call: BatchCall,
    settle: Settle<Reply>,
}

#[derive(Default)]
struct BatchQueue {
    open: bool,
    calls: Vec<Queued>,
}

struct Inner {
    settings: RwLock<Settings>,
    endpoints: Mutex<Endpoints>,
    scheme: Option<Scheme>,
    transport: Arc<dyn Transport>,
    filters: RwLock<Vec<Arc<dyn Filter>>>,
    handlers: RwLock<HandlerRegistry>,
    lock: Mutex<SyncLock>,
    batch: Mutex<BatchQueue>,
    topics: Mutex<Topics>,
    functions: RwLock<Option<Vec<String>>>,
    id: OnceCell<String>,
    on_error: RwLock<Option<ErrorCallback>>,
    on_failswitch: RwLock<Option<FailswitchCallback>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.transport.close();
    }
}

/// An RPC client.
///
/// Cheap to clone; clones share endpoints, settings, middleware and
/// connections.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Client for a single endpoint with default settings.
    pub fn new(uri: &str) -> Result<Self> {
        ClientBuilder::new().uri(uri).build()
    }

    // ---- invocation ---------------------------------------------------

    /// Call `name` with `args` using the client defaults.
    pub fn invoke(&self, name: &str, args: Vec<Value>) -> Pending<Value> {
        let (tx, pending) = Pending::channel();
        self.submit_call(
            name,
            args,
            InvokeOptions::default(),
            None,
            Box::new(move |r: Result<Reply>| {
                let _ = tx.send(r.map(|reply| reply.result));
            }),
        );
        pending
    }

    /// Call `name` with call-site options; the reply carries the arguments
    /// as updated by a by-reference call.
    pub fn invoke_with(&self, name: &str, args: Vec<Value>, options: InvokeOptions) -> Pending<Reply> {
        let (tx, pending) = Pending::channel();
        self.submit_call(
            name,
            args,
            options,
            None,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        pending
    }

    /// Call outside any open batch.
    fn invoke_direct(&self, name: &str, args: Vec<Value>, options: InvokeOptions) -> Pending<Reply> {
        let (tx, pending) = Pending::channel();
        self.submit_call(
            name,
            args,
            options,
            Some(false),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        pending
    }

    fn submit_call(
        &self,
        name: &str,
        args: Vec<Value>,
        options: InvokeOptions,
        batch: Option<bool>,
        settle: Settle<Reply>,
    ) {
        let batch = batch.unwrap_or_else(|| self.inner.batch.lock().open);
        let ctx = self.context(options);
        self.submit(Task::Invoke {
            call: Call::new(name, args),
            ctx,
            batch,
            settle,
        });
    }

    fn context(&self, options: InvokeOptions) -> InvokeContext {
        let mut ctx = InvokeContext::from_settings(&self.inner.settings.read());
        options.apply(&mut ctx);
        ctx
    }

    fn submit(&self, task: Task) {
        let mut lock = self.inner.lock.lock();
        if lock.locked {
            lock.tasks.push_back(task);
            return;
        }
        match task {
            Task::Invoke {
                call,
                ctx,
                batch: true,
                settle,
            } => {
                drop(lock);
                let call = BatchCall {
                    name: call.name,
                    args: call.args,
                    context: ctx,
                };
                self.inner.batch.lock().calls.push(Queued { call, settle });
            }
            Task::Invoke {
                call,
                ctx,
                batch: false,
                settle,
            } => {
                let sync = ctx.sync;
                lock.locked |= sync;
                drop(lock);

                let client = self.clone();
                tokio::spawn(async move {
                    let result = client.call(call, ctx).await;
                    settle(result);
                    if sync {
                        client.unlock();
                    }
                });
            }
            Task::EndBatch { options, settle } => {
                let calls = std::mem::take(&mut self.inner.batch.lock().calls);
                if calls.is_empty() {
                    drop(lock);
                    settle(Ok(Vec::new()));
                    return;
                }
                let ctx = options.into_context(&self.inner.settings.read());
                let sync = ctx.sync;
                lock.locked |= sync;
                drop(lock);

                let client = self.clone();
                tokio::spawn(async move {
                    let result = client.flush_batch(calls, ctx).await;
                    settle(result);
                    if sync {
                        client.unlock();
                    }
                });
            }
        }
    }

    /// Release the sync lock and replay held-back tasks in submission order.
    fn unlock(&self) {
        let tasks = {
            let mut lock = self.inner.lock.lock();
            lock.locked = false;
            std::mem::take(&mut lock.tasks)
        };
        for task in tasks {
            self.submit(task);
        }
    }

    async fn call(&self, call: Call, ctx: InvokeContext) -> Result<Reply> {
        let name = call.name.clone();
        let chain = self.inner.handlers.read().invoke.clone();
        let result = chain
            .compose(self.default_invoke())
            .run(call, ctx.clone())
            .await;
        self.settle_reply(&name, result, &ctx)
    }

    fn settle_reply(&self, name: &str, result: Result<Reply>, ctx: &InvokeContext) -> Result<Reply> {
        match result {
            Ok(reply) => {
                if let Some(on_success) = &ctx.on_success {
                    if let Err(e) = on_success(&reply.result, &reply.args) {
                        ctx.report_error(name, &e);
                        return Err(e);
                    }
                }
                Ok(reply)
            }
            Err(e) => Err(self.handle_error(name, e, ctx)),
        }
    }

    fn handle_error(&self, name: &str, error: Error, ctx: &InvokeContext) -> Error {
        if !ctx.report_error(name, &error) {
            let on_error = self.inner.on_error.read().clone();
            if let Some(on_error) = on_error {
                on_error(name, &error);
            }
        }
        error
    }

    fn default_invoke(&self) -> Next<Call, Reply> {
        let client = self.clone();
        Next::new(move |call, ctx| {
            let client = client.clone();
            Box::pin(async move { client.invoke_handler(call, ctx).await })
        })
    }

    async fn invoke_handler(&self, call: Call, ctx: InvokeContext) -> Result<Reply> {
        let envelope = encode_call(&call.name, &call.args, ctx.byref, ctx.simple, ctx.binary)?;
        let response = self.send_and_receive(finish_request([envelope]), ctx.clone()).await?;

        let mut reply = Reply::new(Value::Null, call.args);
        if ctx.oneway {
            return Ok(reply);
        }
        let decoded = decode_reply(&response, ctx.mode, ctx.use_harmony_map, ctx.binary)?;
        reply.result = decoded.result;
        reply.copy_args(decoded.args);
        Ok(reply)
    }

    // ---- sending ------------------------------------------------------

    async fn send_and_receive(&self, request: Bytes, ctx: InvokeContext) -> Result<Bytes> {
        if ctx.oneway {
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(e) = client.send_with_retry(request, ctx).await {
                    tracing::debug!(error = %e, "one-way request failed");
                }
            });
            return Ok(Bytes::new());
        }
        self.send_with_retry(request, ctx).await
    }

    async fn send_with_retry(&self, request: Bytes, mut ctx: InvokeContext) -> Result<Bytes> {
        loop {
            let chain = self.inner.handlers.read().before_filter.clone();
            let result = chain
                .compose(self.default_before_filter())
                .run(request.clone(), ctx.clone())
                .await;
            match result {
                Ok(response) => return Ok(response),
                Err(error) if !error.is_transport() => return Err(error),
                Err(error) => {
                    let Some(interval) = self.retry_interval(&mut ctx) else {
                        return Err(error);
                    };
                    tracing::debug!(
                        error = %error,
                        retried = ctx.retried,
                        interval_ms = interval.as_millis() as u64,
                        "retrying request"
                    );
                    if !interval.is_zero() {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }
    }

    /// Delay before the next attempt, `None` when the call may not retry.
    fn retry_interval(&self, ctx: &mut InvokeContext) -> Option<Duration> {
        if ctx.failswitch {
            self.failswitch();
        }
        if !ctx.idempotent || ctx.retried >= ctx.retry {
            return None;
        }
        ctx.retried += 1;
        let mut interval = i64::from(ctx.retried) * RETRY_STEP_MS;
        if ctx.failswitch {
            let endpoints = self.inner.endpoints.lock().uris.len() as i64;
            interval -= (endpoints - 1) * RETRY_STEP_MS;
        }
        let interval = interval.clamp(0, MAX_RETRY_INTERVAL.as_millis() as i64);
        Some(Duration::from_millis(interval as u64))
    }

    fn failswitch(&self) {
        {
            let mut endpoints = self.inner.endpoints.lock();
            endpoints.advance();
            tracing::warn!(
                uri = ?endpoints.current().map(|u| u.to_string()),
                failround = endpoints.failround,
                "switched endpoint"
            );
        }
        let hook = self.inner.on_failswitch.read().clone();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    fn default_before_filter(&self) -> Next<Bytes, Bytes> {
        let client = self.clone();
        Next::new(move |request, ctx| {
            let client = client.clone();
            Box::pin(async move { client.before_filter_handler(request, ctx).await })
        })
    }

    async fn before_filter_handler(&self, request: Bytes, ctx: InvokeContext) -> Result<Bytes> {
        let filters = self.inner.filters.read().clone();
        let request = filters
            .iter()
            .fold(request, |data, filter| filter.output(data, &ctx));

        let chain = self.inner.handlers.read().after_filter.clone();
        let response = chain
            .compose(self.default_after_filter())
            .run(request, ctx.clone())
            .await?;
        if ctx.oneway {
            return Ok(response);
        }
        Ok(filters
            .iter()
            .rev()
            .fold(response, |data, filter| filter.input(data, &ctx)))
    }

    fn default_after_filter(&self) -> Next<Bytes, Bytes> {
        let client = self.clone();
        Next::new(move |request, ctx| {
            let client = client.clone();
            Box::pin(async move { client.after_filter_handler(request, ctx).await })
        })
    }

    async fn after_filter_handler(&self, request: Bytes, ctx: InvokeContext) -> Result<Bytes> {
        let uri = self.current_uri()?;
        let exchange = self.inner.transport.send_and_receive(&uri, request, &ctx);
        match ctx.timeout() {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| Error::Timeout)?,
            None => exchange.await,
        }
    }

    // ---- batching -----------------------------------------------------

    /// Queue subsequent calls instead of sending them.
    pub fn begin_batch(&self) {
        self.inner.batch.lock().open = true;
    }

    /// Send every queued call in one request.
    ///
    /// Each queued handle settles from its own reply segment; the returned
    /// handle resolves to all outcomes in submission order, or fails when
    /// the round trip itself failed.
    pub fn end_batch(&self, options: BatchOptions) -> Pending<Vec<BatchResult>> {
        self.inner.batch.lock().open = false;
        let (tx, pending) = Pending::channel();
        self.submit(Task::EndBatch {
            options,
            settle: Box::new(move |r| {
                let _ = tx.send(r);
            }),
        });
        pending
    }

    async fn flush_batch(&self, queued: Vec<Queued>, ctx: InvokeContext) -> Result<Vec<BatchResult>> {
        let (calls, settles): (Vec<BatchCall>, Vec<Settle<Reply>>) =
            queued.into_iter().map(|q| (q.call, q.settle)).unzip();
        let meta: Vec<(String, Vec<Value>, InvokeContext)> = calls
            .iter()
            .map(|c| (c.name.clone(), c.args.clone(), c.context.clone()))
            .collect();

        let chain = self.inner.handlers.read().batch_invoke.clone();
        let result = chain
            .compose(self.default_batch_invoke())
            .run(calls, ctx)
            .await;

        match result {
            Ok(results) => {
                let mut results = results.into_iter();
                let mut outcomes = Vec::with_capacity(meta.len());
                for ((name, args, item_ctx), settle) in meta.into_iter().zip(settles) {
                    let result = results.next().unwrap_or_else(|| {
                        Err(Error::Protocol(format!("No result for batched call {name}")))
                    });
                    let settled = self.settle_reply(&name, result, &item_ctx);
                    outcomes.push(match &settled {
                        Ok(reply) => BatchResult {
                            name,
                            args: reply.args.clone(),
                            result: reply.result.clone(),
                            error: None,
                        },
                        Err(e) => BatchResult {
                            name,
                            args,
                            result: Value::Null,
                            error: Some(e.to_string()),
                        },
                    });
                    settle(settled);
                }
                Ok(outcomes)
            }
            Err(error) => {
                let error = Arc::new(error);
                for ((name, _, item_ctx), settle) in meta.into_iter().zip(settles) {
                    settle(Err(self.handle_error(&name, Error::Shared(error.clone()), &item_ctx)));
                }
                Err(Error::Shared(error))
            }
        }
    }

    fn default_batch_invoke(&self) -> Next<Vec<BatchCall>, Vec<Result<Reply>>> {
        let client = self.clone();
        Next::new(move |calls, ctx| {
            let client = client.clone();
            Box::pin(async move { client.batch_invoke_handler(calls, ctx).await })
        })
    }

    async fn batch_invoke_handler(
        &self,
        mut calls: Vec<BatchCall>,
        ctx: InvokeContext,
    ) -> Result<Vec<Result<Reply>>> {
        let mut envelopes = Vec::with_capacity(calls.len());
        for call in &mut calls {
            call.context.binary = ctx.binary;
            envelopes.push(encode_call(
                &call.name,
                &call.args,
                call.context.byref,
                call.context.simple,
                ctx.binary,
            )?);
        }
        let response = self
            .send_and_receive(finish_request(envelopes), ctx.clone())
            .await?;

        if ctx.oneway {
            return Ok(calls
                .into_iter()
                .map(|call| Ok(Reply::new(Value::Null, call.args)))
                .collect());
        }

        let modes: Vec<BatchItemMode> = calls
            .iter()
            .map(|c| BatchItemMode {
                mode: c.context.mode,
                use_harmony_map: c.context.use_harmony_map,
            })
            .collect();
        let decoded = decode_batch_reply(&response, &modes, ctx.binary)?;

        Ok(calls
            .into_iter()
            .zip(decoded)
            .map(|(call, item)| {
                item.map(|response| {
                    let mut reply = Reply::new(response.result, call.args);
                    reply.copy_args(response.args);
                    reply
                })
            })
            .collect())
    }

    // ---- service discovery ---------------------------------------------

    /// Ask the server for its procedure list and remember it.
    pub async fn use_service(&self) -> Result<Vec<String>> {
        let ctx = self.context(InvokeOptions::new().idempotent(true).failswitch(true));
        let response = self
            .send_and_receive(Bytes::from_static(FUNCTIONS_REQUEST), ctx)
            .await?;
        let names = function_names(&decode_functions(&response)?);
        tracing::debug!(count = names.len(), "service functions loaded");
        *self.inner.functions.write() = Some(names.clone());
        Ok(names)
    }

    /// Procedure names from the builder or the last [`use_service`](Self::use_service).
    pub fn functions(&self) -> Option<Vec<String>> {
        self.inner.functions.read().clone()
    }

    // ---- topics -------------------------------------------------------

    /// Subscribe `callback` to `topic`.
    ///
    /// Without `id` the client's own subscriber id is used, fetched once
    /// from the server. Subscribing an already active `(topic, id)` only adds
    /// the callback. Resolves to the subscriber id.
    pub async fn subscribe(
        &self,
        topic: &str,
        id: Option<&str>,
        callback: TopicCallback,
        options: SubscribeOptions,
    ) -> Result<String> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self.auto_id().await?,
        };
        let started = self.inner.topics.lock().add(topic, &id, callback);
        if started {
            self.spawn_topic_loop(topic.to_string(), id.clone(), options);
        }
        Ok(id)
    }

    fn spawn_topic_loop(&self, topic: String, id: String, options: SubscribeOptions) {
        let client = self.clone();
        tokio::spawn(async move {
            tracing::debug!(%topic, %id, "topic subscribed");
            loop {
                let active = client.inner.topics.lock().is_active(&topic, &id);
                if !active {
                    break;
                }
                let mut pull = InvokeOptions::new()
                    .idempotent(true)
                    .failswitch(options.failswitch)
                    .on_error(|name, e| tracing::warn!(topic = name, error = %e, "topic pull failed"));
                if let Some(timeout) = options.timeout {
                    pull = pull.timeout(timeout);
                }
                let reply = client
                    .invoke_direct(&topic, vec![Value::from(id.as_str())], pull)
                    .await;
                let Ok(reply) = reply else {
                    continue;
                };
                if reply.result.is_null() {
                    continue;
                }
                let callbacks = client.inner.topics.lock().callbacks(&topic, &id);
                for callback in callbacks.into_iter().flatten() {
                    callback(&reply.result);
                }
            }
            tracing::debug!(%topic, %id, "topic unsubscribed");
        });
    }

    /// Remove subscriptions.
    ///
    /// With neither `id` nor `callback` the whole topic is dropped. Without
    /// `id` the client's own subscriber id is used when known, otherwise every
    /// id of the topic. Without `callback` every callback of the id goes.
    pub fn unsubscribe(&self, topic: &str, id: Option<&str>, callback: Option<&TopicCallback>) {
        let auto_id = self.inner.id.get().cloned();
        self.inner
            .topics
            .lock()
            .remove(topic, id, callback, auto_id.as_deref());
    }

    /// Whether `topic` has any subscriber.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner.topics.lock().contains(topic)
    }

    /// Names of subscribed topics.
    pub fn subscribed_list(&self) -> Vec<String> {
        self.inner.topics.lock().names()
    }

    /// The client's subscriber id, fetched from the server on first use.
    pub async fn auto_id(&self) -> Result<String> {
        self.inner
            .id
            .get_or_try_init(|| self.fetch_id())
            .await
            .cloned()
    }

    async fn fetch_id(&self) -> Result<String> {
        let options = InvokeOptions::new()
            .sync(true)
            .idempotent(true)
            .failswitch(true);
        let reply = self.invoke_direct("#", Vec::new(), options).await?;
        match &reply.result {
            Value::String(id) => Ok(id.clone()),
            Value::Integer(id) => Ok(id.to_string()),
            other => Err(Error::Protocol(format!(
                "Unexpected subscriber id of type {}",
                other.kind()
            ))),
        }
    }

    /// The subscriber id, if already fetched.
    pub fn id(&self) -> Option<String> {
        self.inner.id.get().cloned()
    }

    // ---- configuration ------------------------------------------------

    /// Current endpoint.
    pub fn uri(&self) -> Option<Url> {
        self.inner.endpoints.lock().current()
    }

    fn current_uri(&self) -> Result<Url> {
        self.uri()
            .ok_or_else(|| Error::InvalidUri("You should set server uri first!".into()))
    }

    /// All endpoints, in rotation order.
    pub fn uri_list(&self) -> Vec<Url> {
        self.inner.endpoints.lock().uris.clone()
    }

    /// Replace the endpoints; the first becomes current.
    ///
    /// The new endpoints must belong to the protocol family the client was
    /// built for.
    pub fn set_uri_list<S: AsRef<str>>(&self, uris: &[S]) -> Result<()> {
        let (scheme, urls) = parse_endpoints(uris)?;
        if self.inner.scheme.is_some_and(|s| s != scheme) {
            return Err(Error::MixedSchemes);
        }
        *self.inner.endpoints.lock() = Endpoints::new(urls);
        Ok(())
    }

    /// Number of times the endpoint list was exhausted by fail-switching.
    pub fn failround(&self) -> u64 {
        self.inner.endpoints.lock().failround
    }

    /// Snapshot of the settings.
    pub fn settings(&self) -> Settings {
        self.inner.settings.read().clone()
    }

    /// Change call defaults for subsequent calls.
    ///
    /// Transport options (pool size, keep-alive, headers) are read when the
    /// client is built and are not affected.
    pub fn configure(&self, f: impl FnOnce(&mut Settings)) {
        let mut settings = self.inner.settings.write();
        f(&mut settings);
        *settings = settings.clone().normalized();
    }

    /// Add a filter.
    pub fn add_filter(&self, filter: Arc<dyn Filter>) {
        self.inner.filters.write().push(filter);
    }

    /// Remove a filter previously added; false when it was not present.
    pub fn remove_filter(&self, filter: &Arc<dyn Filter>) -> bool {
        let mut filters = self.inner.filters.write();
        let target = Arc::as_ptr(filter) as *const ();
        match filters.iter().position(|f| Arc::as_ptr(f) as *const () == target) {
            Some(i) => {
                filters.remove(i);
                true
            }
            None => false,
        }
    }

    /// Registered filters.
    pub fn filters(&self) -> Vec<Arc<dyn Filter>> {
        self.inner.filters.read().clone()
    }

    /// Register an invoke handler on a running client.
    pub fn use_invoke<F, Fut>(&self, handler: F) -> &Self
    where
        F: Fn(Call, InvokeContext, Next<Call, Reply>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        self.inner.handlers.write().add_invoke(handler);
        self
    }

    /// Register a before-filter handler on a running client.
    pub fn use_before_filter<F, Fut>(&self, handler: F) -> &Self
    where
        F: Fn(Bytes, InvokeContext, Next<Bytes, Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.inner.handlers.write().add_before_filter(handler);
        self
    }

    /// Register an after-filter handler on a running client.
    pub fn use_after_filter<F, Fut>(&self, handler: F) -> &Self
    where
        F: Fn(Bytes, InvokeContext, Next<Bytes, Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.inner.handlers.write().add_after_filter(handler);
        self
    }

    /// Replace the client-wide error handler.
    pub fn set_on_error<F>(&self, callback: F)
    where
        F: Fn(&str, &Error) + Send + Sync + 'static,
    {
        *self.inner.on_error.write() = Some(Arc::new(callback));
    }

    /// Replace the fail-switch hook.
    pub fn set_on_failswitch<F>(&self, callback: F)
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        *self.inner.on_failswitch.write() = Some(Arc::new(callback));
    }

    /// Close the transport's connections; later calls reconnect.
    pub fn close(&self) {
        self.inner.transport.close();
    }
}
