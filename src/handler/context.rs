//! Execution context of one call.
//!
//! A context is built fresh for every call from the client settings, then
//! overlaid with the call-site [`InvokeOptions`]. It travels through the
//! middleware chains and the transport, and is dropped once the call settles.
//!
//! # Example
//!
//! ```
//! use hprose_client::{InvokeOptions, ResultMode};
//!
//! let options = InvokeOptions::new()
//!     .mode(ResultMode::Serialized)
//!     .idempotent(true)
//!     .timeout(5_000)
//!     .on_error(|name, err| eprintln!("{name} failed: {err}"));
//! # let _ = options;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::Value;
use crate::config::{millis, Settings};
use crate::error::{Error, Result};
use crate::protocol::ResultMode;

/// Called with the result and the arguments after a successful call.
///
/// Returning an error turns the call into a failure.
pub type SuccessCallback = Arc<dyn Fn(&Value, &[Value]) -> Result<()> + Send + Sync>;

/// Called with the procedure name and the error of a failed call.
pub type ErrorCallback = Arc<dyn Fn(&str, &Error) + Send + Sync>;

/// Resolved options governing one call.
#[derive(Clone)]
pub struct InvokeContext {
    /// How the result is delivered.
    pub mode: ResultMode,
    /// Byte-accurate string encoding.
    pub binary: bool,
    /// Request the mutated arguments back.
    pub byref: bool,
    /// No reference tracking.
    pub simple: bool,
    /// Timeout in milliseconds, 0 disables it.
    pub timeout: u64,
    /// Retry budget.
    pub retry: u32,
    /// Retries consumed so far.
    pub retried: u32,
    /// Whether the request may be sent again.
    pub idempotent: bool,
    /// Rotate endpoints on failure.
    pub failswitch: bool,
    /// Resolve without waiting for the response.
    pub oneway: bool,
    /// Hold back other calls until this one settles.
    pub sync: bool,
    /// Decode maps as ordered maps.
    pub use_harmony_map: bool,
    /// Free-form data for filters and middleware.
    pub user_data: HashMap<String, Value>,
    pub(crate) on_success: Option<SuccessCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl InvokeContext {
    /// Context with the client-wide defaults.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            mode: ResultMode::Normal,
            binary: settings.binary,
            byref: settings.byref,
            simple: settings.simple,
            timeout: settings.timeout,
            retry: settings.retry,
            retried: 0,
            idempotent: settings.idempotent,
            failswitch: settings.failswitch,
            oneway: false,
            sync: false,
            use_harmony_map: settings.use_harmony_map,
            user_data: HashMap::new(),
            on_success: None,
            on_error: None,
        }
    }

    /// Timeout as a duration, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        millis(self.timeout)
    }

    /// Report `error` to the call's error callback.
    ///
    /// Returns false when the call has none.
    pub(crate) fn report_error(&self, name: &str, error: &Error) -> bool {
        match &self.on_error {
            Some(on_error) => {
                on_error(name, error);
                true
            }
            None => false,
        }
    }
}

impl Default for InvokeContext {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl fmt::Debug for InvokeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokeContext")
            .field("mode", &self.mode)
            .field("binary", &self.binary)
            .field("byref", &self.byref)
            .field("simple", &self.simple)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("retried", &self.retried)
            .field("idempotent", &self.idempotent)
            .field("failswitch", &self.failswitch)
            .field("oneway", &self.oneway)
            .field("sync", &self.sync)
            .field("use_harmony_map", &self.use_harmony_map)
            .finish_non_exhaustive()
    }
}

/// Call-site overrides of the client defaults.
///
/// Unset fields keep the client-wide value.
#[derive(Clone, Default)]
pub struct InvokeOptions {
    mode: Option<ResultMode>,
    binary: Option<bool>,
    byref: Option<bool>,
    simple: Option<bool>,
    timeout: Option<u64>,
    retry: Option<u32>,
    idempotent: Option<bool>,
    failswitch: Option<bool>,
    oneway: Option<bool>,
    sync: Option<bool>,
    use_harmony_map: Option<bool>,
    user_data: HashMap<String, Value>,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl InvokeOptions {
    /// Options that change nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the result mode.
    pub fn mode(mut self, mode: ResultMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set byte-accurate string encoding.
    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = Some(binary);
        self
    }

    /// Ask the server to echo mutated arguments.
    pub fn byref(mut self, byref: bool) -> Self {
        self.byref = Some(byref);
        self
    }

    /// Disable reference tracking.
    pub fn simple(mut self, simple: bool) -> Self {
        self.simple = Some(simple);
        self
    }

    /// Timeout in milliseconds, 0 disables it.
    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    /// Retry budget.
    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Mark the call safe to send again.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    /// Rotate endpoints on failure.
    pub fn failswitch(mut self, failswitch: bool) -> Self {
        self.failswitch = Some(failswitch);
        self
    }

    /// Resolve without waiting for the response.
    pub fn oneway(mut self, oneway: bool) -> Self {
        self.oneway = Some(oneway);
        self
    }

    /// Hold back other calls until this one settles.
    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Decode maps as ordered maps.
    pub fn use_harmony_map(mut self, use_harmony_map: bool) -> Self {
        self.use_harmony_map = Some(use_harmony_map);
        self
    }

    /// Attach data visible to filters and middleware.
    pub fn user_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.user_data.insert(key.into(), value.into());
        self
    }

    /// Callback run with the result before the call resolves.
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<()> + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    /// Callback run with the error instead of the client-wide handler.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Overlay these options on `ctx`.
    pub fn apply(self, ctx: &mut InvokeContext) {
        if let Some(v) = self.mode {
            ctx.mode = v;
        }
        if let Some(v) = self.binary {
            ctx.binary = v;
        }
        if let Some(v) = self.byref {
            ctx.byref = v;
        }
        if let Some(v) = self.simple {
            ctx.simple = v;
        }
        if let Some(v) = self.timeout {
            ctx.timeout = v;
        }
        if let Some(v) = self.retry {
            ctx.retry = v;
        }
        if let Some(v) = self.idempotent {
            ctx.idempotent = v;
        }
        if let Some(v) = self.failswitch {
            ctx.failswitch = v;
        }
        if let Some(v) = self.oneway {
            ctx.oneway = v;
        }
        if let Some(v) = self.sync {
            ctx.sync = v;
        }
        if let Some(v) = self.use_harmony_map {
            ctx.use_harmony_map = v;
        }
        ctx.user_data.extend(self.user_data);
        if self.on_success.is_some() {
            ctx.on_success = self.on_success;
        }
        if self.on_error.is_some() {
            ctx.on_error = self.on_error;
        }
    }
}

/// Options of the request that flushes a batch.
///
/// Per-call options such as the result mode stay with each queued call;
/// these govern the single round trip.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    binary: Option<bool>,
    timeout: Option<u64>,
    retry: Option<u32>,
    idempotent: Option<bool>,
    failswitch: Option<bool>,
    oneway: Option<bool>,
    sync: Option<bool>,
}

impl BatchOptions {
    /// Options that change nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Byte-accurate string encoding for every call in the batch.
    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = Some(binary);
        self
    }

    /// Timeout in milliseconds, 0 disables it.
    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    /// Retry budget.
    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Mark the batch safe to send again.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    /// Rotate endpoints on failure.
    pub fn failswitch(mut self, failswitch: bool) -> Self {
        self.failswitch = Some(failswitch);
        self
    }

    /// Resolve without waiting for the response.
    pub fn oneway(mut self, oneway: bool) -> Self {
        self.oneway = Some(oneway);
        self
    }

    /// Hold back other calls until the batch settles.
    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Context of the batch request.
    pub(crate) fn into_context(self, settings: &Settings) -> InvokeContext {
        let mut ctx = InvokeContext::from_settings(settings);
        let options = InvokeOptions {
            binary: self.binary,
            timeout: self.timeout,
            retry: self.retry,
            idempotent: self.idempotent,
            failswitch: self.failswitch,
            oneway: self.oneway,
            sync: self.sync,
            ..InvokeOptions::default()
        };
        options.apply(&mut ctx);
        ctx
    }
}
