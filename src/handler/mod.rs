//! Handler module - call context, filters and middleware.
//!
//! Provides:
//! - [`InvokeContext`] - resolved options of one call
//! - [`InvokeOptions`] / [`BatchOptions`] - call-site overrides
//! - [`HandlerRegistry`] - the invoke, batch-invoke, before-filter and
//!   after-filter chains
//! - [`Filter`] - byte-level request/response transformation
//!
//! # Example
//!
//! ```no_run
//! use hprose_client::handler::Call;
//! use hprose_client::Client;
//!
//! # fn main() -> hprose_client::Result<()> {
//! let client = Client::builder()
//!     .uri("http://127.0.0.1:8080/")
//!     .use_invoke(|call: Call, ctx, next| async move {
//!         let started = std::time::Instant::now();
//!         let reply = next.run(call, ctx).await;
//!         tracing::info!(elapsed = ?started.elapsed(), "call finished");
//!         reply
//!     })
//!     .build()?;
//! # let _ = client;
//! # Ok(())
//! # }
//! ```

mod context;
mod filter;
mod registry;

pub use context::{BatchOptions, ErrorCallback, InvokeContext, InvokeOptions, SuccessCallback};
pub use filter::Filter;
pub use registry::{
    BatchInvokeChain, BoxFuture, Chain, FilterChain, FnMiddleware, HandlerRegistry, InvokeChain,
    Middleware, Next,
};

use crate::codec::Value;

/// A procedure call travelling down the invoke chain.
#[derive(Debug, Clone)]
pub struct Call {
    /// Procedure name.
    pub name: String,
    /// Arguments.
    pub args: Vec<Value>,
}

impl Call {
    /// Create a call.
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// One call queued in a batch, with its own context.
#[derive(Debug, Clone)]
pub struct BatchCall {
    /// Procedure name.
    pub name: String,
    /// Arguments.
    pub args: Vec<Value>,
    /// Options of this call; only the encoding and decoding ones apply.
    pub context: InvokeContext,
}

/// Settled call.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Result, `Value::Bytes` in the non-normal result modes.
    pub result: Value,
    /// Arguments after the call; by-reference calls see the server's updates.
    pub args: Vec<Value>,
}

impl Reply {
    /// Reply with `result` and the given arguments.
    pub fn new(result: Value, args: Vec<Value>) -> Self {
        Self { result, args }
    }

    /// Overwrite leading arguments with those echoed by the server.
    pub(crate) fn copy_args(&mut self, echoed: Option<Vec<Value>>) {
        if let Some(echoed) = echoed {
            for (dest, src) in self.args.iter_mut().zip(echoed) {
                *dest = src;
            }
        }
    }
}
