//! Codec module - the hprose tagged serialization format.
//!
//! - [`tags`] - one-byte markers for values and RPC framing
//! - [`Value`] - dynamic value model with shared containers
//! - [`registry`] - process-wide Rust type to class alias mapping
//! - [`Writer`] / [`Reader`] - streaming encode/decode with reference tables
//! - [`RawReader`] - verbatim copy of encoded values
//! - [`Formatter`] - one-shot encode/decode
//!
//! # Example
//!
//! ```
//! use hprose_client::codec::{Formatter, Value};
//!
//! let encoded = Formatter::serialize(&Value::from(2147483648i64), false, false).unwrap();
//! assert_eq!(&encoded[..], b"l2147483648;");
//! ```

mod formatter;
mod raw;
mod reader;
pub mod registry;
mod stream;
pub mod tags;
mod value;
mod writer;

pub use formatter::Formatter;
pub use raw::RawReader;
pub use reader::{ClassDescriptor, Reader};
pub use registry::HproseClass;
pub use value::{DateTimeValue, ListHandle, MapHandle, Object, ObjectHandle, Value};
pub use writer::{Writer, MAX_DEPTH};
