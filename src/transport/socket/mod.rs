//! Socket transports for the `tcp:` family.
//!
//! - `tcp:`, `tcp4:`, `tcp6:` - plain TCP, optionally restricted to one
//!   address family
//! - `tcps:`, `tcp4s:`, `tcp6s:`, `tls:` - the same over TLS (tokio-rustls,
//!   webpki roots)
//!
//! Frames are length-prefixed; see [`crate::protocol::Header`]. The
//! [`HalfDuplexTransport`] sends one request per connection at a time, the
//! [`FullDuplexTransport`] multiplexes requests by correlation id.

mod full_duplex;
mod half_duplex;
mod stream;

pub use full_duplex::{FullDuplexTransport, MAX_IN_FLIGHT};
pub use half_duplex::HalfDuplexTransport;
