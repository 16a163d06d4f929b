//! Transport layer for pinhole relay connections
//!
//! Opens TCP or TLS connections with uniform read/write/shutdown semantics
//! and keep-alive enabled. Retry policy does not live here - a failed dial
//! surfaces as an error and the caller decides what to do with it.

mod error;
mod listener;
mod security;
mod stream;

pub use error::{TransportError, TransportResult};
pub use listener::TlsListenerConfig;
pub use security::TransportSecurityConfig;
pub use stream::{common_name_from_der, connect, set_keep_alive, RelayStream, KEEP_ALIVE_PROBE};
