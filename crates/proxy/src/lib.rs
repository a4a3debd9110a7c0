//! Sitefence DNS forwarding proxy.
//!
//! Relays every query to a single upstream resolver over UDP or TCP, answers
//! the client with the upstream's bytes verbatim (or a synthesized SERVFAIL
//! when the upstream fails), and appends one event log line per completed
//! exchange.

pub mod forward;
pub mod server;
pub mod state;

pub use server::DnsProxy;
pub use state::ProxyState;
