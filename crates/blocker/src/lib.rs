//! Sitefence reactive blocker.
//!
//! Tails the proxy's event log, accumulates every IP the target domain has
//! resolved to, and keeps a PF anchor's drop rules converged to that set.
//! Runs as its own process; the event log file is the only coordination
//! channel with the proxy.

pub mod pf;
pub mod snapshot;
pub mod state;
pub mod sync;
pub mod tailer;

pub use pf::{FirewallPort, PfctlFirewall};
pub use snapshot::StatusSnapshot;
pub use state::BlockerState;
pub use sync::BlockSynchronizer;
