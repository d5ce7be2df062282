//! # wwand-host
//!
//! Host-side collaborators of the wwand connection supervisor:
//!
//! - [`netlink`]: idempotent management of the wwan and tunnel links,
//!   their addresses and default routes, over a raw `NETLINK_ROUTE` socket.
//! - [`sdbus`]: a minimal system-bus client for starting and stopping the
//!   DNS and time units through the service manager.
//! - [`tunnel`]: the WireGuard configuration subprocess.
//!
//! Everything here runs synchronously on the supervisor's thread; nothing
//! in this crate spawns threads or holds state across supervisor
//! iterations beyond the netlink caches.

pub mod netlink;
pub mod sdbus;
pub mod tunnel;

mod error;
pub use error::HostError;
