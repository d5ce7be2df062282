//! # wwand
//!
//! A zero-configuration supervisor for a dual-stack cellular data
//! connection. One modem, one carrier profile, and a short list of host
//! facilities that must track the connection's state: the wwan interface's
//! addresses and default routes, a WireGuard tunnel, and the DNS and time
//! services.
//!
//! The daemon is deliberately pedantic. Any inconsistency (a dropped
//! session, a missing address, a service that will not start) tears the
//! whole stack down to a known state and rebuilds it from scratch, rate
//! limited so a hostile network is not hammered with modem operations.
//!
//! [`supervisor`] holds the state machine and the collaborator traits it
//! drives; [`adapters`] binds those traits to the real QMI and host-side
//! implementations.

pub mod adapters;
pub mod supervisor;
