//! # wwand-qmi
//!
//! Synchronous QMI client for the wwand connection supervisor.
//!
//! The modem exposes a QMUX multiplex over a character device
//! (`/dev/wwan0qmi0`). [`transport::QmuxTransport`] owns that device and a
//! reader thread; typed service clients attach to it through the QMI CTL
//! service (client-id allocation) and issue synchronous request/response
//! calls. Unsolicited indications are dispatched from the reader thread to a
//! per-service callback registered at attach time.
//!
//! Two services are implemented on top of the transport:
//!
//! - [`dms`]: operating-mode control and static modem identity, plus the
//!   vendor DMS extension service that must be attached alongside it.
//! - [`wds`]: per-address-family packet data sessions. Start/stop, runtime
//!   settings, autoconnect policy, and the packet-service-status indication
//!   that signals asynchronous session teardown.

pub mod dms;
pub mod transport;
pub mod wds;
mod wire;

mod error;
pub use error::QmiError;

/// QMI service types carried in the QMUX header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceType {
    /// Control service: client-id allocation and release.
    Ctl = 0x00,
    /// Wireless Data Service.
    Wds = 0x01,
    /// Device Management Service.
    Dms = 0x02,
    /// Vendor DMS extension. No indications are ever delivered for it, but
    /// the firmware expects it to be attached alongside the main DMS client.
    VendorDms = 0xE7,
}

impl ServiceType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
