//! Device Management Service: operating-mode control and modem identity.
//!
//! The DMS client is attached at the start of every supervisor iteration and
//! detached at its end; the model id fetched on the first successful attach
//! is cached across iterations so a bounce of the connection does not re-read
//! static identity from the firmware.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::transport::{QmuxTransport, ServiceClient};
use crate::wire::TlvWriter;
use crate::{QmiError, ServiceType};

const DMS_GET_MODEL: u16 = 0x0022;
const DMS_GET_OPERATING_MODE: u16 = 0x002D;
const DMS_SET_OPERATING_MODE: u16 = 0x002E;

const TLV_OPERATING_MODE: u8 = 0x01;
const TLV_HARDWARE_RESTRICTED: u8 = 0x11;
const TLV_MODEL: u8 = 0x01;

/// Modem operating modes, in the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationMode {
    Online = 0,
    LowPower = 1,
    FactoryTest = 2,
    Offline = 3,
    Resetting = 4,
    PowerOff = 5,
    PersistentLowPower = 6,
    OnlyLowPower = 7,
}

impl OperationMode {
    fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            0 => OperationMode::Online,
            1 => OperationMode::LowPower,
            2 => OperationMode::FactoryTest,
            3 => OperationMode::Offline,
            4 => OperationMode::Resetting,
            5 => OperationMode::PowerOff,
            6 => OperationMode::PersistentLowPower,
            7 => OperationMode::OnlyLowPower,
            _ => return None,
        })
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OperationMode::Online => "Online",
            OperationMode::LowPower => "Low power (airplane) mode",
            OperationMode::FactoryTest => "Factory test mode",
            OperationMode::Offline => "Offline",
            OperationMode::Resetting => "Resetting",
            OperationMode::PowerOff => "Power off",
            OperationMode::PersistentLowPower => "Persistent low power (airplane) mode",
            OperationMode::OnlyLowPower => "Mode-only low power",
        };
        f.write_str(label)
    }
}

/// Operating-mode state as reported by the modem.
#[derive(Debug, Clone, Copy)]
pub struct PowerState {
    pub mode: OperationMode,
    /// When set, the mode is pinned by hardware (e.g. a kill switch) and
    /// writing it would be futile.
    pub hardware_controlled: bool,
}

/// Persistent DMS state. Survives attach/detach cycles; holds only the
/// cached identity.
#[derive(Clone, Default)]
pub struct Dms {
    model_id: Arc<Mutex<Option<String>>>,
}

impl Dms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached model id, if an attach has fetched it.
    pub fn model_id(&self) -> Option<String> {
        self.model_id.lock().unwrap().clone()
    }

    /// Attach the vendor extension service and the main DMS service, caching
    /// the model id on first success. Unwinds whichever attachments were
    /// made if any step fails.
    pub fn attach(&self, transport: &QmuxTransport) -> Result<DmsAttachment, QmiError> {
        // The vendor extension never raises indications.
        let vendor = transport.attach(ServiceType::VendorDms, None)?;

        // The main service gets a handler so firmware indications are
        // consumed rather than logged as unroutable; none are acted upon.
        let dms = match transport.attach(
            ServiceType::Dms,
            Some(Box::new(|msg_id, _| {
                debug!(msg_id, "ignoring DMS indication");
            })),
        ) {
            Ok(dms) => dms,
            Err(e) => {
                let mut status = e;
                if let Err(unwind) = transport.detach(vendor) {
                    status = unwind;
                }
                return Err(status);
            }
        };

        let attachment = DmsAttachment {
            dms,
            vendor,
            cache: self.model_id.clone(),
        };

        if self.model_id.lock().unwrap().is_none() {
            match attachment.fetch_model() {
                Ok(model) => {
                    info!(model = %model, "modem identity");
                    *self.model_id.lock().unwrap() = Some(model);
                }
                Err(e) => {
                    let mut status = e;
                    if let Err(unwind) = attachment.detach(transport, false) {
                        status = unwind;
                    }
                    return Err(status);
                }
            }
        }

        Ok(attachment)
    }
}

/// Live DMS attachment: both service handles plus a reference to the cache.
pub struct DmsAttachment {
    dms: ServiceClient,
    vendor: ServiceClient,
    cache: Arc<Mutex<Option<String>>>,
}

impl DmsAttachment {
    fn fetch_model(&self) -> Result<String, QmiError> {
        let tlvs = self.dms.request(DMS_GET_MODEL, &[])?;
        let raw = tlvs.require(TLV_MODEL, "model id")?;
        String::from_utf8(raw.to_vec())
            .map(|s| s.trim_end_matches('\0').to_string())
            .map_err(|_| QmiError::Malformed("model id is not UTF-8"))
    }

    /// Query the current operating mode and whether it is hardware pinned.
    pub fn get_power(&self) -> Result<PowerState, QmiError> {
        let tlvs = self.dms.request(DMS_GET_OPERATING_MODE, &[])?;
        let mode = tlvs
            .get_u8(TLV_OPERATING_MODE)
            .ok_or(QmiError::MissingField("operating mode"))?;
        let mode =
            OperationMode::from_wire(mode).ok_or(QmiError::Malformed("unknown operating mode"))?;
        let hardware_controlled = tlvs.get_u8(TLV_HARDWARE_RESTRICTED).unwrap_or(0) != 0;
        Ok(PowerState {
            mode,
            hardware_controlled,
        })
    }

    /// Drive the modem to `requested` and return the mode it actually ended
    /// up in.
    ///
    /// The write is skipped when the modem is already in the requested mode
    /// or reports a hardware-controlled lock; in both cases the current mode
    /// is returned as the result. After a write, the mode is read back; a
    /// disagreement with the request is a failure.
    pub fn set_power(&self, requested: OperationMode) -> Result<OperationMode, QmiError> {
        let current = self.get_power()?;
        if current.mode == requested || current.hardware_controlled {
            if current.hardware_controlled {
                info!(
                    mode = %current.mode,
                    "operating mode is hardware controlled; leaving it alone"
                );
            }
            return Ok(current.mode);
        }

        let mut w = TlvWriter::new();
        w.put_u8(TLV_OPERATING_MODE, requested as u8);
        self.dms.request(DMS_SET_OPERATING_MODE, w.finish())?;

        let observed = self.get_power()?;
        if observed.mode != requested {
            return Err(QmiError::ModeReadBack);
        }
        Ok(observed.mode)
    }

    /// Detach both service handles, dropping the cached model id when
    /// `deallocate_cache` is set. Both detaches are attempted even if the
    /// first fails; the last error wins.
    pub fn detach(
        self,
        transport: &QmuxTransport,
        deallocate_cache: bool,
    ) -> Result<(), QmiError> {
        if deallocate_cache {
            *self.cache.lock().unwrap() = None;
        }

        let mut status = Ok(());
        if let Err(e) = transport.detach(self.vendor) {
            status = Err(e);
        }
        if let Err(e) = transport.detach(self.dms) {
            status = Err(e);
        }
        status
    }
}
