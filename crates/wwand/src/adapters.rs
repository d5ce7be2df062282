//! Bindings from the supervisor's collaborator traits to the real
//! implementations in `wwand-qmi` and `wwand-host`.
//!
//! The transport is shared behind an `Arc` so detached attachments can be
//! released without the supervisor ever naming it: it must be created
//! before and dropped after everything attached to it.

use std::sync::Arc;

use tracing::info;

use wwand_host::netlink::HostNetwork;
use wwand_host::sdbus::{SystemBus, UnitVerb};
use wwand_host::{tunnel, HostError};
use wwand_qmi::dms::{Dms, DmsAttachment, OperationMode};
use wwand_qmi::transport::QmuxTransport;
use wwand_qmi::wds::{
    AutoconnectRoamSetting, AutoconnectSetting, IpFamily, RuntimeSettings, StartOutcome,
    WdsSession,
};
use wwand_qmi::QmiError;

use crate::supervisor::{
    DataSession, DeviceControl, HostNet, ModemPort, ServiceManager, TunnelConfig,
};

/// Modem service attachments over the shared QMUX transport.
pub struct PlatformModem {
    transport: Arc<QmuxTransport>,
    dms: Dms,
}

impl PlatformModem {
    pub fn new(transport: Arc<QmuxTransport>) -> Self {
        PlatformModem {
            transport,
            dms: Dms::new(),
        }
    }
}

impl ModemPort for PlatformModem {
    fn attach_dms(&mut self) -> Result<Box<dyn DeviceControl>, QmiError> {
        let attachment = self.dms.attach(&self.transport)?;
        Ok(Box::new(PlatformDms {
            transport: self.transport.clone(),
            attachment,
        }))
    }

    fn attach_wds(&mut self, family: IpFamily) -> Result<Box<dyn DataSession>, QmiError> {
        let session = WdsSession::attach(&self.transport, family)?;
        Ok(Box::new(PlatformSession {
            transport: self.transport.clone(),
            session,
        }))
    }
}

struct PlatformDms {
    transport: Arc<QmuxTransport>,
    attachment: DmsAttachment,
}

impl DeviceControl for PlatformDms {
    fn set_power(&mut self, mode: OperationMode) -> Result<OperationMode, QmiError> {
        self.attachment.set_power(mode)
    }

    fn detach(self: Box<Self>, deallocate_cache: bool) -> Result<(), QmiError> {
        let this = *self;
        this.attachment.detach(&this.transport, deallocate_cache)
    }
}

struct PlatformSession {
    transport: Arc<QmuxTransport>,
    session: WdsSession,
}

impl DataSession for PlatformSession {
    fn set_autoconnect(
        &mut self,
        setting: AutoconnectSetting,
        roam: AutoconnectRoamSetting,
    ) -> Result<(), QmiError> {
        self.session.set_autoconnect(setting, roam)
    }

    fn bring_up(&mut self, profile_id: u32) -> Result<StartOutcome, QmiError> {
        self.session.set_ip_family_preference()?;
        self.session.start_data_session(profile_id)
    }

    fn runtime_settings(&mut self) -> Result<RuntimeSettings, QmiError> {
        self.session.get_runtime_settings()
    }

    fn stop(&mut self) -> Result<(), QmiError> {
        self.session.stop_data_session()
    }

    fn teardown_requested(&self) -> bool {
        self.session.teardown_requested()
    }

    fn detach(self: Box<Self>) -> Result<(), QmiError> {
        let this = *self;
        this.session.detach(&this.transport)
    }
}

impl HostNet for HostNetwork {
    fn reload_link_cache(&mut self) -> Result<(), HostError> {
        HostNetwork::reload_link_cache(self)
    }

    fn ensure_wwan_state(&mut self, up: bool) -> Result<(), HostError> {
        HostNetwork::ensure_wwan_state(self, up)
    }

    fn ensure_tunnel_state(&mut self, up: bool) -> Result<(), HostError> {
        HostNetwork::ensure_tunnel_state(self, up)
    }

    fn flush_addresses(&mut self) -> Result<(), HostError> {
        HostNetwork::flush_addresses(self)
    }

    fn apply_settings(
        &mut self,
        settings: &RuntimeSettings,
        refresh_cache: bool,
    ) -> Result<(), HostError> {
        if refresh_cache {
            self.reload_address_cache()?;
        }
        match *settings {
            RuntimeSettings::V4 {
                address,
                gateway,
                prefix_length,
            } => {
                info!(
                    address = %address,
                    prefix_length,
                    gateway = %gateway,
                    "applying IPv4 configuration"
                );
                self.add_v4_address(address, prefix_length)?;
                self.change_v4_default_gateway(address, gateway)
            }
            RuntimeSettings::V6 {
                address,
                gateway,
                prefix_length,
            } => {
                info!(
                    address = %address,
                    prefix_length,
                    gateway = %gateway,
                    "applying IPv6 configuration"
                );
                self.add_v6_address(address, prefix_length)?;
                self.change_v6_default_gateway(address, gateway)
            }
        }
    }

    fn ensure_tunnel_routes(&mut self) -> Result<(), HostError> {
        HostNetwork::ensure_tunnel_routes(self)
    }
}

impl ServiceManager for SystemBus {
    fn start_unit(&mut self, unit: &str) -> Result<(), HostError> {
        self.manage_unit(UnitVerb::Start, unit)
    }

    fn stop_unit(&mut self, unit: &str) -> Result<(), HostError> {
        self.manage_unit(UnitVerb::Stop, unit)
    }
}

/// The production tunnel configurator: `wg setconf` as a subprocess.
pub struct WgTunnel;

impl TunnelConfig for WgTunnel {
    fn apply(&mut self) -> Result<(), HostError> {
        tunnel::apply_config()
    }
}
