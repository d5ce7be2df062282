//! Wireless Data Service: per-family packet sessions.
//!
//! Each [`WdsSession`] is bound to one address family and owns one WDS
//! client id for its lifetime. The modem reports asynchronous session state
//! through packet-service-status indications; the only thing the indication
//! path may touch is the session's teardown flag, which the supervisor polls
//! from the main thread. Disconnects the host itself caused (stopping the
//! session, or the firmware's client-end verbose reason) do not raise the
//! flag.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::transport::{QmuxTransport, ServiceClient};
use crate::wire::{Tlvs, TlvWriter};
use crate::{QmiError, ServiceType};

const WDS_START_NETWORK: u16 = 0x0020;
const WDS_STOP_NETWORK: u16 = 0x0021;
const WDS_GET_PKT_SRVC_STATUS: u16 = 0x0022;
const WDS_PKT_SRVC_STATUS_IND: u16 = 0x0022;
const WDS_GET_CURRENT_SETTINGS: u16 = 0x002D;
const WDS_GET_AUTOCONNECT: u16 = 0x0034;
const WDS_SET_IP_FAMILY: u16 = 0x004D;
const WDS_SET_AUTOCONNECT: u16 = 0x0051;

const TLV_PKT_DATA_HANDLE: u8 = 0x01;
const TLV_PROFILE_INDEX_3GPP: u8 = 0x31;
const TLV_CALL_END_REASON: u8 = 0x10;
const TLV_VERBOSE_CALL_END: u8 = 0x11;
const TLV_CONNECTION_STATUS: u8 = 0x01;
const TLV_REQUESTED_SETTINGS: u8 = 0x10;
const TLV_IPV4_ADDRESS: u8 = 0x1E;
const TLV_IPV4_GATEWAY: u8 = 0x20;
const TLV_IPV4_SUBNET_MASK: u8 = 0x21;
const TLV_IPV6_ADDRESS: u8 = 0x25;
const TLV_IPV6_GATEWAY: u8 = 0x26;
const TLV_IP_FAMILY: u8 = 0x01;
const TLV_AUTOCONNECT_SETTING: u8 = 0x01;
const TLV_AUTOCONNECT_ROAM: u8 = 0x10;

/// Address + gateway bits requested from Get Current Settings.
const REQUESTED_ADDRESS_AND_GATEWAY: u32 = 0x0300;

/// Call-end reason reported when the host itself ended the session.
const CALL_END_REASON_CLIENT: u16 = 2;
/// Verbose call-end `(type, reason)` for a host-initiated end.
const VERBOSE_END_TYPE_INTERNAL: u16 = 3;
const VERBOSE_END_REASON_CLIENT: u16 = 2000;

/// IP address family of a packet session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    fn as_wire(self) -> u8 {
        match self {
            IpFamily::V4 => 4,
            IpFamily::V6 => 6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IpFamily::V4 => "IPv4",
            IpFamily::V6 => "IPv6",
        })
    }
}

/// Autoconnect behavior of the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AutoconnectSetting {
    Disabled = 0,
    Enabled = 1,
    Paused = 2,
}

/// Roaming constraint applied to autoconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AutoconnectRoamSetting {
    Always = 0,
    HomeOnly = 1,
}

/// Connection state carried by packet-service-status messages. Wire values
/// are 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    Disconnected = 1,
    Connected = 2,
    Suspended = 3,
    Authenticating = 4,
}

impl ConnectionStatus {
    fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            1 => ConnectionStatus::Disconnected,
            2 => ConnectionStatus::Connected,
            3 => ConnectionStatus::Suspended,
            4 => ConnectionStatus::Authenticating,
            _ => return None,
        })
    }
}

/// Human-readable label for a raw connection-status octet.
pub fn connection_status_label(value: u8) -> &'static str {
    match ConnectionStatus::from_wire(value) {
        Some(ConnectionStatus::Disconnected) => "DISCONNECTED",
        Some(ConnectionStatus::Connected) => "CONNECTED",
        Some(ConnectionStatus::Suspended) => "SUSPENDED",
        Some(ConnectionStatus::Authenticating) => "AUTHENTICATING",
        None => "INVALID",
    }
}

/// Address, gateway and prefix of an active session, tagged by family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeSettings {
    V4 {
        address: Ipv4Addr,
        gateway: Ipv4Addr,
        prefix_length: u8,
    },
    V6 {
        address: Ipv6Addr,
        gateway: Ipv6Addr,
        prefix_length: u8,
    },
}

/// Result of a successful session start. The modem may attach diagnostic
/// reason fields even when the call succeeds; they are surfaced so callers
/// can log them.
#[derive(Debug, Clone, Copy)]
pub struct StartOutcome {
    pub session_id: u32,
    pub failure_reason: Option<u16>,
    pub verbose_failure: Option<(u16, u16)>,
}

/// A decoded packet-service-status indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketServiceStatus {
    pub connection_status: u8,
    pub reconfiguration_required: bool,
    pub session_end_reason: Option<u16>,
    pub verbose_end: Option<(u16, u16)>,
}

impl PacketServiceStatus {
    /// Whether this indication reports a disconnect the host did not cause.
    ///
    /// A disconnect is attributable to the host when the modem reports the
    /// client-end reason, or the internal verbose reason the firmware uses
    /// for host-ended calls. Everything else is the network's doing and the
    /// session must be torn down and rebuilt.
    pub fn requires_teardown(&self) -> bool {
        if self.connection_status != ConnectionStatus::Disconnected as u8 {
            return false;
        }
        let host_ended = self.session_end_reason == Some(CALL_END_REASON_CLIENT)
            || self.verbose_end
                == Some((VERBOSE_END_TYPE_INTERNAL, VERBOSE_END_REASON_CLIENT));
        !host_ended
    }

    fn parse(tlvs: &Tlvs) -> Result<Self, QmiError> {
        let status = tlvs.require(TLV_CONNECTION_STATUS, "packet service status")?;
        if status.len() < 2 {
            return Err(QmiError::Malformed("short packet service status TLV"));
        }
        Ok(PacketServiceStatus {
            connection_status: status[0],
            reconfiguration_required: status[1] != 0,
            session_end_reason: tlvs.get_u16(TLV_CALL_END_REASON),
            verbose_end: tlvs.get(TLV_VERBOSE_CALL_END).and_then(|raw| {
                (raw.len() == 4).then(|| {
                    (
                        u16::from_le_bytes([raw[0], raw[1]]),
                        u16::from_le_bytes([raw[2], raw[3]]),
                    )
                })
            }),
        })
    }
}

/// Derive a prefix length from an IPv4 subnet mask by counting trailing
/// zero bits. For a non-contiguous mask the trailing-zero count is
/// authoritative.
pub fn v4_prefix_from_mask(mask: u32) -> u8 {
    (32 - mask.trailing_zeros()) as u8
}

struct SessionShared {
    session_id: AtomicU32,
    teardown_requested: AtomicBool,
}

/// A family-bound WDS session and its service attachment.
pub struct WdsSession {
    client: ServiceClient,
    family: IpFamily,
    profile_id: u32,
    last_runtime_settings: Option<RuntimeSettings>,
    shared: Arc<SessionShared>,
}

impl WdsSession {
    /// Attach a WDS client for `family` and register the packet-service
    /// indication callback against this session.
    pub fn attach(transport: &QmuxTransport, family: IpFamily) -> Result<Self, QmiError> {
        let shared = Arc::new(SessionShared {
            session_id: AtomicU32::new(0),
            teardown_requested: AtomicBool::new(false),
        });

        let handler_shared = shared.clone();
        let client = transport.attach(
            ServiceType::Wds,
            Some(Box::new(move |msg_id, payload| {
                handle_indication(&handler_shared, family, msg_id, payload);
            })),
        )?;

        Ok(WdsSession {
            client,
            family,
            profile_id: 0,
            last_runtime_settings: None,
            shared,
        })
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    pub fn client_id(&self) -> u8 {
        self.client.client_id()
    }

    /// Currently-held session id; zero means no session.
    pub fn session_id(&self) -> u32 {
        self.shared.session_id.load(Ordering::Acquire)
    }

    /// Whether the indication path has requested a teardown. Monotonic for
    /// the lifetime of the session.
    pub fn teardown_requested(&self) -> bool {
        self.shared.teardown_requested.load(Ordering::Acquire)
    }

    pub fn last_runtime_settings(&self) -> Option<RuntimeSettings> {
        self.last_runtime_settings
    }

    /// Read the firmware autoconnect policy. The roam constraint is an
    /// optional field on older firmware.
    pub fn get_autoconnect(
        &self,
    ) -> Result<(AutoconnectSetting, Option<AutoconnectRoamSetting>), QmiError> {
        let tlvs = self.client.request(WDS_GET_AUTOCONNECT, &[])?;
        let setting = match tlvs
            .get_u8(TLV_AUTOCONNECT_SETTING)
            .ok_or(QmiError::MissingField("autoconnect setting"))?
        {
            0 => AutoconnectSetting::Disabled,
            1 => AutoconnectSetting::Enabled,
            2 => AutoconnectSetting::Paused,
            _ => return Err(QmiError::Malformed("unknown autoconnect setting")),
        };
        let roam = match tlvs.get_u8(TLV_AUTOCONNECT_ROAM) {
            Some(0) => Some(AutoconnectRoamSetting::Always),
            Some(1) => Some(AutoconnectRoamSetting::HomeOnly),
            Some(_) => return Err(QmiError::Malformed("unknown autoconnect roam setting")),
            None => None,
        };
        Ok((setting, roam))
    }

    /// Write the autoconnect policy, skipping the write entirely when the
    /// firmware already reports the requested values.
    pub fn set_autoconnect(
        &self,
        setting: AutoconnectSetting,
        roam: AutoconnectRoamSetting,
    ) -> Result<(), QmiError> {
        let (current, current_roam) = self.get_autoconnect()?;
        if current == setting && current_roam == Some(roam) {
            debug!(?setting, ?roam, "autoconnect already configured");
            return Ok(());
        }

        let mut w = TlvWriter::new();
        w.put_u8(TLV_AUTOCONNECT_SETTING, setting as u8)
            .put_u8(TLV_AUTOCONNECT_ROAM, roam as u8);
        self.client.request(WDS_SET_AUTOCONNECT, w.finish())?;
        Ok(())
    }

    /// Bind the client to this session's address family before starting.
    pub fn set_ip_family_preference(&self) -> Result<(), QmiError> {
        let mut w = TlvWriter::new();
        w.put_u8(TLV_IP_FAMILY, self.family.as_wire());
        self.client.request(WDS_SET_IP_FAMILY, w.finish())?;
        Ok(())
    }

    /// Start a data session on the given 3GPP profile.
    ///
    /// The returned session id is required; a success response without one
    /// is a protocol violation. Diagnostic reason fields are returned even
    /// on success so the caller can log them.
    pub fn start_data_session(&mut self, profile: u32) -> Result<StartOutcome, QmiError> {
        self.profile_id = profile;
        self.shared.session_id.store(0, Ordering::Release);

        let mut w = TlvWriter::new();
        w.put_u8(TLV_PROFILE_INDEX_3GPP, profile as u8);
        let tlvs = self.client.request_raw(WDS_START_NETWORK, w.finish())?;

        let (result, error) = tlvs.result_words()?;
        let failure_reason = tlvs.get_u16(TLV_CALL_END_REASON);
        let verbose_failure = tlvs.get(TLV_VERBOSE_CALL_END).and_then(|raw| {
            (raw.len() == 4).then(|| {
                (
                    u16::from_le_bytes([raw[0], raw[1]]),
                    u16::from_le_bytes([raw[2], raw[3]]),
                )
            })
        });

        if result != 0 {
            return Err(QmiError::SessionRefused {
                error,
                reason: failure_reason,
                verbose: verbose_failure,
            });
        }

        let session_id = tlvs
            .get_u32(TLV_PKT_DATA_HANDLE)
            .ok_or(QmiError::MissingField("packet data handle"))?;
        self.shared.session_id.store(session_id, Ordering::Release);

        Ok(StartOutcome {
            session_id,
            failure_reason,
            verbose_failure,
        })
    }

    /// Stop the session identified by the stored session id. A "no effect"
    /// response means the session was already gone and counts as success.
    pub fn stop_data_session(&mut self) -> Result<(), QmiError> {
        let session_id = self.shared.session_id.load(Ordering::Acquire);
        let mut w = TlvWriter::new();
        w.put_u32(TLV_PKT_DATA_HANDLE, session_id);

        match self.client.request(WDS_STOP_NETWORK, w.finish()) {
            Ok(_) => {}
            Err(QmiError::NoEffect) => {
                debug!(session_id, "session already stopped");
            }
            Err(e) => return Err(e),
        }
        self.shared.session_id.store(0, Ordering::Release);
        Ok(())
    }

    /// Query the current connection status of the packet session.
    pub fn get_session_state(&self) -> Result<ConnectionStatus, QmiError> {
        let tlvs = self.client.request(WDS_GET_PKT_SRVC_STATUS, &[])?;
        let raw = tlvs
            .get_u8(TLV_CONNECTION_STATUS)
            .ok_or(QmiError::MissingField("connection status"))?;
        ConnectionStatus::from_wire(raw).ok_or(QmiError::Malformed("unknown connection status"))
    }

    /// Fetch the session's address, gateway and prefix. Only the address and
    /// gateway fields are requested; other-family fields in the response are
    /// ignored.
    pub fn get_runtime_settings(&mut self) -> Result<RuntimeSettings, QmiError> {
        let mut w = TlvWriter::new();
        w.put_u32(TLV_REQUESTED_SETTINGS, REQUESTED_ADDRESS_AND_GATEWAY);
        let tlvs = self.client.request(WDS_GET_CURRENT_SETTINGS, w.finish())?;

        let settings = match self.family {
            IpFamily::V4 => parse_v4_settings(&tlvs)?,
            IpFamily::V6 => parse_v6_settings(&tlvs)?,
        };
        self.last_runtime_settings = Some(settings);
        Ok(settings)
    }

    /// Unregister the indication callback and release the client id.
    pub fn detach(self, transport: &QmuxTransport) -> Result<(), QmiError> {
        transport.detach(self.client)
    }
}

fn parse_v4_settings(tlvs: &Tlvs) -> Result<RuntimeSettings, QmiError> {
    let address = tlvs
        .get_u32(TLV_IPV4_ADDRESS)
        .ok_or(QmiError::MissingField("IPv4 address"))?;
    let gateway = tlvs
        .get_u32(TLV_IPV4_GATEWAY)
        .ok_or(QmiError::MissingField("IPv4 gateway"))?;
    let mask = tlvs
        .get_u32(TLV_IPV4_SUBNET_MASK)
        .ok_or(QmiError::MissingField("IPv4 subnet mask"))?;

    let prefix_length = v4_prefix_from_mask(mask);
    if mask.count_ones() + mask.trailing_zeros() != 32 {
        warn!(
            mask = format_args!("{mask:#010x}"),
            prefix_length, "non-contiguous IPv4 subnet mask; using trailing-zero count"
        );
    }

    Ok(RuntimeSettings::V4 {
        address: Ipv4Addr::from(address),
        gateway: Ipv4Addr::from(gateway),
        prefix_length,
    })
}

fn parse_v6_settings(tlvs: &Tlvs) -> Result<RuntimeSettings, QmiError> {
    let addr_raw = tlvs.require(TLV_IPV6_ADDRESS, "IPv6 address")?;
    let gw_raw = tlvs.require(TLV_IPV6_GATEWAY, "IPv6 gateway")?;
    if addr_raw.len() != 17 || gw_raw.len() != 17 {
        return Err(QmiError::Malformed("IPv6 settings TLV has wrong length"));
    }

    let mut address = [0u8; 16];
    address.copy_from_slice(&addr_raw[..16]);
    let address_prefix = addr_raw[16];

    let mut gateway = [0u8; 16];
    gateway.copy_from_slice(&gw_raw[..16]);
    let gateway_prefix = gw_raw[16];

    // The prefix is reported on both the address and the gateway. The
    // address's value is authoritative when they disagree.
    if address_prefix != gateway_prefix {
        warn!(
            address_prefix,
            gateway_prefix, "IPv6 prefix length for address and gateway differ"
        );
    }

    Ok(RuntimeSettings::V6 {
        address: Ipv6Addr::from(address),
        gateway: Ipv6Addr::from(gateway),
        prefix_length: address_prefix,
    })
}

fn handle_indication(shared: &SessionShared, family: IpFamily, msg_id: u16, payload: &[u8]) {
    if msg_id != WDS_PKT_SRVC_STATUS_IND {
        debug!(%family, msg_id, "unhandled WDS indication");
        return;
    }

    let tlvs = match Tlvs::parse(payload) {
        Ok(tlvs) => tlvs,
        Err(e) => {
            warn!(%family, error = %e, "failed to parse packet service indication");
            return;
        }
    };
    let status = match PacketServiceStatus::parse(&tlvs) {
        Ok(status) => status,
        Err(e) => {
            warn!(%family, error = %e, "malformed packet service indication");
            return;
        }
    };

    let session_id = shared.session_id.load(Ordering::Acquire);
    info!(
        %family,
        session_id = format_args!("{session_id:#x}"),
        connection_status = connection_status_label(status.connection_status),
        reconfiguration_required = status.reconfiguration_required,
        session_end_reason = status.session_end_reason,
        verbose_end = ?status.verbose_end,
        "packet service indication"
    );

    // A disconnect for a session the host did not end itself: ask the main
    // thread to tear the stack down. The flag is this callback's only side
    // effect.
    if session_id != 0 && status.requires_teardown() {
        info!(%family, "requesting main thread to tear down the session");
        shared.teardown_requested.store(true, Ordering::Release);
    }
}
