//! Transport + service integration tests against a scripted modem.
//!
//! A socketpair stands in for the QMI character device: the crate under test
//! drives one end through `QmuxTransport::with_device`, a fake-modem thread
//! answers on the other using the same QMUX framing the firmware would.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use wwand_qmi::dms::{Dms, OperationMode};
use wwand_qmi::transport::QmuxTransport;
use wwand_qmi::wds::{
    AutoconnectRoamSetting, AutoconnectSetting, ConnectionStatus, IpFamily, RuntimeSettings,
    WdsSession,
};
use wwand_qmi::QmiError;

// ─── Fake modem ─────────────────────────────────────────────────────────

const SVC_CTL: u8 = 0x00;
const SVC_WDS: u8 = 0x01;
const SVC_DMS: u8 = 0x02;

const CTL_ALLOC: u16 = 0x0022;
const CTL_RELEASE: u16 = 0x0023;
const DMS_GET_MODEL: u16 = 0x0022;
const DMS_GET_MODE: u16 = 0x002D;
const DMS_SET_MODE: u16 = 0x002E;
const WDS_START: u16 = 0x0020;
const WDS_STOP: u16 = 0x0021;
const WDS_GET_STATUS: u16 = 0x0022;
const WDS_GET_SETTINGS: u16 = 0x002D;
const WDS_GET_AUTOCONNECT: u16 = 0x0034;
const WDS_SET_AUTOCONNECT: u16 = 0x0051;
const WDS_SET_IP_FAMILY: u16 = 0x004D;
const WDS_PKT_STATUS_IND: u16 = 0x0022;

const QMI_ERR_NO_EFFECT: u16 = 26;

#[derive(Default)]
struct ModemState {
    /// `(mode, hardware_controlled)` returned by Get Operating Mode.
    power: (u8, bool),
    set_mode_calls: u32,
    autoconnect: (u8, u8),
    set_autoconnect_calls: u32,
    /// When set, Start Network fails with `(error, reason, verbose)`.
    refuse_start: Option<(u16, Option<u16>, Option<(u16, u16)>)>,
    /// When set, Start Network succeeds but omits the packet data handle.
    omit_handle: bool,
    /// When set, Stop Network answers NO_EFFECT.
    stop_no_effect: bool,
    last_ip_family: u8,
    active_session: Option<u32>,
}

struct FakeModem {
    state: Arc<Mutex<ModemState>>,
    writer: Arc<Mutex<File>>,
    next_session: AtomicU32,
}

fn put_tlv(buf: &mut Vec<u8>, tlv_type: u8, value: &[u8]) {
    buf.push(tlv_type);
    buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
    buf.extend_from_slice(value);
}

fn result_tlv(buf: &mut Vec<u8>, result: u16, error: u16) {
    let mut raw = Vec::new();
    raw.extend_from_slice(&result.to_le_bytes());
    raw.extend_from_slice(&error.to_le_bytes());
    put_tlv(buf, 0x02, &raw);
}

fn frame(service: u8, client: u8, msg_ctl: u8, tx_id: u16, msg_id: u16, tlvs: &[u8]) -> Vec<u8> {
    let tx_len = if service == SVC_CTL { 1 } else { 2 };
    let sdu_len = 1 + tx_len + 2 + 2 + tlvs.len();
    let mut buf = Vec::new();
    buf.push(0x01);
    buf.extend_from_slice(&((5 + sdu_len) as u16).to_le_bytes());
    buf.push(0x80);
    buf.push(service);
    buf.push(client);
    buf.push(msg_ctl);
    if service == SVC_CTL {
        buf.push(tx_id as u8);
    } else {
        buf.extend_from_slice(&tx_id.to_le_bytes());
    }
    buf.extend_from_slice(&msg_id.to_le_bytes());
    buf.extend_from_slice(&(tlvs.len() as u16).to_le_bytes());
    buf.extend_from_slice(tlvs);
    buf
}

impl FakeModem {
    /// Spawn the fake modem; returns the device file for the transport side
    /// and the modem handle for scripting.
    fn spawn() -> (File, Arc<FakeModem>) {
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0, "socketpair");
        let transport_end = unsafe { File::from_raw_fd(fds[0]) };
        let modem_read = unsafe { File::from_raw_fd(fds[1]) };
        let modem_write = modem_read.try_clone().expect("clone modem fd");

        let modem = Arc::new(FakeModem {
            state: Arc::new(Mutex::new(ModemState {
                power: (OperationMode::Offline as u8, false),
                autoconnect: (1, 0), // enabled / always, so setters must write
                ..ModemState::default()
            })),
            writer: Arc::new(Mutex::new(modem_write)),
            next_session: AtomicU32::new(0xBEE0),
        });

        let worker = modem.clone();
        thread::spawn(move || worker.serve(modem_read));
        (transport_end, modem)
    }

    fn serve(&self, mut dev: File) {
        let mut pending = Vec::new();
        let mut buf = [0u8; 4096];
        let mut next_cid: u8 = 1;

        loop {
            let n = match dev.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            pending.extend_from_slice(&buf[..n]);

            while pending.len() >= 3 {
                let frame_len = u16::from_le_bytes([pending[1], pending[2]]) as usize + 1;
                if pending.len() < frame_len {
                    break;
                }
                let raw: Vec<u8> = pending.drain(..frame_len).collect();
                self.handle(&raw, &mut next_cid);
            }
        }
    }

    fn handle(&self, raw: &[u8], next_cid: &mut u8) {
        let service = raw[4];
        let client = raw[5];
        let (tx_id, rest) = if service == SVC_CTL {
            (u16::from(raw[7]), &raw[8..])
        } else {
            (u16::from_le_bytes([raw[7], raw[8]]), &raw[9..])
        };
        let msg_id = u16::from_le_bytes([rest[0], rest[1]]);
        let tlv_bytes = &rest[4..];

        let mut tlvs = Vec::new();
        match (service, msg_id) {
            (SVC_CTL, CTL_ALLOC) => {
                let requested = tlv_bytes[3];
                result_tlv(&mut tlvs, 0, 0);
                let cid = *next_cid;
                *next_cid += 1;
                put_tlv(&mut tlvs, 0x01, &[requested, cid]);
            }
            (SVC_CTL, CTL_RELEASE) => result_tlv(&mut tlvs, 0, 0),
            (SVC_DMS, DMS_GET_MODEL) => {
                result_tlv(&mut tlvs, 0, 0);
                put_tlv(&mut tlvs, 0x01, b"MDM9230");
            }
            (SVC_DMS, DMS_GET_MODE) => {
                let (mode, hw) = self.state.lock().unwrap().power;
                result_tlv(&mut tlvs, 0, 0);
                put_tlv(&mut tlvs, 0x01, &[mode]);
                put_tlv(&mut tlvs, 0x11, &[u8::from(hw)]);
            }
            (SVC_DMS, DMS_SET_MODE) => {
                let mut state = self.state.lock().unwrap();
                state.set_mode_calls += 1;
                state.power.0 = tlv_bytes[3];
                result_tlv(&mut tlvs, 0, 0);
            }
            (SVC_WDS, WDS_GET_AUTOCONNECT) => {
                let (setting, roam) = self.state.lock().unwrap().autoconnect;
                result_tlv(&mut tlvs, 0, 0);
                put_tlv(&mut tlvs, 0x01, &[setting]);
                put_tlv(&mut tlvs, 0x10, &[roam]);
            }
            (SVC_WDS, WDS_SET_AUTOCONNECT) => {
                let mut state = self.state.lock().unwrap();
                state.set_autoconnect_calls += 1;
                state.autoconnect = (tlv_bytes[3], tlv_bytes[7]);
                result_tlv(&mut tlvs, 0, 0);
            }
            (SVC_WDS, WDS_SET_IP_FAMILY) => {
                self.state.lock().unwrap().last_ip_family = tlv_bytes[3];
                result_tlv(&mut tlvs, 0, 0);
            }
            (SVC_WDS, WDS_START) => {
                let mut state = self.state.lock().unwrap();
                if let Some((error, reason, verbose)) = state.refuse_start {
                    result_tlv(&mut tlvs, 1, error);
                    if let Some(reason) = reason {
                        put_tlv(&mut tlvs, 0x10, &reason.to_le_bytes());
                    }
                    if let Some((vt, vr)) = verbose {
                        let mut raw = Vec::new();
                        raw.extend_from_slice(&vt.to_le_bytes());
                        raw.extend_from_slice(&vr.to_le_bytes());
                        put_tlv(&mut tlvs, 0x11, &raw);
                    }
                } else {
                    result_tlv(&mut tlvs, 0, 0);
                    if !state.omit_handle {
                        let sid = self.next_session.fetch_add(1, Ordering::Relaxed);
                        state.active_session = Some(sid);
                        put_tlv(&mut tlvs, 0x01, &sid.to_le_bytes());
                    }
                }
            }
            (SVC_WDS, WDS_GET_STATUS) => {
                let connected = self.state.lock().unwrap().active_session.is_some();
                result_tlv(&mut tlvs, 0, 0);
                put_tlv(&mut tlvs, 0x01, &[if connected { 2 } else { 1 }]);
            }
            (SVC_WDS, WDS_STOP) => {
                let mut state = self.state.lock().unwrap();
                if state.stop_no_effect || state.active_session.is_none() {
                    result_tlv(&mut tlvs, 1, QMI_ERR_NO_EFFECT);
                } else {
                    state.active_session = None;
                    result_tlv(&mut tlvs, 0, 0);
                }
            }
            (SVC_WDS, WDS_GET_SETTINGS) => {
                let family = self.state.lock().unwrap().last_ip_family;
                result_tlv(&mut tlvs, 0, 0);
                if family == 6 {
                    let mut addr = [0u8; 17];
                    addr[0] = 0x26;
                    addr[1] = 0x07;
                    addr[15] = 0x01;
                    addr[16] = 64;
                    let mut gw = addr;
                    gw[15] = 0x02;
                    gw[16] = 64;
                    put_tlv(&mut tlvs, 0x25, &addr);
                    put_tlv(&mut tlvs, 0x26, &gw);
                } else {
                    put_tlv(&mut tlvs, 0x1E, &0x0A2A_0002u32.to_le_bytes());
                    put_tlv(&mut tlvs, 0x20, &0x0A2A_0001u32.to_le_bytes());
                    put_tlv(&mut tlvs, 0x21, &0xFFFF_FF00u32.to_le_bytes());
                }
            }
            _ => result_tlv(&mut tlvs, 1, 0x0001),
        }

        let reply = frame(service, client, 0x02, tx_id, msg_id, &tlvs);
        self.writer.lock().unwrap().write_all(&reply).unwrap();
    }

    /// Inject a packet-service-status indication at the given WDS client.
    fn send_packet_status(
        &self,
        client: u8,
        connection_status: u8,
        end_reason: Option<u16>,
        verbose: Option<(u16, u16)>,
    ) {
        let mut tlvs = Vec::new();
        put_tlv(&mut tlvs, 0x01, &[connection_status, 0]);
        if let Some(reason) = end_reason {
            put_tlv(&mut tlvs, 0x10, &reason.to_le_bytes());
        }
        if let Some((vt, vr)) = verbose {
            let mut raw = Vec::new();
            raw.extend_from_slice(&vt.to_le_bytes());
            raw.extend_from_slice(&vr.to_le_bytes());
            put_tlv(&mut tlvs, 0x11, &raw);
        }
        let ind = frame(SVC_WDS, client, 0x04, 0, WDS_PKT_STATUS_IND, &tlvs);
        self.writer.lock().unwrap().write_all(&ind).unwrap();
    }
}

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[test]
fn attach_allocates_distinct_client_ids() {
    let (dev, _modem) = FakeModem::spawn();
    let transport = QmuxTransport::with_device(dev).unwrap();

    let a = WdsSession::attach(&transport, IpFamily::V6).unwrap();
    let b = WdsSession::attach(&transport, IpFamily::V4).unwrap();
    assert_ne!(a.client_id(), b.client_id());

    b.detach(&transport).unwrap();
    a.detach(&transport).unwrap();
}

#[test]
fn dms_attach_caches_model_and_reuses_it() {
    let (dev, _modem) = FakeModem::spawn();
    let transport = QmuxTransport::with_device(dev).unwrap();

    let dms = Dms::new();
    let att = dms.attach(&transport).unwrap();
    assert_eq!(dms.model_id().as_deref(), Some("MDM9230"));
    att.detach(&transport, false).unwrap();

    // Still cached after a detach that preserves it.
    assert_eq!(dms.model_id().as_deref(), Some("MDM9230"));

    let att = dms.attach(&transport).unwrap();
    att.detach(&transport, true).unwrap();
    assert_eq!(dms.model_id(), None);
}

#[test]
fn set_power_skips_write_when_hardware_controlled() {
    let (dev, modem) = FakeModem::spawn();
    let transport = QmuxTransport::with_device(dev).unwrap();
    modem.state.lock().unwrap().power = (OperationMode::LowPower as u8, true);

    let dms = Dms::new();
    let att = dms.attach(&transport).unwrap();
    let resulting = att.set_power(OperationMode::Online).unwrap();
    assert_eq!(resulting, OperationMode::LowPower);
    assert_eq!(modem.state.lock().unwrap().set_mode_calls, 0);
    att.detach(&transport, true).unwrap();
}

#[test]
fn set_power_writes_and_verifies_read_back() {
    let (dev, modem) = FakeModem::spawn();
    let transport = QmuxTransport::with_device(dev).unwrap();

    let dms = Dms::new();
    let att = dms.attach(&transport).unwrap();
    let resulting = att.set_power(OperationMode::Online).unwrap();
    assert_eq!(resulting, OperationMode::Online);
    assert_eq!(modem.state.lock().unwrap().set_mode_calls, 1);
    att.detach(&transport, true).unwrap();
}

#[test]
fn autoconnect_setter_skips_matching_state() {
    let (dev, modem) = FakeModem::spawn();
    let transport = QmuxTransport::with_device(dev).unwrap();
    modem.state.lock().unwrap().autoconnect = (0, 1); // disabled / home-only

    let wds = WdsSession::attach(&transport, IpFamily::V4).unwrap();
    wds.set_autoconnect(AutoconnectSetting::Disabled, AutoconnectRoamSetting::HomeOnly)
        .unwrap();
    assert_eq!(modem.state.lock().unwrap().set_autoconnect_calls, 0);

    wds.set_autoconnect(AutoconnectSetting::Enabled, AutoconnectRoamSetting::Always)
        .unwrap();
    assert_eq!(modem.state.lock().unwrap().set_autoconnect_calls, 1);
    wds.detach(&transport).unwrap();
}

#[test]
fn start_stop_session_and_tolerate_no_effect() {
    let (dev, modem) = FakeModem::spawn();
    let transport = QmuxTransport::with_device(dev).unwrap();

    let mut wds = WdsSession::attach(&transport, IpFamily::V4).unwrap();
    wds.set_ip_family_preference().unwrap();
    let outcome = wds.start_data_session(3).unwrap();
    assert_ne!(outcome.session_id, 0);
    assert_eq!(wds.session_id(), outcome.session_id);
    assert_eq!(wds.get_session_state().unwrap(), ConnectionStatus::Connected);

    wds.stop_data_session().unwrap();
    assert_eq!(wds.session_id(), 0);
    assert_eq!(
        wds.get_session_state().unwrap(),
        ConnectionStatus::Disconnected
    );

    // Stopping again: the modem answers NO_EFFECT, which is success here.
    modem.state.lock().unwrap().stop_no_effect = true;
    wds.stop_data_session().unwrap();
    wds.detach(&transport).unwrap();
}

#[test]
fn start_without_handle_is_a_protocol_violation() {
    let (dev, modem) = FakeModem::spawn();
    let transport = QmuxTransport::with_device(dev).unwrap();
    modem.state.lock().unwrap().omit_handle = true;

    let mut wds = WdsSession::attach(&transport, IpFamily::V4).unwrap();
    let err = wds.start_data_session(3).unwrap_err();
    assert!(matches!(err, QmiError::MissingField(_)), "{err:?}");
    wds.detach(&transport).unwrap();
}

#[test]
fn refused_start_surfaces_reason_fields() {
    let (dev, modem) = FakeModem::spawn();
    let transport = QmuxTransport::with_device(dev).unwrap();
    modem.state.lock().unwrap().refuse_start = Some((14, Some(3), Some((2, 201))));

    let mut wds = WdsSession::attach(&transport, IpFamily::V4).unwrap();
    match wds.start_data_session(3).unwrap_err() {
        QmiError::SessionRefused {
            error,
            reason,
            verbose,
        } => {
            assert_eq!(error, 14);
            assert_eq!(reason, Some(3));
            assert_eq!(verbose, Some((2, 201)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    wds.detach(&transport).unwrap();
}

#[test]
fn runtime_settings_parse_per_family() {
    let (dev, _modem) = FakeModem::spawn();
    let transport = QmuxTransport::with_device(dev).unwrap();

    let mut v4 = WdsSession::attach(&transport, IpFamily::V4).unwrap();
    v4.set_ip_family_preference().unwrap();
    match v4.get_runtime_settings().unwrap() {
        RuntimeSettings::V4 {
            address,
            gateway,
            prefix_length,
        } => {
            assert_eq!(address.octets(), [10, 42, 0, 2]);
            assert_eq!(gateway.octets(), [10, 42, 0, 1]);
            assert_eq!(prefix_length, 24);
        }
        other => panic!("wrong family: {other:?}"),
    }
    assert!(v4.last_runtime_settings().is_some());
    v4.detach(&transport).unwrap();

    let mut v6 = WdsSession::attach(&transport, IpFamily::V6).unwrap();
    v6.set_ip_family_preference().unwrap();
    match v6.get_runtime_settings().unwrap() {
        RuntimeSettings::V6 { prefix_length, .. } => assert_eq!(prefix_length, 64),
        other => panic!("wrong family: {other:?}"),
    }
    v6.detach(&transport).unwrap();
}

#[test]
fn network_disconnect_indication_sets_teardown_flag() {
    let (dev, modem) = FakeModem::spawn();
    let transport = QmuxTransport::with_device(dev).unwrap();

    let mut wds = WdsSession::attach(&transport, IpFamily::V4).unwrap();
    wds.start_data_session(3).unwrap();
    assert!(!wds.teardown_requested());

    modem.send_packet_status(wds.client_id(), 1, Some(7), None);
    wait_for("teardown flag", || wds.teardown_requested());

    wds.stop_data_session().unwrap();
    wds.detach(&transport).unwrap();
}

#[test]
fn host_ended_disconnect_indication_is_suppressed() {
    let (dev, modem) = FakeModem::spawn();
    let transport = QmuxTransport::with_device(dev).unwrap();

    let mut wds = WdsSession::attach(&transport, IpFamily::V4).unwrap();
    wds.start_data_session(3).unwrap();

    modem.send_packet_status(wds.client_id(), 1, Some(2), None);
    modem.send_packet_status(wds.client_id(), 1, None, Some((3, 2000)));

    // Give the reader thread ample time to process both indications.
    thread::sleep(Duration::from_millis(100));
    assert!(!wds.teardown_requested());

    wds.stop_data_session().unwrap();
    wds.detach(&transport).unwrap();
}

#[test]
fn indication_without_session_never_tears_down() {
    let (dev, modem) = FakeModem::spawn();
    let transport = QmuxTransport::with_device(dev).unwrap();

    let wds = WdsSession::attach(&transport, IpFamily::V4).unwrap();
    modem.send_packet_status(wds.client_id(), 1, Some(7), None);
    thread::sleep(Duration::from_millis(100));
    assert!(!wds.teardown_requested());
    wds.detach(&transport).unwrap();
}
