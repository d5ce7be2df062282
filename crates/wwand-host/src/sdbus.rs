//! Minimal system-bus client for the service manager.
//!
//! The daemon needs exactly two RPCs, `StartUnit` and `StopUnit` on
//! `org.freedesktop.systemd1.Manager`, so this speaks just enough of the
//! D-Bus wire protocol to place a method call and read its reply:
//! `EXTERNAL` uid authentication, `Hello()`, then `(ss)` method calls.
//! Unrelated traffic (the bus's signals) is skipped while waiting for a
//! reply.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use tracing::{debug, info};

use crate::HostError;

const SYSTEM_BUS_SOCKET: &str = "/run/dbus/system_bus_socket";

const BUS_DESTINATION: &str = "org.freedesktop.DBus";
const BUS_PATH: &str = "/org/freedesktop/DBus";

const SYSTEMD_DESTINATION: &str = "org.freedesktop.systemd1";
const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
const SYSTEMD_MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";

/// Conflict-resolution mode passed with every unit operation.
const JOB_MODE: &str = "replace";

const MSG_TYPE_METHOD_CALL: u8 = 1;
const MSG_TYPE_METHOD_RETURN: u8 = 2;
const MSG_TYPE_ERROR: u8 = 3;

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SIGNATURE: u8 = 8;

/// Unit operation requested of the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitVerb {
    Start,
    Stop,
}

impl UnitVerb {
    fn member(self) -> &'static str {
        match self {
            UnitVerb::Start => "StartUnit",
            UnitVerb::Stop => "StopUnit",
        }
    }
}

/// A connection to the system bus, authenticated and registered.
pub struct SystemBus {
    stream: UnixStream,
    serial: u32,
}

impl SystemBus {
    /// Connect to the system bus socket, authenticate with the caller's
    /// uid, and say hello.
    pub fn open() -> Result<Self, HostError> {
        let stream = UnixStream::connect(SYSTEM_BUS_SOCKET)?;
        let mut bus = SystemBus { stream, serial: 0 };
        bus.authenticate()?;
        bus.hello()?;
        Ok(bus)
    }

    /// Ask the service manager to start or stop a unit, with "replace"
    /// conflict resolution.
    pub fn manage_unit(&mut self, verb: UnitVerb, unit: &str) -> Result<(), HostError> {
        let mut body = Vec::new();
        put_string(&mut body, unit);
        put_string(&mut body, JOB_MODE);

        self.call(
            SYSTEMD_DESTINATION,
            SYSTEMD_PATH,
            SYSTEMD_MANAGER_INTERFACE,
            verb.member(),
            Some("ss"),
            &body,
        )?;
        info!(unit, verb = verb.member(), "service manager request completed");
        Ok(())
    }

    fn authenticate(&mut self) -> Result<(), HostError> {
        let uid = unsafe { libc::geteuid() };
        let uid_hex: String = uid
            .to_string()
            .bytes()
            .map(|b| format!("{b:02x}"))
            .collect();

        self.stream.write_all(b"\0")?;
        self.stream
            .write_all(format!("AUTH EXTERNAL {uid_hex}\r\n").as_bytes())?;
        let line = self.read_line()?;
        if !line.starts_with("OK ") {
            return Err(HostError::Bus(format!("authentication rejected: {line}")));
        }
        self.stream.write_all(b"BEGIN\r\n")?;
        Ok(())
    }

    fn hello(&mut self) -> Result<(), HostError> {
        self.call(
            BUS_DESTINATION,
            BUS_PATH,
            BUS_DESTINATION,
            "Hello",
            None,
            &[],
        )?;
        Ok(())
    }

    fn call(
        &mut self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<(), HostError> {
        self.serial += 1;
        let serial = self.serial;
        let msg = build_method_call(serial, destination, path, interface, member, signature, body);
        self.stream.write_all(&msg)?;

        loop {
            let reply = self.read_message()?;
            let header = parse_header(&reply)?;
            if header.reply_serial != Some(serial) {
                debug!(msg_type = header.msg_type, "skipping unrelated bus message");
                continue;
            }
            return match header.msg_type {
                MSG_TYPE_METHOD_RETURN => Ok(()),
                MSG_TYPE_ERROR => Err(HostError::Bus(
                    header
                        .error_name
                        .unwrap_or_else(|| "unknown bus error".into()),
                )),
                other => Err(HostError::Bus(format!(
                    "unexpected reply message type {other}"
                ))),
            };
        }
    }

    fn read_line(&mut self) -> Result<String, HostError> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte)?;
            if byte[0] == b'\n' {
                break;
            }
            if byte[0] != b'\r' {
                line.push(byte[0]);
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    fn read_message(&mut self) -> Result<Vec<u8>, HostError> {
        let mut fixed = vec![0u8; 16];
        self.stream.read_exact(&mut fixed)?;
        if fixed[0] != b'l' {
            return Err(HostError::Bus("big-endian bus replies unsupported".into()));
        }
        let body_len = u32::from_le_bytes(fixed[4..8].try_into().unwrap()) as usize;
        let fields_len = u32::from_le_bytes(fixed[12..16].try_into().unwrap()) as usize;
        let rest_len = align8(fields_len) + body_len;

        let mut rest = vec![0u8; rest_len];
        self.stream.read_exact(&mut rest)?;
        fixed.extend_from_slice(&rest);
        Ok(fixed)
    }
}

// ─── Marshaling ─────────────────────────────────────────────────────────

fn align8(len: usize) -> usize {
    (len + 7) & !7
}

fn pad_to(buf: &mut Vec<u8>, alignment: usize) {
    while buf.len() % alignment != 0 {
        buf.push(0);
    }
}

/// Marshal a string: aligned u32 length, bytes, nul.
fn put_string(buf: &mut Vec<u8>, s: &str) {
    pad_to(buf, 4);
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Marshal one header field: `(byte code, variant value)`.
fn put_field(buf: &mut Vec<u8>, code: u8, type_char: u8, value: &str) {
    pad_to(buf, 8);
    buf.push(code);
    buf.push(1); // signature length
    buf.push(type_char);
    buf.push(0);
    if type_char == b'g' {
        buf.push(value.len() as u8);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
    } else {
        put_string(buf, value);
    }
}

fn build_method_call(
    serial: u32,
    destination: &str,
    path: &str,
    interface: &str,
    member: &str,
    signature: Option<&str>,
    body: &[u8],
) -> Vec<u8> {
    let mut fields = Vec::new();
    put_field(&mut fields, FIELD_PATH, b'o', path);
    put_field(&mut fields, FIELD_INTERFACE, b's', interface);
    put_field(&mut fields, FIELD_MEMBER, b's', member);
    put_field(&mut fields, FIELD_DESTINATION, b's', destination);
    if let Some(signature) = signature {
        put_field(&mut fields, FIELD_SIGNATURE, b'g', signature);
    }

    let mut msg = Vec::with_capacity(16 + fields.len() + 8 + body.len());
    msg.push(b'l');
    msg.push(MSG_TYPE_METHOD_CALL);
    msg.push(0); // flags
    msg.push(1); // protocol version
    msg.extend_from_slice(&(body.len() as u32).to_le_bytes());
    msg.extend_from_slice(&serial.to_le_bytes());
    msg.extend_from_slice(&(fields.len() as u32).to_le_bytes());
    msg.extend_from_slice(&fields);
    pad_to(&mut msg, 8);
    msg.extend_from_slice(body);
    msg
}

struct ParsedHeader {
    msg_type: u8,
    reply_serial: Option<u32>,
    error_name: Option<String>,
}

fn parse_header(msg: &[u8]) -> Result<ParsedHeader, HostError> {
    if msg.len() < 16 {
        return Err(HostError::Bus("short bus message".into()));
    }
    let msg_type = msg[1];
    let fields_len = u32::from_le_bytes(msg[12..16].try_into().unwrap()) as usize;
    if msg.len() < 16 + fields_len {
        return Err(HostError::Bus("truncated header fields".into()));
    }

    let mut reply_serial = None;
    let mut error_name = None;
    let fields = &msg[16..16 + fields_len];
    let mut pos = 0usize;

    while pos < fields.len() {
        pos = align8_offset(pos);
        if pos >= fields.len() {
            break;
        }
        let code = fields[pos];
        let sig_len = *fields
            .get(pos + 1)
            .ok_or_else(|| HostError::Bus("truncated field signature".into()))?
            as usize;
        let sig_start = pos + 2;
        let sig_end = sig_start + sig_len;
        let sig = fields
            .get(sig_start..sig_end)
            .ok_or_else(|| HostError::Bus("truncated field signature".into()))?;
        pos = sig_end + 1; // skip nul

        match sig {
            b"u" => {
                pos = align4_offset(pos);
                let raw = fields
                    .get(pos..pos + 4)
                    .ok_or_else(|| HostError::Bus("truncated u32 field".into()))?;
                let value = u32::from_le_bytes(raw.try_into().unwrap());
                if code == FIELD_REPLY_SERIAL {
                    reply_serial = Some(value);
                }
                pos += 4;
            }
            b"s" | b"o" => {
                pos = align4_offset(pos);
                let raw = fields
                    .get(pos..pos + 4)
                    .ok_or_else(|| HostError::Bus("truncated string field".into()))?;
                let len = u32::from_le_bytes(raw.try_into().unwrap()) as usize;
                let value = fields
                    .get(pos + 4..pos + 4 + len)
                    .ok_or_else(|| HostError::Bus("truncated string field".into()))?;
                if code == FIELD_ERROR_NAME {
                    error_name = Some(String::from_utf8_lossy(value).into_owned());
                }
                pos += 4 + len + 1;
            }
            b"g" => {
                let len = *fields
                    .get(pos)
                    .ok_or_else(|| HostError::Bus("truncated signature field".into()))?
                    as usize;
                pos += 1 + len + 1;
            }
            _ => {
                return Err(HostError::Bus(format!(
                    "unsupported header field signature {:?}",
                    String::from_utf8_lossy(sig)
                )))
            }
        }
    }

    Ok(ParsedHeader {
        msg_type,
        reply_serial,
        error_name,
    })
}

fn align4_offset(pos: usize) -> usize {
    (pos + 3) & !3
}

fn align8_offset(pos: usize) -> usize {
    (pos + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_call_prelude_is_well_formed() {
        let mut body = Vec::new();
        put_string(&mut body, "unbound.service");
        put_string(&mut body, "replace");
        let msg = build_method_call(
            7,
            SYSTEMD_DESTINATION,
            SYSTEMD_PATH,
            SYSTEMD_MANAGER_INTERFACE,
            "StartUnit",
            Some("ss"),
            &body,
        );

        assert_eq!(msg[0], b'l');
        assert_eq!(msg[1], MSG_TYPE_METHOD_CALL);
        assert_eq!(msg[3], 1);
        let body_len = u32::from_le_bytes(msg[4..8].try_into().unwrap()) as usize;
        assert_eq!(body_len, body.len());
        assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), 7);

        // Body starts 8-aligned after the header fields.
        let fields_len = u32::from_le_bytes(msg[12..16].try_into().unwrap()) as usize;
        let body_start = 16 + align8(fields_len);
        assert_eq!(&msg[body_start..], &body[..]);
    }

    #[test]
    fn strings_are_aligned_and_nul_terminated() {
        let mut buf = vec![0u8; 1];
        put_string(&mut buf, "ab");
        // 3 bytes padding to reach alignment 4, then length, bytes, nul.
        assert_eq!(&buf[4..8], &2u32.to_le_bytes());
        assert_eq!(&buf[8..10], b"ab");
        assert_eq!(buf[10], 0);
    }

    #[test]
    fn parse_header_round_trips_our_own_calls() {
        let msg = build_method_call(3, "dest", "/path", "iface", "Member", Some("ss"), &[]);
        let header = parse_header(&msg).unwrap();
        assert_eq!(header.msg_type, MSG_TYPE_METHOD_CALL);
        assert_eq!(header.reply_serial, None);
        assert_eq!(header.error_name, None);
    }

    #[test]
    fn parse_header_extracts_error_name_and_reply_serial() {
        // Hand-build an ERROR message replying to serial 9.
        let mut fields = Vec::new();
        put_field(&mut fields, FIELD_ERROR_NAME, b's', "org.freedesktop.DBus.Error.Failed");
        pad_to(&mut fields, 8);
        fields.push(FIELD_REPLY_SERIAL);
        fields.extend_from_slice(&[1, b'u', 0]);
        fields.extend_from_slice(&9u32.to_le_bytes());

        let mut msg = vec![b'l', MSG_TYPE_ERROR, 0, 1];
        msg.extend_from_slice(&0u32.to_le_bytes());
        msg.extend_from_slice(&1u32.to_le_bytes());
        msg.extend_from_slice(&(fields.len() as u32).to_le_bytes());
        msg.extend_from_slice(&fields);

        let header = parse_header(&msg).unwrap();
        assert_eq!(header.msg_type, MSG_TYPE_ERROR);
        assert_eq!(header.reply_serial, Some(9));
        assert_eq!(
            header.error_name.as_deref(),
            Some("org.freedesktop.DBus.Error.Failed")
        );
    }

    #[test]
    fn unit_verbs_map_to_manager_members() {
        assert_eq!(UnitVerb::Start.member(), "StartUnit");
        assert_eq!(UnitVerb::Stop.member(), "StopUnit");
    }
}
