//! rtnetlink message construction and parsing.
//!
//! Netlink is a host-endian binary protocol; every multi-byte field below
//! uses native byte order and every payload is padded to a four-byte
//! boundary. Only the message types this daemon issues are modeled.

use crate::HostError;

// Message types.
pub const NLMSG_ERROR: u16 = 0x2;
pub const NLMSG_DONE: u16 = 0x3;
pub const RTM_NEWLINK: u16 = 16;
pub const RTM_GETLINK: u16 = 18;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;
pub const RTM_GETADDR: u16 = 22;
pub const RTM_NEWROUTE: u16 = 24;

// Header flags.
pub const NLM_F_REQUEST: u16 = 0x0001;
pub const NLM_F_MULTI: u16 = 0x0002;
pub const NLM_F_ACK: u16 = 0x0004;
pub const NLM_F_ROOT: u16 = 0x0100;
pub const NLM_F_MATCH: u16 = 0x0200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;
pub const NLM_F_REPLACE: u16 = 0x0100;
pub const NLM_F_EXCL: u16 = 0x0200;
pub const NLM_F_CREATE: u16 = 0x0400;

// Attribute types.
pub const IFLA_IFNAME: u16 = 3;
pub const IFA_ADDRESS: u16 = 1;
pub const IFA_LOCAL: u16 = 2;
pub const RTA_DST: u16 = 1;
pub const RTA_OIF: u16 = 4;
pub const RTA_GATEWAY: u16 = 5;
pub const RTA_PREFSRC: u16 = 7;

// Route header constants.
pub const RT_TABLE_MAIN: u8 = 254;
pub const RTPROT_STATIC: u8 = 4;
pub const RT_SCOPE_UNIVERSE: u8 = 0;
pub const RT_SCOPE_LINK: u8 = 253;
pub const RTN_UNICAST: u8 = 1;

pub const NLMSG_HDRLEN: usize = 16;
pub const IFINFOMSG_LEN: usize = 16;
pub const IFADDRMSG_LEN: usize = 8;
pub const RTMSG_LEN: usize = 12;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

// ─── Building ───────────────────────────────────────────────────────────

/// Incremental builder for one netlink message. The length field in the
/// header is patched by [`MessageBuilder::finish`].
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(msg_type: u16, flags: u16, seq: u32) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // patched in finish()
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // pid: kernel fills ours
        MessageBuilder { buf }
    }

    pub fn put_ifinfomsg(mut self, family: u8, index: i32, flags: u32, change: u32) -> Self {
        self.buf.push(family);
        self.buf.push(0);
        self.buf.extend_from_slice(&0u16.to_ne_bytes()); // ifi_type
        self.buf.extend_from_slice(&index.to_ne_bytes());
        self.buf.extend_from_slice(&flags.to_ne_bytes());
        self.buf.extend_from_slice(&change.to_ne_bytes());
        self
    }

    pub fn put_ifaddrmsg(mut self, family: u8, prefixlen: u8, scope: u8, index: u32) -> Self {
        self.buf.push(family);
        self.buf.push(prefixlen);
        self.buf.push(0); // ifa_flags
        self.buf.push(scope);
        self.buf.extend_from_slice(&index.to_ne_bytes());
        self
    }

    pub fn put_rtmsg(
        mut self,
        family: u8,
        dst_len: u8,
        table: u8,
        protocol: u8,
        scope: u8,
        rtype: u8,
    ) -> Self {
        self.buf.push(family);
        self.buf.push(dst_len);
        self.buf.push(0); // rtm_src_len
        self.buf.push(0); // rtm_tos
        self.buf.push(table);
        self.buf.push(protocol);
        self.buf.push(scope);
        self.buf.push(rtype);
        self.buf.extend_from_slice(&0u32.to_ne_bytes()); // rtm_flags
        self
    }

    pub fn put_attr(mut self, attr_type: u16, payload: &[u8]) -> Self {
        let attr_len = 4 + payload.len();
        self.buf.extend_from_slice(&(attr_len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(align4(self.buf.len()), 0);
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

// ─── Parsing ────────────────────────────────────────────────────────────

/// One message cut out of a receive buffer.
pub struct NlMessage<'a> {
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub payload: &'a [u8],
}

/// Split a receive buffer into its netlink messages.
pub fn parse_messages(mut buf: &[u8]) -> Result<Vec<NlMessage<'_>>, HostError> {
    let mut messages = Vec::new();
    while !buf.is_empty() {
        if buf.len() < NLMSG_HDRLEN {
            return Err(HostError::Malformed("truncated netlink header"));
        }
        let len = u32::from_ne_bytes(buf[0..4].try_into().unwrap()) as usize;
        if len < NLMSG_HDRLEN || len > buf.len() {
            return Err(HostError::Malformed("bad netlink message length"));
        }
        messages.push(NlMessage {
            msg_type: u16::from_ne_bytes(buf[4..6].try_into().unwrap()),
            flags: u16::from_ne_bytes(buf[6..8].try_into().unwrap()),
            seq: u32::from_ne_bytes(buf[8..12].try_into().unwrap()),
            payload: &buf[NLMSG_HDRLEN..len],
        });
        buf = &buf[align4(len)..];
    }
    Ok(messages)
}

/// The errno carried by an `NLMSG_ERROR` message; zero is an ack.
pub fn parse_error_code(payload: &[u8]) -> Result<i32, HostError> {
    if payload.len() < 4 {
        return Err(HostError::Malformed("short NLMSG_ERROR payload"));
    }
    Ok(i32::from_ne_bytes(payload[0..4].try_into().unwrap()))
}

pub struct Attr<'a> {
    pub attr_type: u16,
    pub payload: &'a [u8],
}

/// Iterate the attributes that follow a fixed-size ancillary header.
pub fn parse_attrs(mut buf: &[u8]) -> Result<Vec<Attr<'_>>, HostError> {
    let mut attrs = Vec::new();
    while buf.len() >= 4 {
        let len = u16::from_ne_bytes(buf[0..2].try_into().unwrap()) as usize;
        if len < 4 || len > buf.len() {
            return Err(HostError::Malformed("bad attribute length"));
        }
        attrs.push(Attr {
            attr_type: u16::from_ne_bytes(buf[2..4].try_into().unwrap()),
            payload: &buf[4..len],
        });
        buf = &buf[align4(len).min(buf.len())..];
    }
    Ok(attrs)
}

/// Parsed `RTM_NEWLINK` payload.
pub struct LinkRecord {
    pub index: i32,
    pub flags: u32,
    pub name: Option<String>,
}

pub fn parse_link(payload: &[u8]) -> Result<LinkRecord, HostError> {
    if payload.len() < IFINFOMSG_LEN {
        return Err(HostError::Malformed("short ifinfomsg"));
    }
    let index = i32::from_ne_bytes(payload[4..8].try_into().unwrap());
    let flags = u32::from_ne_bytes(payload[8..12].try_into().unwrap());
    let mut name = None;
    for attr in parse_attrs(&payload[IFINFOMSG_LEN..])? {
        if attr.attr_type == IFLA_IFNAME {
            let raw = attr.payload.split(|b| *b == 0).next().unwrap_or(&[]);
            name = Some(String::from_utf8_lossy(raw).into_owned());
        }
    }
    Ok(LinkRecord { index, flags, name })
}

/// Parsed `RTM_NEWADDR` payload.
pub struct AddrRecord {
    pub family: u8,
    pub prefix_len: u8,
    pub scope: u8,
    pub index: i32,
    pub address: Option<std::net::IpAddr>,
}

pub fn parse_addr(payload: &[u8]) -> Result<AddrRecord, HostError> {
    if payload.len() < IFADDRMSG_LEN {
        return Err(HostError::Malformed("short ifaddrmsg"));
    }
    let family = payload[0];
    let prefix_len = payload[1];
    let scope = payload[3];
    let index = u32::from_ne_bytes(payload[4..8].try_into().unwrap()) as i32;

    // IFA_LOCAL is the interface address for IPv4; IPv6 carries it in
    // IFA_ADDRESS only.
    let mut local = None;
    let mut addr = None;
    for attr in parse_attrs(&payload[IFADDRMSG_LEN..])? {
        let parsed = match (attr.attr_type, attr.payload.len()) {
            (IFA_LOCAL | IFA_ADDRESS, 4) => {
                let octets: [u8; 4] = attr.payload.try_into().unwrap();
                Some(std::net::IpAddr::from(octets))
            }
            (IFA_LOCAL | IFA_ADDRESS, 16) => {
                let octets: [u8; 16] = attr.payload.try_into().unwrap();
                Some(std::net::IpAddr::from(octets))
            }
            _ => None,
        };
        match attr.attr_type {
            IFA_LOCAL => local = parsed,
            IFA_ADDRESS if addr.is_none() => addr = parsed,
            _ => {}
        }
    }

    Ok(AddrRecord {
        family,
        prefix_len,
        scope,
        index,
        address: local.or(addr),
    })
}
