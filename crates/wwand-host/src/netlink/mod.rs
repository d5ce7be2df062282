//! Host network management over rtnetlink.
//!
//! [`HostNetwork`] owns a route socket plus per-family link caches and an
//! address cache for the two links this daemon manages: the modem's
//! host-side interface and the WireGuard tunnel. Both must exist at
//! startup. All operations are idempotent and addressed by those two link
//! names; callers never pass interface indices around.
//!
//! The kernel is the source of truth: caches are refreshed by explicit
//! reloads, and every change request asks for an ack and fails loudly on a
//! kernel error.

mod message;
mod socket;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::{debug, info, warn};

use crate::HostError;
use message::{
    parse_addr, parse_error_code, parse_link, parse_messages, MessageBuilder, IFA_ADDRESS,
    IFA_LOCAL, NLMSG_DONE, NLMSG_ERROR, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL,
    NLM_F_REPLACE, NLM_F_REQUEST, RTA_DST, RTA_GATEWAY, RTA_OIF, RTA_PREFSRC, RTM_DELADDR,
    RTM_GETADDR, RTM_GETLINK, RTM_NEWADDR, RTM_NEWLINK, RTM_NEWROUTE, RTN_UNICAST,
    RTPROT_STATIC, RT_SCOPE_LINK, RT_SCOPE_UNIVERSE, RT_TABLE_MAIN,
};
use socket::RouteSocket;

/// The modem's host-side network interface.
pub const WWAN_LINK_NAME: &str = "mhi_hwip0";
/// The WireGuard tunnel interface.
pub const TUNNEL_LINK_NAME: &str = "wg0";

/// Tunnel-side gateway, reached over the tunnel link.
pub const TUNNEL_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 10, 1, 1);
/// Our own address inside the tunnel.
pub const TUNNEL_SELF: Ipv4Addr = Ipv4Addr::new(10, 10, 1, 2);
/// Static service target routed through the tunnel.
pub const TUNNEL_SERVICE_TARGET: (Ipv4Addr, u8) = (Ipv4Addr::new(10, 10, 2, 2), 32);
/// Operations network routed through the tunnel.
pub const TUNNEL_OPS_NETWORK: (Ipv4Addr, u8) = (Ipv4Addr::new(10, 10, 3, 0), 24);

/// Upper bound on addresses enumerated from one interface. More than this
/// on a point-to-point wwan link means something else is fighting us for
/// the interface.
pub const MAX_TRACKED_ADDRS: usize = 126;

const IFF_UP: u32 = libc::IFF_UP as u32;

#[derive(Debug, Clone, Copy)]
struct LinkEntry {
    index: i32,
    flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedAddress {
    family: u8,
    prefix_len: u8,
    scope: u8,
    ifindex: i32,
    address: IpAddr,
}

/// Handle over the host's routing state.
impl std::fmt::Debug for HostNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostNetwork").finish_non_exhaustive()
    }
}

pub struct HostNetwork {
    sock: Box<dyn RouteSocket>,
    seq: u32,
    links_v4: HashMap<String, LinkEntry>,
    links_v6: HashMap<String, LinkEntry>,
    addresses: Vec<CachedAddress>,
    wwan_index: i32,
    tunnel_index: i32,
}

impl HostNetwork {
    /// Open a route socket and materialize the link and address caches.
    /// Fails if either managed link is missing or the wwan link's index
    /// differs between the address families.
    pub fn new() -> Result<Self, HostError> {
        Self::with_socket(Box::new(socket::NetlinkSocket::open()?))
    }

    fn with_socket(sock: Box<dyn RouteSocket>) -> Result<Self, HostError> {
        let mut hn = HostNetwork {
            sock,
            seq: 1,
            links_v4: HashMap::new(),
            links_v6: HashMap::new(),
            addresses: Vec::new(),
            wwan_index: 0,
            tunnel_index: 0,
        };
        hn.reload_link_cache()?;
        hn.reload_address_cache()?;
        Ok(hn)
    }

    pub fn wwan_ifindex(&self) -> i32 {
        self.wwan_index
    }

    pub fn tunnel_ifindex(&self) -> i32 {
        self.tunnel_index
    }

    // ─── Caches ─────────────────────────────────────────────────────────

    /// Refresh both link caches, re-resolve the managed links by name and
    /// re-pin the cached interface indices.
    pub fn reload_link_cache(&mut self) -> Result<(), HostError> {
        self.links_v4 = self.dump_links(libc::AF_INET as u8)?;
        self.links_v6 = self.dump_links(libc::AF_INET6 as u8)?;

        let wwan_v4 = self
            .links_v4
            .get(WWAN_LINK_NAME)
            .ok_or(HostError::LinkMissing(WWAN_LINK_NAME))?;
        let wwan_v6 = self
            .links_v6
            .get(WWAN_LINK_NAME)
            .ok_or(HostError::LinkMissing(WWAN_LINK_NAME))?;
        if wwan_v4.index != wwan_v6.index {
            return Err(HostError::IfindexMismatch {
                v4: wwan_v4.index,
                v6: wwan_v6.index,
            });
        }
        let tunnel = self
            .links_v4
            .get(TUNNEL_LINK_NAME)
            .ok_or(HostError::LinkMissing(TUNNEL_LINK_NAME))?;

        self.wwan_index = wwan_v4.index;
        self.tunnel_index = tunnel.index;
        debug!(
            wwan_ifindex = self.wwan_index,
            tunnel_ifindex = self.tunnel_index,
            "link cache reloaded"
        );
        Ok(())
    }

    /// Refresh the address cache for both families.
    pub fn reload_address_cache(&mut self) -> Result<(), HostError> {
        let payloads = self.dump(RTM_GETADDR, DumpKind::Addresses)?;
        let mut addresses = Vec::new();
        for payload in &payloads {
            let record = parse_addr(payload)?;
            if let Some(address) = record.address {
                addresses.push(CachedAddress {
                    family: record.family,
                    prefix_len: record.prefix_len,
                    scope: record.scope,
                    ifindex: record.index,
                    address,
                });
            }
        }
        self.addresses = addresses;
        Ok(())
    }

    // ─── Link state ─────────────────────────────────────────────────────

    /// Bring the wwan link up or down. No-op when the cached state already
    /// matches.
    pub fn ensure_wwan_state(&mut self, up: bool) -> Result<(), HostError> {
        self.ensure_link_state(WWAN_LINK_NAME, up)
    }

    /// Bring the tunnel link up or down. No-op when the cached state
    /// already matches.
    pub fn ensure_tunnel_state(&mut self, up: bool) -> Result<(), HostError> {
        self.ensure_link_state(TUNNEL_LINK_NAME, up)
    }

    fn ensure_link_state(&mut self, name: &'static str, up: bool) -> Result<(), HostError> {
        let entry = *self
            .links_v4
            .get(name)
            .ok_or(HostError::LinkMissing(name))?;
        let is_up = entry.flags & IFF_UP != 0;
        if is_up == up {
            return Ok(());
        }

        // A change request touching only the IFF_UP bit.
        let msg = MessageBuilder::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, self.next_seq())
            .put_ifinfomsg(
                libc::AF_UNSPEC as u8,
                entry.index,
                if up { IFF_UP } else { 0 },
                IFF_UP,
            )
            .finish();
        self.transact(msg, "link change")?;

        let new_flags = if up {
            entry.flags | IFF_UP
        } else {
            entry.flags & !IFF_UP
        };
        self.links_v4
            .insert(name.to_string(), LinkEntry { flags: new_flags, ..entry });
        info!(link = name, up, "interface state changed");
        Ok(())
    }

    // ─── Addresses ──────────────────────────────────────────────────────

    /// Install an IPv4 address on the wwan link.
    pub fn add_v4_address(&mut self, address: Ipv4Addr, prefix_len: u8) -> Result<(), HostError> {
        let msg = MessageBuilder::new(
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            self.next_seq(),
        )
        .put_ifaddrmsg(
            libc::AF_INET as u8,
            prefix_len,
            RT_SCOPE_UNIVERSE,
            self.wwan_index as u32,
        )
        .put_attr(IFA_LOCAL, &address.octets())
        .put_attr(IFA_ADDRESS, &address.octets())
        .finish();
        self.transact(msg, "add v4 address")
    }

    /// Install an IPv6 address on the wwan link.
    pub fn add_v6_address(&mut self, address: Ipv6Addr, prefix_len: u8) -> Result<(), HostError> {
        let msg = MessageBuilder::new(
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            self.next_seq(),
        )
        .put_ifaddrmsg(
            libc::AF_INET6 as u8,
            prefix_len,
            RT_SCOPE_UNIVERSE,
            self.wwan_index as u32,
        )
        .put_attr(IFA_ADDRESS, &address.octets())
        .finish();
        self.transact(msg, "add v6 address")
    }

    fn delete_address(&mut self, addr: &CachedAddress) -> Result<(), HostError> {
        let seq = self.next_seq();
        let builder = MessageBuilder::new(RTM_DELADDR, NLM_F_REQUEST | NLM_F_ACK, seq)
            .put_ifaddrmsg(addr.family, addr.prefix_len, addr.scope, addr.ifindex as u32);
        let msg = match addr.address {
            IpAddr::V4(v4) => builder
                .put_attr(IFA_LOCAL, &v4.octets())
                .put_attr(IFA_ADDRESS, &v4.octets()),
            IpAddr::V6(v6) => builder.put_attr(IFA_ADDRESS, &v6.octets()),
        }
        .finish();
        self.transact(msg, "delete address")
    }

    /// Non-link-scope addresses currently cached for the wwan interface,
    /// optionally restricted to one family.
    fn collect_wwan_addresses(&self, family: Option<u8>) -> Result<Vec<CachedAddress>, HostError> {
        let collected: Vec<CachedAddress> = self
            .addresses
            .iter()
            .filter(|a| a.ifindex == self.wwan_index && a.scope != RT_SCOPE_LINK)
            .filter(|a| family.is_none_or(|f| a.family == f))
            .copied()
            .collect();
        if collected.len() > MAX_TRACKED_ADDRS {
            return Err(HostError::AddressOverflow {
                count: collected.len(),
            });
        }
        Ok(collected)
    }

    /// Remove every non-link-scope address, both families, from the wwan
    /// interface.
    pub fn flush_addresses(&mut self) -> Result<(), HostError> {
        self.reload_address_cache()?;
        let doomed = self.collect_wwan_addresses(None)?;

        let mut status = Ok(());
        for addr in &doomed {
            if let Err(e) = self.delete_address(addr) {
                warn!(address = %addr.address, error = %e, "failed to delete address");
                status = Err(e);
            }
        }
        status
    }

    /// Reconcile the wwan interface's IPv4 configuration: exactly
    /// `address/prefix_len` present, default route via `gateway`.
    pub fn ensure_v4_configuration(
        &mut self,
        address: Ipv4Addr,
        prefix_len: u8,
        gateway: Ipv4Addr,
    ) -> Result<(), HostError> {
        self.reload_address_cache()?;
        let existing = self.collect_wwan_addresses(Some(libc::AF_INET as u8))?;

        // A stale address that refuses to die must not block the add or the
        // default route; remember the failure and keep converging.
        let target = IpAddr::V4(address);
        let mut found = false;
        let mut status = Ok(());
        for addr in &existing {
            if addr.address == target && addr.prefix_len == prefix_len {
                found = true;
                continue;
            }
            if let Err(e) = self.delete_address(addr) {
                warn!(address = %addr.address, error = %e, "failed to delete address");
                status = Err(e);
            }
        }

        if !found {
            if let Err(e) = self.add_v4_address(address, prefix_len) {
                status = Err(e);
            }
        }
        if let Err(e) = self.change_v4_default_gateway(address, gateway) {
            status = Err(e);
        }
        status
    }

    // ─── Routes ─────────────────────────────────────────────────────────

    /// Create or replace the IPv4 default route through `gateway` on the
    /// wwan link, with `source` as the preferred source address.
    pub fn change_v4_default_gateway(
        &mut self,
        source: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Result<(), HostError> {
        let msg = self
            .default_route_builder(libc::AF_INET as u8)
            .put_attr(RTA_GATEWAY, &gateway.octets())
            .put_attr(RTA_PREFSRC, &source.octets())
            .put_attr(RTA_OIF, &(self.wwan_index as u32).to_ne_bytes())
            .finish();
        self.transact(msg, "replace v4 default route")
    }

    /// Create or replace the IPv6 default route through `gateway` on the
    /// wwan link, with `source` as the preferred source address.
    pub fn change_v6_default_gateway(
        &mut self,
        source: Ipv6Addr,
        gateway: Ipv6Addr,
    ) -> Result<(), HostError> {
        let msg = self
            .default_route_builder(libc::AF_INET6 as u8)
            .put_attr(RTA_GATEWAY, &gateway.octets())
            .put_attr(RTA_PREFSRC, &source.octets())
            .put_attr(RTA_OIF, &(self.wwan_index as u32).to_ne_bytes())
            .finish();
        self.transact(msg, "replace v6 default route")
    }

    fn default_route_builder(&mut self, family: u8) -> MessageBuilder {
        MessageBuilder::new(
            RTM_NEWROUTE,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
            self.next_seq(),
        )
        .put_rtmsg(
            family,
            0,
            RT_TABLE_MAIN,
            RTPROT_STATIC,
            RT_SCOPE_UNIVERSE,
            RTN_UNICAST,
        )
    }

    /// Install the two static tunnel routes: the service target and the
    /// operations network, both via the tunnel gateway with our tunnel
    /// address as the preferred source.
    pub fn ensure_tunnel_routes(&mut self) -> Result<(), HostError> {
        for (destination, prefix_len) in [TUNNEL_SERVICE_TARGET, TUNNEL_OPS_NETWORK] {
            let msg = MessageBuilder::new(
                RTM_NEWROUTE,
                NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
                self.next_seq(),
            )
            .put_rtmsg(
                libc::AF_INET as u8,
                prefix_len,
                RT_TABLE_MAIN,
                RTPROT_STATIC,
                RT_SCOPE_UNIVERSE,
                RTN_UNICAST,
            )
            .put_attr(RTA_DST, &destination.octets())
            .put_attr(RTA_GATEWAY, &TUNNEL_GATEWAY.octets())
            .put_attr(RTA_PREFSRC, &TUNNEL_SELF.octets())
            .put_attr(RTA_OIF, &(self.tunnel_index as u32).to_ne_bytes())
            .finish();
            self.transact(msg, "install tunnel route")?;
        }
        Ok(())
    }

    // ─── Wire plumbing ──────────────────────────────────────────────────

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1).max(1);
        self.seq
    }

    /// Submit a change request and wait for its ack.
    fn transact(&mut self, msg: Vec<u8>, context: &'static str) -> Result<(), HostError> {
        self.sock.send(&msg)?;
        loop {
            let buf = self.sock.recv()?;
            for parsed in parse_messages(&buf)? {
                if parsed.msg_type == NLMSG_ERROR {
                    let code = parse_error_code(parsed.payload)?;
                    if code == 0 {
                        return Ok(());
                    }
                    return Err(HostError::Netlink {
                        context,
                        code: -code,
                    });
                }
            }
        }
    }

    fn dump_links(&mut self, family: u8) -> Result<HashMap<String, LinkEntry>, HostError> {
        let payloads = self.dump(RTM_GETLINK, DumpKind::Links(family))?;
        let mut links = HashMap::new();
        for payload in &payloads {
            let record = parse_link(payload)?;
            if let Some(name) = record.name {
                links.insert(
                    name,
                    LinkEntry {
                        index: record.index,
                        flags: record.flags,
                    },
                );
            }
        }
        Ok(links)
    }

    fn dump(&mut self, msg_type: u16, kind: DumpKind) -> Result<Vec<Vec<u8>>, HostError> {
        let seq = self.next_seq();
        let builder = MessageBuilder::new(msg_type, NLM_F_REQUEST | NLM_F_DUMP, seq);
        let msg = match kind {
            DumpKind::Links(family) => builder.put_ifinfomsg(family, 0, 0, 0),
            DumpKind::Addresses => {
                builder.put_ifaddrmsg(libc::AF_UNSPEC as u8, 0, 0, 0)
            }
        }
        .finish();
        self.sock.send(&msg)?;

        let reply_type = match msg_type {
            RTM_GETLINK => RTM_NEWLINK,
            RTM_GETADDR => RTM_NEWADDR,
            _ => return Err(HostError::Malformed("unsupported dump type")),
        };

        let mut payloads = Vec::new();
        loop {
            let buf = self.sock.recv()?;
            for parsed in parse_messages(&buf)? {
                match parsed.msg_type {
                    NLMSG_DONE => return Ok(payloads),
                    NLMSG_ERROR => {
                        let code = parse_error_code(parsed.payload)?;
                        return Err(HostError::Netlink {
                            context: "dump",
                            code: -code,
                        });
                    }
                    t if t == reply_type => payloads.push(parsed.payload.to_vec()),
                    _ => {}
                }
            }
        }
    }
}

enum DumpKind {
    Links(u8),
    Addresses,
}

// ─── Tests ──────────────────────────────────────────────────────────────
