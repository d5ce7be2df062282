use thiserror::Error;

/// Failures of host-side facilities. Any of these ends the supervisor: the
/// daemon cannot vouch for host consistency once the kernel, the service
/// manager, or a subprocess misbehaves.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("netlink request failed: {context}: errno {code}")]
    Netlink { context: &'static str, code: i32 },

    #[error("malformed netlink message: {0}")]
    Malformed(&'static str),

    #[error("no such link: {0}")]
    LinkMissing(&'static str),

    #[error("wwan link ifindex differs between address families ({v4} vs {v6})")]
    IfindexMismatch { v4: i32, v6: i32 },

    #[error("interface address enumeration overflowed ({count} addresses)")]
    AddressOverflow { count: usize },

    #[error("service bus failure: {0}")]
    Bus(String),

    #[error("tunnel configuration failed: {0}")]
    TunnelConfig(String),
}
