//! WireGuard tunnel configuration subprocess.

use std::process::Command;

use tracing::info;

use crate::HostError;

const WG_BINARY: &str = "/usr/bin/wg";
const WG_INTERFACE: &str = "wg0";
const WG_CONFIG: &str = "/etc/wireguard/wireguard.conf";

/// Run `wg setconf` against the tunnel interface and wait for it to exit.
/// Any outcome other than a clean zero exit is a failure, including death
/// by signal.
pub fn apply_config() -> Result<(), HostError> {
    run_setconf(WG_BINARY)
}

fn run_setconf(program: &str) -> Result<(), HostError> {
    let status = Command::new(program)
        .args(["setconf", WG_INTERFACE, WG_CONFIG])
        .status()?;

    match status.code() {
        Some(0) => {
            info!(interface = WG_INTERFACE, "tunnel configuration applied");
            Ok(())
        }
        Some(code) => Err(HostError::TunnelConfig(format!(
            "{program} exited with status {code}"
        ))),
        None => Err(HostError::TunnelConfig(format!(
            "{program} terminated by a signal"
        ))),
    }
}
