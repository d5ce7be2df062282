//! wwand entry point: logging, signal registration, collaborator
//! construction in dependency order, and the final host cleanup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wwand::adapters::{PlatformModem, WgTunnel};
use wwand::supervisor::{Supervisor, SupervisorConfig};
use wwand_host::netlink::HostNetwork;
use wwand_host::sdbus::SystemBus;
use wwand_host::HostError;
use wwand_qmi::transport::QmuxTransport;

/// Set by the signal handler, read at the supervisor's cooperative points.
static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: libc::c_int) {
    EXIT_REQUESTED.store(true, Ordering::Release);
}

fn register_signal_handler(signal: libc::c_int) -> std::io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_signal as usize;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    register_signal_handler(libc::SIGINT).context("register the SIGINT handler")?;
    register_signal_handler(libc::SIGTERM).context("register the SIGTERM handler")?;

    info!("wwand starting");

    // Acquisition order matters: the transport outlives every service
    // attached to it, and the declaration order here gives the reverse
    // teardown on all exit paths.
    let transport =
        Arc::new(QmuxTransport::open().context("initialize the QMI transport")?);
    let mut host = HostNetwork::new().context("initialize the netlink layer")?;
    let mut bus = SystemBus::open().context("connect to the system bus")?;
    let mut modem = PlatformModem::new(transport.clone());
    let mut tunnel = WgTunnel;

    let result = Supervisor::new(
        &mut modem,
        &mut host,
        &mut bus,
        &mut tunnel,
        SupervisorConfig::default(),
        &EXIT_REQUESTED,
    )
    .run();

    // However the loop ended, leave the wwan interface unconfigured and
    // down.
    if let Err(e) = final_host_cleanup(&mut host) {
        warn!(error = %e, "failed to shut down the wwan host interface");
    }

    info!("wwand stopped");
    result
}

fn final_host_cleanup(host: &mut HostNetwork) -> Result<(), HostError> {
    host.flush_addresses()?;
    host.reload_link_cache()?;
    host.ensure_wwan_state(false)
}
