//! The connection supervisor state machine.
//!
//! Four phases, strictly ordered:
//!
//! - **Prelude** (once): tunnel link down, firmware autoconnect disabled.
//!   Autoconnect stays off because this daemon owns bring-up sequencing
//!   and will not race the firmware for it.
//! - **Outer loop** (until an exit is requested): prepare the host
//!   interface, bring the modem online, run the session phase, then tear
//!   everything down in reverse order and rate-limit the retry.
//! - **Session phase**: IPv6 first, then IPv4 nested inside it, then the
//!   dependent services and the tunnel.
//! - **Monitor**: sleep in one-second quanta until an exit or a teardown
//!   indication from either session.
//!
//! Faults come in two classes. Host-side failures (netlink, service bus,
//! subprocesses, a modem that refuses commands at the transport level) set
//! the process-wide exit flag: the daemon cannot vouch for host
//! consistency past that point. Radio-side failures (a refused session,
//! a dropped session, a tunnel that will not come up) are retried through
//! the outer loop, since often the signal is simply too weak.
//!
//! The supervisor talks to its collaborators only through the traits
//! defined here; tests drive it with scripted mocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing::{error, info, warn};

use wwand_host::HostError;
use wwand_qmi::dms::OperationMode;
use wwand_qmi::wds::{
    AutoconnectRoamSetting, AutoconnectSetting, IpFamily, RuntimeSettings, StartOutcome,
};
use wwand_qmi::QmiError;

// ─── Collaborator traits ────────────────────────────────────────────────

/// DMS attachment as consumed by the supervisor: one attachment per outer
/// iteration, detached at its end.
pub trait DeviceControl {
    /// Drive the modem to `mode`; returns the mode it actually ended in.
    fn set_power(&mut self, mode: OperationMode) -> Result<OperationMode, QmiError>;
    /// Detach, dropping the cached modem identity iff `deallocate_cache`.
    fn detach(self: Box<Self>, deallocate_cache: bool) -> Result<(), QmiError>;
}

/// A family-bound packet session attachment.
pub trait DataSession {
    fn set_autoconnect(
        &mut self,
        setting: AutoconnectSetting,
        roam: AutoconnectRoamSetting,
    ) -> Result<(), QmiError>;
    /// Set the family preference and start a data session on `profile_id`.
    fn bring_up(&mut self, profile_id: u32) -> Result<StartOutcome, QmiError>;
    fn runtime_settings(&mut self) -> Result<RuntimeSettings, QmiError>;
    /// Stop the session; an already-gone session is success.
    fn stop(&mut self) -> Result<(), QmiError>;
    /// Whether the indication path has asked for a teardown.
    fn teardown_requested(&self) -> bool;
    fn detach(self: Box<Self>) -> Result<(), QmiError>;
}

/// Source of modem service attachments.
pub trait ModemPort {
    fn attach_dms(&mut self) -> Result<Box<dyn DeviceControl>, QmiError>;
    fn attach_wds(&mut self, family: IpFamily) -> Result<Box<dyn DataSession>, QmiError>;
}

/// Kernel-side state the supervisor keeps consistent with the connection.
pub trait HostNet {
    fn reload_link_cache(&mut self) -> Result<(), HostError>;
    fn ensure_wwan_state(&mut self, up: bool) -> Result<(), HostError>;
    fn ensure_tunnel_state(&mut self, up: bool) -> Result<(), HostError>;
    fn flush_addresses(&mut self) -> Result<(), HostError>;
    /// Install a session's address and default route.
    fn apply_settings(
        &mut self,
        settings: &RuntimeSettings,
        refresh_cache: bool,
    ) -> Result<(), HostError>;
    fn ensure_tunnel_routes(&mut self) -> Result<(), HostError>;
}

/// The service manager, reduced to the two verbs this daemon needs.
pub trait ServiceManager {
    fn start_unit(&mut self, unit: &str) -> Result<(), HostError>;
    fn stop_unit(&mut self, unit: &str) -> Result<(), HostError>;
}

/// The tunnel configuration subprocess.
pub trait TunnelConfig {
    fn apply(&mut self) -> Result<(), HostError>;
}

// ─── Configuration ──────────────────────────────────────────────────────

/// Fixed operating constants. There is no runtime configuration; this
/// struct exists so tests can shrink the timings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// 3GPP profile used for both families.
    pub profile_id: u32,
    /// DNS resolver unit. Started only once the connection is usable, so
    /// a successful query afterwards is a real connectivity signal.
    pub dns_unit: String,
    /// Time synchronization unit.
    pub time_unit: String,
    /// Wait between outer-loop iterations after a failed or torn-down
    /// bring-up.
    pub retry_backoff: Duration,
    /// Granularity of the monitor loop's sleep.
    pub monitor_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            profile_id: 3, // Verizon internet
            dns_unit: "unbound.service".into(),
            time_unit: "chrony.service".into(),
            retry_backoff: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(1),
        }
    }
}

// ─── Supervisor ─────────────────────────────────────────────────────────

/// The only stateful orchestrator in the daemon. Owns nothing but borrows
/// everything: collaborators outlive it so the caller controls teardown
/// order.
pub struct Supervisor<'a> {
    modem: &'a mut dyn ModemPort,
    host: &'a mut dyn HostNet,
    services: &'a mut dyn ServiceManager,
    tunnel: &'a mut dyn TunnelConfig,
    config: SupervisorConfig,
    exit: &'a AtomicBool,
    fatal: Option<anyhow::Error>,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        modem: &'a mut dyn ModemPort,
        host: &'a mut dyn HostNet,
        services: &'a mut dyn ServiceManager,
        tunnel: &'a mut dyn TunnelConfig,
        config: SupervisorConfig,
        exit: &'a AtomicBool,
    ) -> Self {
        Supervisor {
            modem,
            host,
            services,
            tunnel,
            config,
            exit,
            fatal: None,
        }
    }

    /// Run the prelude and then the outer loop until an exit is requested.
    /// Returns an error if the daemon stopped for any reason other than a
    /// clean external shutdown.
    pub fn run(&mut self) -> Result<()> {
        self.prelude()?;

        while !self.exit_requested() {
            if let Err(e) = self.run_outer_iteration() {
                self.record_fatal(e);
                break;
            }
        }

        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    /// Record the first unrecoverable fault and ask the loop to wind down.
    fn record_fatal(&mut self, e: anyhow::Error) {
        error!(error = format_args!("{e:#}"), "unrecoverable fault");
        self.request_exit();
        if self.fatal.is_none() {
            self.fatal = Some(e);
        }
    }

    // ─── Prelude ────────────────────────────────────────────────────────

    /// One-shot setup: the tunnel starts link-down, and firmware
    /// autoconnect is switched off.
    fn prelude(&mut self) -> Result<()> {
        self.host
            .ensure_tunnel_state(false)
            .map_err(|e| anyhow!(e).context("put down the tunnel interface at startup"))?;

        let mut wds = self
            .modem
            .attach_wds(IpFamily::V4)
            .map_err(|e| anyhow!(e).context("attach the WDS service for setup"))?;
        let mut status = wds
            .set_autoconnect(AutoconnectSetting::Disabled, AutoconnectRoamSetting::HomeOnly)
            .map_err(|e| anyhow!(e).context("configure autoconnect and roaming"));
        if let Err(e) = wds.detach() {
            status = Err(anyhow!(e).context("detach the WDS service after setup"));
        }
        status
    }

    // ─── Outer loop ─────────────────────────────────────────────────────

    /// One full bring-up/teardown cycle. An `Err` is an unrecoverable
    /// fault; radio-side trouble is logged and retried instead.
    fn run_outer_iteration(&mut self) -> Result<()> {
        self.host
            .reload_link_cache()
            .map_err(|e| anyhow!(e).context("reload the link cache"))?;

        // Both units must be down during bring-up: some carriers (or the
        // modem) get upset about stray UDP traffic, and a stopped resolver
        // starts with a cold cache, making the first successful query a
        // real end-to-end check.
        let time_unit = self.config.time_unit.clone();
        let dns_unit = self.config.dns_unit.clone();
        self.services
            .stop_unit(&time_unit)
            .map_err(|e| anyhow!(e).context("stop the time service before bring-up"))?;
        self.services
            .stop_unit(&dns_unit)
            .map_err(|e| anyhow!(e).context("stop the DNS service before bring-up"))?;

        self.host
            .ensure_wwan_state(true)
            .map_err(|e| anyhow!(e).context("bring up the wwan interface"))?;
        self.host
            .flush_addresses()
            .map_err(|e| anyhow!(e).context("flush wwan interface addresses"))?;

        let mut dms = self
            .modem
            .attach_dms()
            .map_err(|e| anyhow!(e).context("attach the DMS service"))?;

        match dms.set_power(OperationMode::Online) {
            Ok(OperationMode::Online) => self.run_sessions(),
            Ok(mode) => {
                // Typically a hardware-controlled lock. Not our fault and
                // not fatal; maybe an operator flips the switch back.
                warn!(%mode, "modem operating mode cannot be set to online");
            }
            Err(e) => {
                self.record_fatal(anyhow!(e).context("set the modem operating mode"));
            }
        }

        dms.detach(self.exit_requested())
            .map_err(|e| anyhow!(e).context("detach the DMS service"))?;

        // Kill routing: both managed links go down until the next attempt.
        self.host
            .reload_link_cache()
            .map_err(|e| anyhow!(e).context("reload the link cache during teardown"))?;
        self.host
            .ensure_wwan_state(false)
            .map_err(|e| anyhow!(e).context("put down the wwan interface"))?;
        self.host
            .ensure_tunnel_state(false)
            .map_err(|e| anyhow!(e).context("put down the tunnel interface"))?;

        // If service management is broken we cannot guarantee a correct
        // host, so these failures end the daemon rather than the iteration.
        if let Err(e) = self.services.stop_unit(&time_unit) {
            self.record_fatal(anyhow!(e).context("stop the time service during teardown"));
        }
        if let Err(e) = self.services.stop_unit(&dns_unit) {
            self.record_fatal(anyhow!(e).context("stop the DNS service during teardown"));
        }

        if !self.exit_requested() {
            self.backoff();
        }
        Ok(())
    }

    /// Rate-limit futile modem operations against an unhappy network.
    fn backoff(&self) {
        info!(
            seconds = self.config.retry_backoff.as_secs(),
            "waiting before the next bring-up attempt"
        );
        let deadline = Instant::now() + self.config.retry_backoff;
        while !self.exit_requested() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(self.config.monitor_interval));
        }
    }

    // ─── Session phase ──────────────────────────────────────────────────

    /// IPv6 bring-up; IPv4 nests inside its success path.
    fn run_sessions(&mut self) {
        let mut v6 = match self.modem.attach_wds(IpFamily::V6) {
            Ok(session) => session,
            Err(e) => {
                self.record_fatal(anyhow!(e).context("attach the IPv6 WDS service"));
                return;
            }
        };

        match v6.bring_up(self.config.profile_id) {
            Ok(outcome) => {
                log_session_started(IpFamily::V6, &outcome);

                match v6.runtime_settings() {
                    Ok(settings) => match self.host.apply_settings(&settings, false) {
                        Ok(()) => self.run_v4_inside_v6(v6.as_mut()),
                        Err(e) => self.record_fatal(
                            anyhow!(e).context("apply the IPv6 configuration to the host"),
                        ),
                    },
                    Err(e) => warn!(error = %e, "failed to get initial IPv6 runtime settings"),
                }

                if let Err(e) = v6.stop() {
                    self.record_fatal(anyhow!(e).context("stop the IPv6 data session"));
                }
            }
            // Do not request an exit: the signal is likely too weak.
            Err(e) => warn!(error = %e, "failed to start the IPv6 data session"),
        }

        if let Err(e) = v6.detach() {
            self.record_fatal(anyhow!(e).context("detach the IPv6 WDS service"));
        }
    }

    fn run_v4_inside_v6(&mut self, v6: &mut dyn DataSession) {
        let mut v4 = match self.modem.attach_wds(IpFamily::V4) {
            Ok(session) => session,
            Err(e) => {
                self.record_fatal(anyhow!(e).context("attach the IPv4 WDS service"));
                return;
            }
        };

        match v4.bring_up(self.config.profile_id) {
            Ok(outcome) => {
                log_session_started(IpFamily::V4, &outcome);

                match v4.runtime_settings() {
                    Ok(settings) => match self.host.apply_settings(&settings, false) {
                        Ok(()) => self.start_dependents_and_monitor(v4.as_mut(), v6),
                        Err(e) => self.record_fatal(
                            anyhow!(e).context("apply the IPv4 configuration to the host"),
                        ),
                    },
                    Err(e) => warn!(error = %e, "failed to get initial IPv4 runtime settings"),
                }

                if let Err(e) = v4.stop() {
                    self.record_fatal(anyhow!(e).context("stop the IPv4 data session"));
                }
            }
            // Do not request an exit: the signal is likely too weak.
            Err(e) => warn!(error = %e, "failed to start the IPv4 data session"),
        }

        if let Err(e) = v4.detach() {
            self.record_fatal(anyhow!(e).context("detach the IPv4 WDS service"));
        }
    }

    /// Both sessions are up: start the resolver, configure and raise the
    /// tunnel, start time sync, and settle into monitoring.
    fn start_dependents_and_monitor(&mut self, v4: &dyn DataSession, v6: &dyn DataSession) {
        let dns_unit = self.config.dns_unit.clone();
        let time_unit = self.config.time_unit.clone();

        if let Err(e) = self.services.start_unit(&dns_unit) {
            self.record_fatal(anyhow!(e).context("start the DNS service after bring-up"));
            return;
        }

        let mut tunnel_result = self.tunnel.apply();
        if tunnel_result.is_ok() {
            tunnel_result = self.host.ensure_tunnel_state(true);
        }
        if tunnel_result.is_ok() {
            tunnel_result = self.host.ensure_tunnel_routes();
        }
        if let Err(e) = tunnel_result {
            // Not fatal: without the tunnel we likely cannot resolve DNS
            // right now, and restarting the modem tends to fix it.
            warn!(error = %e, "failed to bring up the tunnel; will retry via a modem restart");
            return;
        }

        if let Err(e) = self.services.start_unit(&time_unit) {
            self.record_fatal(anyhow!(e).context("start the time service after bring-up"));
            return;
        }

        self.monitor(v4, v6);
    }

    // ─── Monitor ────────────────────────────────────────────────────────

    fn monitor(&self, v4: &dyn DataSession, v6: &dyn DataSession) {
        info!("connection established; monitoring");
        while !self.exit_requested()
            && !v4.teardown_requested()
            && !v6.teardown_requested()
        {
            thread::sleep(self.config.monitor_interval);
        }
        info!("stopping the connection due to an external request");
    }
}

fn log_session_started(family: IpFamily, outcome: &StartOutcome) {
    info!(
        %family,
        session_id = format_args!("{:#x}", outcome.session_id),
        failure_reason = outcome.failure_reason,
        verbose_failure = ?outcome.verbose_failure,
        "data session started"
    );
}
