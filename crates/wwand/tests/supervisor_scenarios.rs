//! End-to-end supervisor scenarios against scripted collaborators.
//!
//! Every mock records into one shared operation log, so the tests can
//! assert the exact cross-collaborator ordering of a full outer-loop
//! iteration, not just per-component behavior.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use wwand::supervisor::{
    DataSession, DeviceControl, HostNet, ModemPort, ServiceManager, Supervisor,
    SupervisorConfig, TunnelConfig,
};
use wwand_host::HostError;
use wwand_qmi::dms::OperationMode;
use wwand_qmi::wds::{
    AutoconnectRoamSetting, AutoconnectSetting, IpFamily, RuntimeSettings, StartOutcome,
};
use wwand_qmi::QmiError;

type OpLog = Arc<Mutex<Vec<String>>>;

/// Shared scripting knobs and the common operation log.
#[derive(Clone)]
struct Script {
    ops: OpLog,
    exit: Arc<AtomicBool>,
    /// Mode reported back when the supervisor requests online.
    resulting_mode: Arc<Mutex<OperationMode>>,
    /// Refuse every IPv6 session start.
    refuse_start_v6: Arc<AtomicBool>,
    /// IPv4 sessions report a teardown after this many polls (0 = never).
    v4_teardown_after: Arc<AtomicU32>,
    /// Request an exit when the Nth DMS attach happens (0 = never).
    exit_on_dms_attach: Arc<AtomicU32>,
    dms_attaches: Arc<AtomicU32>,
    /// Fail the Nth stop_unit call overall (0 = never).
    fail_stop_call: Arc<AtomicU32>,
    stop_calls: Arc<AtomicU32>,
    tunnel_fails: Arc<AtomicBool>,
    /// Fail applying IPv6 settings to the host.
    fail_apply_v6: Arc<AtomicBool>,
}

impl Script {
    fn new() -> Self {
        Script {
            ops: Arc::new(Mutex::new(Vec::new())),
            exit: Arc::new(AtomicBool::new(false)),
            resulting_mode: Arc::new(Mutex::new(OperationMode::Online)),
            refuse_start_v6: Arc::new(AtomicBool::new(false)),
            v4_teardown_after: Arc::new(AtomicU32::new(0)),
            exit_on_dms_attach: Arc::new(AtomicU32::new(0)),
            dms_attaches: Arc::new(AtomicU32::new(0)),
            fail_stop_call: Arc::new(AtomicU32::new(0)),
            stop_calls: Arc::new(AtomicU32::new(0)),
            tunnel_fails: Arc::new(AtomicBool::new(false)),
            fail_apply_v6: Arc::new(AtomicBool::new(false)),
        }
    }

    fn log(&self, op: impl Into<String>) {
        self.ops.lock().unwrap().push(op.into());
    }

    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn count(&self, op: &str) -> usize {
        self.ops().iter().filter(|o| o.as_str() == op).count()
    }

    fn position(&self, op: &str) -> Option<usize> {
        self.ops().iter().position(|o| o == op)
    }
}

// ─── Mock collaborators ─────────────────────────────────────────────────

struct MockModem {
    script: Script,
}

impl ModemPort for MockModem {
    fn attach_dms(&mut self) -> Result<Box<dyn DeviceControl>, QmiError> {
        self.script.log("attach-dms");
        let n = self.script.dms_attaches.fetch_add(1, Ordering::SeqCst) + 1;
        let threshold = self.script.exit_on_dms_attach.load(Ordering::SeqCst);
        if threshold != 0 && n >= threshold {
            self.script.exit.store(true, Ordering::Release);
        }
        Ok(Box::new(MockDms {
            script: self.script.clone(),
        }))
    }

    fn attach_wds(&mut self, family: IpFamily) -> Result<Box<dyn DataSession>, QmiError> {
        self.script.log(format!("attach-wds {family}"));
        let teardown_after = match family {
            IpFamily::V4 => {
                let after = self.script.v4_teardown_after.load(Ordering::SeqCst);
                (after != 0).then_some(after)
            }
            IpFamily::V6 => None,
        };
        Ok(Box::new(MockSession {
            script: self.script.clone(),
            family,
            teardown_after,
            polls: AtomicU32::new(0),
        }))
    }
}

struct MockDms {
    script: Script,
}

impl DeviceControl for MockDms {
    fn set_power(&mut self, _mode: OperationMode) -> Result<OperationMode, QmiError> {
        self.script.log("set-power");
        Ok(*self.script.resulting_mode.lock().unwrap())
    }

    fn detach(self: Box<Self>, _deallocate_cache: bool) -> Result<(), QmiError> {
        self.script.log("detach-dms");
        Ok(())
    }
}

struct MockSession {
    script: Script,
    family: IpFamily,
    teardown_after: Option<u32>,
    polls: AtomicU32,
}

impl DataSession for MockSession {
    fn set_autoconnect(
        &mut self,
        _setting: AutoconnectSetting,
        _roam: AutoconnectRoamSetting,
    ) -> Result<(), QmiError> {
        self.script.log("autoconnect");
        Ok(())
    }

    fn bring_up(&mut self, _profile_id: u32) -> Result<StartOutcome, QmiError> {
        self.script.log(format!("start {}", self.family));
        if self.family == IpFamily::V6 && self.script.refuse_start_v6.load(Ordering::SeqCst) {
            return Err(QmiError::SessionRefused {
                error: 14,
                reason: Some(3),
                verbose: None,
            });
        }
        Ok(StartOutcome {
            session_id: 0xBEEF,
            failure_reason: None,
            verbose_failure: None,
        })
    }

    fn runtime_settings(&mut self) -> Result<RuntimeSettings, QmiError> {
        self.script.log(format!("settings {}", self.family));
        Ok(match self.family {
            IpFamily::V4 => RuntimeSettings::V4 {
                address: "10.42.0.2".parse().unwrap(),
                gateway: "10.42.0.1".parse().unwrap(),
                prefix_length: 24,
            },
            IpFamily::V6 => RuntimeSettings::V6 {
                address: "2607::1".parse().unwrap(),
                gateway: "2607::2".parse().unwrap(),
                prefix_length: 64,
            },
        })
    }

    fn stop(&mut self) -> Result<(), QmiError> {
        self.script.log(format!("stop {}", self.family));
        Ok(())
    }

    fn teardown_requested(&self) -> bool {
        match self.teardown_after {
            None => false,
            Some(after) => self.polls.fetch_add(1, Ordering::SeqCst) + 1 >= after,
        }
    }

    fn detach(self: Box<Self>) -> Result<(), QmiError> {
        self.script.log(format!("detach-wds {}", self.family));
        Ok(())
    }
}

struct MockHost {
    script: Script,
}

impl HostNet for MockHost {
    fn reload_link_cache(&mut self) -> Result<(), HostError> {
        self.script.log("reload-links");
        Ok(())
    }

    fn ensure_wwan_state(&mut self, up: bool) -> Result<(), HostError> {
        self.script
            .log(format!("wwan-state {}", if up { "up" } else { "down" }));
        Ok(())
    }

    fn ensure_tunnel_state(&mut self, up: bool) -> Result<(), HostError> {
        self.script
            .log(format!("tunnel-state {}", if up { "up" } else { "down" }));
        Ok(())
    }

    fn flush_addresses(&mut self) -> Result<(), HostError> {
        self.script.log("flush-addresses");
        Ok(())
    }

    fn apply_settings(
        &mut self,
        settings: &RuntimeSettings,
        _refresh_cache: bool,
    ) -> Result<(), HostError> {
        match settings {
            RuntimeSettings::V4 { .. } => {
                self.script.log("apply IPv4");
                Ok(())
            }
            RuntimeSettings::V6 { .. } => {
                self.script.log("apply IPv6");
                if self.script.fail_apply_v6.load(Ordering::SeqCst) {
                    return Err(HostError::Netlink {
                        context: "scripted failure",
                        code: libc::EPERM,
                    });
                }
                Ok(())
            }
        }
    }

    fn ensure_tunnel_routes(&mut self) -> Result<(), HostError> {
        self.script.log("tunnel-routes");
        Ok(())
    }
}

struct MockServices {
    script: Script,
}

impl ServiceManager for MockServices {
    fn start_unit(&mut self, unit: &str) -> Result<(), HostError> {
        self.script.log(format!("start {unit}"));
        Ok(())
    }

    fn stop_unit(&mut self, unit: &str) -> Result<(), HostError> {
        self.script.log(format!("stop {unit}"));
        let n = self.script.stop_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.script.fail_stop_call.load(Ordering::SeqCst) == n {
            return Err(HostError::Bus("scripted stop failure".into()));
        }
        Ok(())
    }
}

struct MockTunnel {
    script: Script,
}

impl TunnelConfig for MockTunnel {
    fn apply(&mut self) -> Result<(), HostError> {
        self.script.log("tunnel-setconf");
        if self.script.tunnel_fails.load(Ordering::SeqCst) {
            return Err(HostError::TunnelConfig("scripted setconf failure".into()));
        }
        Ok(())
    }
}

fn run_supervisor(script: &Script) -> anyhow::Result<()> {
    let mut modem = MockModem {
        script: script.clone(),
    };
    let mut host = MockHost {
        script: script.clone(),
    };
    let mut services = MockServices {
        script: script.clone(),
    };
    let mut tunnel = MockTunnel {
        script: script.clone(),
    };
    let config = SupervisorConfig {
        retry_backoff: Duration::from_millis(5),
        monitor_interval: Duration::from_millis(1),
        ..SupervisorConfig::default()
    };
    let exit = script.exit.clone();
    Supervisor::new(
        &mut modem,
        &mut host,
        &mut services,
        &mut tunnel,
        config,
        &exit,
    )
    .run()
}

// ─── Scenarios ──────────────────────────────────────────────────────────

/// Cold start with everything healthy: the collaborators must be driven in
/// the fixed order, terminating in the monitor until an external shutdown.
#[test]
fn cold_happy_path_follows_the_fixed_order() {
    let script = Script::new();
    let exit = script.exit.clone();
    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        exit.store(true, Ordering::Release);
    });

    let result = run_supervisor(&script);
    trigger.join().unwrap();
    assert!(result.is_ok(), "{result:?}");

    let expected: Vec<String> = [
        // Prelude.
        "tunnel-state down",
        "attach-wds IPv4",
        "autoconnect",
        "detach-wds IPv4",
        // Bring-up.
        "reload-links",
        "stop chrony.service",
        "stop unbound.service",
        "wwan-state up",
        "flush-addresses",
        "attach-dms",
        "set-power",
        "attach-wds IPv6",
        "start IPv6",
        "settings IPv6",
        "apply IPv6",
        "attach-wds IPv4",
        "start IPv4",
        "settings IPv4",
        "apply IPv4",
        "start unbound.service",
        "tunnel-setconf",
        "tunnel-state up",
        "tunnel-routes",
        "start chrony.service",
        // Monitor exits on the external request; ordered teardown.
        "stop IPv4",
        "detach-wds IPv4",
        "stop IPv6",
        "detach-wds IPv6",
        "detach-dms",
        "reload-links",
        "wwan-state down",
        "tunnel-state down",
        "stop chrony.service",
        "stop unbound.service",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    assert_eq!(script.ops(), expected);
}

/// A peer-initiated teardown indication on the v4 session leaves the
/// monitor, stops v4 before v6, cleans up fully, and starts a fresh
/// iteration.
#[test]
fn peer_teardown_restarts_the_outer_loop() {
    let script = Script::new();
    script.v4_teardown_after.store(3, Ordering::SeqCst);
    script.exit_on_dms_attach.store(2, Ordering::SeqCst);

    let result = run_supervisor(&script);
    assert!(result.is_ok(), "{result:?}");

    // Two full iterations ran.
    assert_eq!(script.count("attach-dms"), 2);
    assert_eq!(script.count("start IPv6"), 2);

    // v4 is stopped before v6 on the way down.
    let stop_v4 = script.position("stop IPv4").expect("v4 stopped");
    let stop_v6 = script.position("stop IPv6").expect("v6 stopped");
    assert!(stop_v4 < stop_v6, "v4 must stop before v6");
}

/// A hardware-locked operating mode fails the iteration without touching
/// the data sessions, then retries after the backoff.
#[test]
fn hardware_locked_mode_retries_without_sessions() {
    let script = Script::new();
    *script.resulting_mode.lock().unwrap() = OperationMode::LowPower;
    script.exit_on_dms_attach.store(2, Ordering::SeqCst);

    let result = run_supervisor(&script);
    assert!(result.is_ok(), "{result:?}");

    // Two iterations attempted the mode change; no session work happened.
    assert_eq!(script.count("set-power"), 2);
    assert_eq!(script.count("attach-wds IPv6"), 0);
    // The only IPv4 WDS attach is the autoconnect prelude.
    assert_eq!(script.count("attach-wds IPv4"), 1);
    // Cleanup still ran each iteration.
    assert_eq!(script.count("wwan-state down"), 2);
}

/// A service-bus failure while stopping units on teardown is
/// unrecoverable: the daemon exits after that iteration.
#[test]
fn stop_failure_during_teardown_ends_the_daemon() {
    let script = Script::new();
    script.v4_teardown_after.store(1, Ordering::SeqCst);
    // Stop calls: chrony, unbound (bring-up), chrony, unbound (teardown).
    script.fail_stop_call.store(4, Ordering::SeqCst);

    let result = run_supervisor(&script);
    assert!(result.is_err());
    assert!(script.exit.load(Ordering::Acquire));
    assert_eq!(script.count("attach-dms"), 1, "no retry after the fault");
}

/// A refused session start is a radio-side failure: no exit, full
/// teardown, retry via the outer loop.
#[test]
fn refused_session_start_is_retried() {
    let script = Script::new();
    script.refuse_start_v6.store(true, Ordering::SeqCst);
    script.exit_on_dms_attach.store(2, Ordering::SeqCst);

    let result = run_supervisor(&script);
    assert!(result.is_ok(), "{result:?}");

    assert_eq!(script.count("start IPv6"), 2);
    // The session never came up: no stop, but the handle is detached.
    assert_eq!(script.count("stop IPv6"), 0);
    assert_eq!(script.count("detach-wds IPv6"), 2);
    // v4 was never attempted (prelude accounts for the one v4 attach).
    assert_eq!(script.count("attach-wds IPv4"), 1);
    assert_eq!(script.count("start IPv4"), 0);
}

/// A tunnel-configuration failure skips the time service and the monitor,
/// but does not end the daemon.
#[test]
fn tunnel_failure_retries_without_exiting() {
    let script = Script::new();
    script.tunnel_fails.store(true, Ordering::SeqCst);
    script.exit_on_dms_attach.store(2, Ordering::SeqCst);

    let result = run_supervisor(&script);
    assert!(result.is_ok(), "{result:?}");

    assert_eq!(script.count("tunnel-setconf"), 2);
    assert_eq!(script.count("tunnel-state up"), 0);
    assert_eq!(script.count("tunnel-routes"), 0);
    assert_eq!(script.count("start chrony.service"), 0);
    // The resolver had been started before the tunnel attempt.
    assert_eq!(script.count("start unbound.service"), 2);
}

/// A netlink failure applying session settings is host-side and
/// unrecoverable.
#[test]
fn host_apply_failure_ends_the_daemon() {
    let script = Script::new();
    script.fail_apply_v6.store(true, Ordering::SeqCst);

    let result = run_supervisor(&script);
    assert!(result.is_err());
    assert!(script.exit.load(Ordering::Acquire));

    // The v6 session is still stopped and detached on the way out.
    assert_eq!(script.count("stop IPv6"), 1);
    assert_eq!(script.count("detach-wds IPv6"), 1);
    assert_eq!(script.count("attach-wds IPv4"), 1, "prelude only");
}
