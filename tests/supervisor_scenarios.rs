//! Integration tests for the portal supervisor
//!
//! These tests drive a `PortalSupervisor` against the scripted mock portal
//! and check launch, PID resolution, exit collection and kill escalation.

use nix::sys::signal::Signal;
use portalbox::kernel::signal::{wait_status_for_exit, wait_status_for_signal};
use portalbox::portal::message::Value;
use portalbox::portal::protocol::{
    SpawnFlags, DISABLE_FULL_SANDBOX_ARG, PORTAL_OBJECT_PATH, PORTAL_SERVICE_NAME,
};
use portalbox::testing::{MockPortal, SignalRequest};
use portalbox::{
    CallError, CommandLine, ExternalPid, KillDelay, LaunchOptions, PortalInitError,
    PortalSupervisor, RelativePid, RelativePidLookup, SupervisorConfig, SupervisorError,
    TerminationStatus,
};
use std::thread;
use std::time::Duration;

fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        flatpak_info_path: "/nonexistent/.flatpak-info".into(),
        ..SupervisorConfig::default()
    }
}

fn supervisor_with(mock: &MockPortal, config: SupervisorConfig) -> PortalSupervisor {
    PortalSupervisor::new(config, mock.connector())
}

fn supervisor(mock: &MockPortal) -> PortalSupervisor {
    supervisor_with(mock, test_config())
}

fn renderer() -> CommandLine {
    CommandLine::new(["/app/bin/renderer", "--type=renderer"])
}

fn launch(supervisor: &PortalSupervisor) -> ExternalPid {
    supervisor
        .launch(&renderer(), &LaunchOptions::default())
        .expect("launch should succeed")
}

fn requests_for(mock: &MockPortal, signal: Signal) -> Vec<SignalRequest> {
    mock.signal_requests()
        .into_iter()
        .filter(|r| r.signal == signal as i32)
        .collect()
}

#[test]
fn test_resolve_relative_pid_after_started_signal() {
    let mock = MockPortal::new();
    mock.set_next_pid(42);
    let supervisor = supervisor(&mock);

    let pid = launch(&supervisor);
    assert_eq!(pid, ExternalPid(42));
    assert!(mock.emit_started(42, 1001));

    let process = supervisor.get_relative_pid(pid).process().unwrap();
    assert_eq!(process.relative_pid, RelativePid(1001));
    assert_eq!(process.pid().as_raw(), 1001);
}

#[test]
fn test_resolve_relative_pid_blocks_until_started() {
    let mock = MockPortal::new();
    mock.set_next_pid(42);
    let supervisor = supervisor(&mock);
    let pid = launch(&supervisor);

    let lookup = thread::scope(|s| {
        let waiter = s.spawn(|| supervisor.get_relative_pid(pid));
        thread::sleep(Duration::from_millis(50));
        mock.emit_started(42, 1001);
        waiter.join().unwrap()
    });

    assert_eq!(
        lookup.process().map(|p| p.relative_pid),
        Some(RelativePid(1001))
    );
}

#[test]
fn test_exit_before_start_reports_not_found_and_keeps_status() {
    let mock = MockPortal::new();
    mock.set_next_pid(7);
    let supervisor = supervisor(&mock);
    let pid = launch(&supervisor);

    mock.emit_exited(7, wait_status_for_exit(3));
    supervisor.flush().unwrap();

    assert_eq!(supervisor.get_relative_pid(pid), RelativePidLookup::NotFound);
    let status = supervisor.get_termination_status(pid);
    assert_eq!(status, TerminationStatus::Exited { code: 3 });
    assert_eq!(status.exit_code(), 3);

    // The status is handed out once.
    assert_eq!(
        supervisor.get_termination_status(pid),
        TerminationStatus::StillRunning
    );
}

#[test]
fn test_graceful_termination_escalates_to_sigkill() {
    let mock = MockPortal::new();
    mock.set_next_pid(99).exit_on(&[Signal::SIGKILL]);
    let supervisor = supervisor(&mock);
    let pid = launch(&supervisor);

    supervisor.force_termination(pid, Some(KillDelay::from_millis(100)));
    assert_eq!(requests_for(&mock, Signal::SIGTERM).len(), 1);

    assert!(mock.wait_for_signal_request(
        |r| r.pid == pid && r.signal == Signal::SIGKILL as i32,
        Duration::from_secs(5),
    ));
    supervisor.flush().unwrap();

    assert_eq!(supervisor.tracked_count(), 0);
    // SIGKILL was sent by the supervisor, so the exit status is dropped.
    assert_eq!(
        supervisor.get_termination_status(pid),
        TerminationStatus::StillRunning
    );
    let metrics = supervisor.metrics();
    assert_eq!(metrics.kill_escalations, 1);
    assert_eq!(metrics.exits_ignored, 1);
}

#[test]
fn test_pending_sigkill_spares_process_reusing_pid() {
    let mock = MockPortal::new();
    mock.set_next_pid(99).exit_on(&[Signal::SIGTERM]);
    let supervisor = supervisor(&mock);
    let pid = launch(&supervisor);

    supervisor.force_termination(pid, Some(KillDelay::from_millis(200)));
    supervisor.flush().unwrap();
    assert_eq!(
        supervisor.get_termination_status(pid),
        TerminationStatus::Killed {
            signal: Signal::SIGTERM as i32
        }
    );

    mock.set_next_pid(99);
    let reused = launch(&supervisor);
    assert_eq!(reused, pid);

    thread::sleep(Duration::from_millis(500));
    supervisor.flush().unwrap();

    assert!(requests_for(&mock, Signal::SIGKILL).is_empty());
    assert_eq!(supervisor.metrics().kill_escalations, 0);
    supervisor.registry().inspect(|t| {
        assert!(t.is_tracked(reused));
        assert!(!t.is_ignored(reused));
    });
}

#[test]
fn test_graceful_termination_skips_sigkill_after_exit() {
    let mock = MockPortal::new();
    mock.exit_on(&[Signal::SIGTERM]);
    let supervisor = supervisor(&mock);
    let pid = launch(&supervisor);

    supervisor.force_termination(pid, Some(KillDelay::from_millis(50)));
    thread::sleep(Duration::from_millis(300));
    supervisor.flush().unwrap();

    assert_eq!(requests_for(&mock, Signal::SIGTERM).len(), 1);
    assert!(requests_for(&mock, Signal::SIGKILL).is_empty());
    assert_eq!(supervisor.metrics().kill_escalations, 0);
    assert_eq!(supervisor.registry().inspect(|t| t.unclaimed_count()), 0);
}

#[test]
fn test_status_of_unknown_pid_is_still_running() {
    let mock = MockPortal::new();
    let supervisor = supervisor(&mock);

    let status = supervisor.get_termination_status(ExternalPid(12345));
    assert_eq!(status, TerminationStatus::StillRunning);
    assert_eq!(status.exit_code(), 0);
    assert_eq!(supervisor.metrics().anomalies, 1);
    // Answering did not need the portal.
    assert!(mock.calls().is_empty());
}

#[test]
fn test_launched_pids_are_tracked_or_exited_never_both() {
    let mock = MockPortal::new();
    let supervisor = supervisor(&mock);

    let pids: Vec<ExternalPid> = (0..4).map(|_| launch(&supervisor)).collect();
    mock.emit_exited(pids[1].0, wait_status_for_exit(0));
    mock.emit_started(pids[2].0, 5000);
    supervisor.flush().unwrap();

    supervisor.registry().inspect(|table| {
        for pid in &pids {
            assert!(table.is_tracked(*pid) != table.has_exit_status(*pid));
        }
        assert_eq!(table.tracked_count(), 3);
        assert_eq!(table.unclaimed_count(), 1);
    });
    assert_eq!(supervisor.metrics().tracked_processes, 3);
}

#[test]
fn test_duplicate_started_keeps_first_relative_pid() {
    let mock = MockPortal::new();
    mock.set_next_pid(42);
    let supervisor = supervisor(&mock);
    let pid = launch(&supervisor);

    mock.emit_started(42, 1001);
    let first = supervisor.get_relative_pid(pid).process().unwrap();

    mock.emit_started(42, 2002);
    supervisor.flush().unwrap();
    let second = supervisor.get_relative_pid(pid).process().unwrap();

    assert_eq!(first, second);
    assert_eq!(second.relative_pid, RelativePid(1001));
    assert_eq!(supervisor.metrics().anomalies, 1);
}

#[test]
fn test_relative_pid_is_stable_until_exit() {
    let mock = MockPortal::new();
    mock.auto_start(1000);
    let supervisor = supervisor(&mock);
    let pid = launch(&supervisor);

    let first = supervisor.get_relative_pid(pid).process().unwrap();
    let second = supervisor.get_relative_pid(pid).process().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.relative_pid, RelativePid(pid.0 + 1000));

    mock.emit_exited(pid.0, wait_status_for_exit(0));
    supervisor.flush().unwrap();
    assert_eq!(supervisor.get_relative_pid(pid), RelativePidLookup::NotFound);
}

#[test]
fn test_ignored_exit_is_never_reported() {
    let mock = MockPortal::new();
    let supervisor = supervisor(&mock);
    let pid = launch(&supervisor);

    supervisor.registry().update(|t| t.ignore_exit(pid));
    mock.emit_exited(pid.0, wait_status_for_exit(5));
    supervisor.flush().unwrap();

    supervisor.registry().inspect(|t| {
        assert!(!t.is_ignored(pid));
        assert!(!t.has_exit_status(pid));
    });
    assert_eq!(
        supervisor.get_termination_status(pid),
        TerminationStatus::StillRunning
    );
}

#[test]
fn test_repeated_immediate_kill_sends_one_sigkill() {
    let mock = MockPortal::new();
    mock.exit_on(&[Signal::SIGKILL]);
    let supervisor = supervisor(&mock);
    let pid = launch(&supervisor);

    supervisor.force_termination(pid, Some(KillDelay::Immediate));
    supervisor.flush().unwrap();
    supervisor.force_termination(pid, Some(KillDelay::Immediate));

    assert_eq!(requests_for(&mock, Signal::SIGKILL).len(), 1);
    assert!(requests_for(&mock, Signal::SIGTERM).is_empty());
    assert_eq!(supervisor.tracked_count(), 0);
}

#[test]
fn test_force_termination_of_dead_process_drops_status() {
    let mock = MockPortal::new();
    let supervisor = supervisor(&mock);
    let pid = launch(&supervisor);

    mock.emit_exited(pid.0, wait_status_for_exit(1));
    supervisor.flush().unwrap();
    supervisor.force_termination(pid, None);

    assert!(mock.signal_requests().is_empty());
    assert_eq!(supervisor.registry().inspect(|t| t.unclaimed_count()), 0);
}

#[test]
fn test_known_dead_status_waits_for_kill() {
    let mock = MockPortal::new();
    mock.exit_on(&[Signal::SIGKILL]);
    let supervisor = supervisor(&mock);
    let pid = launch(&supervisor);

    let status = supervisor.get_known_dead_termination_status(pid);
    assert_eq!(
        status,
        TerminationStatus::Killed {
            signal: Signal::SIGKILL as i32
        }
    );
    assert_eq!(status.exit_code(), 128 + 9);
}

#[test]
fn test_known_dead_status_of_untracked_pid_is_normal_exit() {
    let mock = MockPortal::new();
    mock.reject_signals(true);
    let supervisor = supervisor(&mock);

    assert_eq!(
        supervisor.get_known_dead_termination_status(ExternalPid(31337)),
        TerminationStatus::Exited { code: 0 }
    );
}

#[test]
fn test_crash_status_is_decoded() {
    let mock = MockPortal::new();
    let supervisor = supervisor(&mock);
    let pid = launch(&supervisor);

    mock.emit_exited(pid.0, wait_status_for_signal(Signal::SIGSEGV, true));
    supervisor.flush().unwrap();

    assert_eq!(
        supervisor.get_termination_status(pid),
        TerminationStatus::Crashed {
            signal: Signal::SIGSEGV as i32,
            core_dumped: true
        }
    );
}

#[test]
fn test_realtime_signal_numbers_are_forwarded() {
    let mock = MockPortal::new();
    let supervisor = supervisor(&mock);
    let pid = launch(&supervisor);

    let signo = libc::SIGRTMIN() + 2;
    assert!(supervisor.send_signal_number(pid, signo, false));
    assert_eq!(mock.signal_requests().last().map(|r| r.signal), Some(signo));

    assert!(matches!(
        supervisor.signal_number(pid, 0, false),
        Err(SupervisorError::InvalidSignal(0))
    ));
    assert_eq!(mock.signal_requests().len(), 1);
}

#[test]
fn test_signal_rejection_is_reported_not_fatal() {
    let mock = MockPortal::new();
    let supervisor = supervisor(&mock);
    let pid = launch(&supervisor);

    mock.reject_signals(true);
    assert!(!supervisor.send_signal(pid, Signal::SIGUSR1, false));
    assert!(matches!(
        supervisor.signal(pid, Signal::SIGUSR1, true),
        Err(SupervisorError::Call {
            method: "SpawnSignal",
            source: CallError::Remote { .. }
        })
    ));

    mock.reject_signals(false);
    assert!(supervisor.send_signal(pid, Signal::SIGUSR1, true));
    let last = *mock.signal_requests().last().unwrap();
    assert_eq!(
        last,
        SignalRequest {
            pid,
            signal: Signal::SIGUSR1 as i32,
            to_process_group: true
        }
    );
    let metrics = supervisor.metrics();
    assert_eq!(metrics.signal_failures, 2);
    assert_eq!(metrics.signals_sent, 1);
}

#[test]
fn test_rejected_launch_leaves_no_record() {
    let mock = MockPortal::new();
    mock.reject_next_spawn("org.freedesktop.DBus.Error.Failed", "Failed to start command");
    let supervisor = supervisor(&mock);

    let err = supervisor
        .launch(&renderer(), &LaunchOptions::default())
        .unwrap_err();
    match err {
        SupervisorError::Call {
            method,
            source: CallError::Remote { name, message },
        } => {
            assert_eq!(method, "Spawn");
            assert_eq!(name, "org.freedesktop.DBus.Error.Failed");
            assert_eq!(message, "Failed to start command");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(supervisor.tracked_count(), 0);
    assert_eq!(supervisor.metrics().launch_failures, 1);

    // The bus survives a failed call.
    assert!(supervisor.launch(&renderer(), &LaunchOptions::default()).is_ok());
}

#[test]
fn test_empty_command_is_rejected_locally() {
    let mock = MockPortal::new();
    let supervisor = supervisor(&mock);

    let err = supervisor
        .launch(&CommandLine::default(), &LaunchOptions::default())
        .unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidLaunch(_)));
    assert!(mock.calls().is_empty());
}

#[test]
fn test_spawn_request_encoding() {
    let mock = MockPortal::new();
    let supervisor = supervisor(&mock);

    let options = LaunchOptions::default().env("LANG", "C").remap_fd(7, 3);
    supervisor
        .launch_with_access(&renderer(), &options, true)
        .unwrap();

    let call = mock.spawn_calls().remove(0);
    assert_eq!(call.args[0], Value::Bytes(b"/app\0".to_vec()));
    match &call.args[1] {
        Value::ByteArrays(argv) => {
            assert_eq!(argv[0], b"/app/bin/renderer\0".to_vec());
            assert_eq!(argv.len(), 2);
        }
        other => panic!("unexpected argv {:?}", other),
    }
    match &call.args[2] {
        Value::FdMap(fds) => {
            assert_eq!(fds.get(&0), Some(&0));
            assert_eq!(fds.get(&3), Some(&7));
        }
        other => panic!("unexpected fd map {:?}", other),
    }
    let flags = call.args[4].as_u32().unwrap();
    let expected = SpawnFlags::SANDBOX | SpawnFlags::EXPOSE_PIDS | SpawnFlags::NOTIFY_START;
    assert_eq!(flags & expected.bits(), expected.bits());
    match &call.args[5] {
        Value::Variants(options) => assert!(options.contains_key("sandbox-flags")),
        other => panic!("unexpected options {:?}", other),
    }
}

#[test]
fn test_disable_full_sandbox_is_forwarded() {
    let mock = MockPortal::new();
    let config = SupervisorConfig {
        disable_full_sandbox: true,
        ..test_config()
    };
    let supervisor = supervisor_with(&mock, config);
    launch(&supervisor);

    let call = mock.spawn_calls().remove(0);
    let flags = call.args[4].as_u32().unwrap();
    assert_eq!(flags & SpawnFlags::SANDBOX.bits(), 0);
    match &call.args[1] {
        Value::ByteArrays(argv) => {
            let mut expected = DISABLE_FULL_SANDBOX_ARG.as_bytes().to_vec();
            expected.push(0);
            assert_eq!(argv.last(), Some(&expected));
        }
        other => panic!("unexpected argv {:?}", other),
    }
}

#[test]
fn test_old_portal_version_fails_start() {
    let mock = MockPortal::new();
    mock.set_version(3);
    let supervisor = supervisor(&mock);

    assert!(matches!(
        supervisor.start(),
        Err(SupervisorError::Init(PortalInitError::VersionTooOld {
            found: 3,
            required: 4
        }))
    ));
    // The failure is cached, not retried.
    assert!(matches!(
        supervisor.launch(&renderer(), &LaunchOptions::default()),
        Err(SupervisorError::Init(PortalInitError::VersionTooOld { .. }))
    ));
    assert!(mock.calls().is_empty());
}

#[test]
fn test_missing_expose_pids_fails_start() {
    let mock = MockPortal::new();
    mock.set_supports(0);
    let supervisor = supervisor(&mock);

    assert!(matches!(
        supervisor.start(),
        Err(SupervisorError::Init(PortalInitError::MissingExposePids {
            supports: 0
        }))
    ));
}

#[test]
fn test_refused_subscription_fails_start() {
    let mock = MockPortal::new();
    mock.refuse_subscription("SpawnExited");
    let supervisor = supervisor(&mock);

    match supervisor.start() {
        Err(SupervisorError::Init(PortalInitError::SignalSubscription { signal, .. })) => {
            assert_eq!(signal, "SpawnExited")
        }
        other => panic!("unexpected start result: {:?}", other),
    }
}

#[test]
fn test_connection_failure_fails_start() {
    let mock = MockPortal::new();
    mock.fail_connection("no session bus");
    let supervisor = supervisor(&mock);

    assert!(matches!(
        supervisor.start(),
        Err(SupervisorError::Init(PortalInitError::Connection(_)))
    ));
}

#[test]
fn test_start_reports_capabilities() {
    let mock = MockPortal::new();
    mock.set_version(6);
    let supervisor = supervisor(&mock);

    let caps = supervisor.start().unwrap();
    assert_eq!(caps.version, 6);
    assert_eq!(supervisor.start().unwrap(), caps);
}

#[test]
fn test_start_resolves_portal_object() {
    let mock = MockPortal::new();
    let supervisor = supervisor(&mock);

    supervisor.start().unwrap();
    assert_eq!(
        mock.connected_object(),
        Some((
            PORTAL_SERVICE_NAME.to_string(),
            PORTAL_OBJECT_PATH.to_string()
        ))
    );
}
