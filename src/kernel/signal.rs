use crate::config::types::TerminationStatus;
/// POSIX signal and wait-status helpers
///
/// The portal reports exits as raw `waitpid` statuses; these helpers turn
/// them into a [`TerminationStatus`] with the libc wait macros.
use nix::sys::signal::Signal;

/// Signals treated as a deliberate kill rather than a crash.
const KILL_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGKILL, Signal::SIGTERM];

/// Signals raised by faults inside the process.
const CRASH_SIGNALS: [Signal; 7] = [
    Signal::SIGABRT,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGSEGV,
    Signal::SIGTRAP,
    Signal::SIGSYS,
];

/// Decode a raw wait status as delivered by `SpawnExited`.
pub fn decode_wait_status(raw: u32) -> TerminationStatus {
    let status = raw as libc::c_int;

    if libc::WIFEXITED(status) {
        return TerminationStatus::Exited {
            code: libc::WEXITSTATUS(status),
        };
    }

    if libc::WIFSIGNALED(status) {
        let signal = libc::WTERMSIG(status);
        return match Signal::try_from(signal) {
            Ok(sig) if KILL_SIGNALS.contains(&sig) => TerminationStatus::Killed { signal },
            Ok(sig) if CRASH_SIGNALS.contains(&sig) => TerminationStatus::Crashed {
                signal,
                core_dumped: libc::WCOREDUMP(status),
            },
            _ => TerminationStatus::Signaled { signal },
        };
    }

    // Stopped/continued statuses are never reported for a reaped child.
    log::warn!("Unexpected wait status 0x{:x}, treating as abnormal exit", raw);
    TerminationStatus::Exited { code: 1 }
}

/// Encode an exit code the way `waitpid` would report it.
pub fn wait_status_for_exit(code: u8) -> u32 {
    (code as u32) << 8
}

/// Encode a signal termination the way `waitpid` would report it.
pub fn wait_status_for_signal(signal: Signal, core_dumped: bool) -> u32 {
    let mut status = signal as u32 & 0x7f;
    if core_dumped {
        status |= 0x80;
    }
    status
}

/// Human-readable name for a signal number, falling back to the number.
pub fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal {}", signal),
    }
}
