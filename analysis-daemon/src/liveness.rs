//! Process liveness probe.
//!
//! Every "is this PID alive" question and every signal the supervisor sends
//! goes through [`ProcessProbe`], so tests can swap in a fake and the rest of
//! the crate never touches `libc` directly.

use std::io;
use std::time::{Duration, Instant, SystemTime};
use tracing::trace;

/// Signals the supervisor knows how to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful terminate (SIGTERM).
    Terminate,
    /// Forceful kill (SIGKILL).
    Kill,
    /// Interrupt (SIGINT).
    Interrupt,
}

impl Signal {
    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
            Signal::Interrupt => libc::SIGINT,
        }
    }
}

/// Result of delivering a signal to a PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    /// The process no longer exists; callers treat this as "already stopped".
    NoSuchProcess,
}

/// OS process introspection seam.
pub trait ProcessProbe: Send + Sync {
    /// Whether a process with this PID currently exists and is not a zombie.
    fn is_alive(&self, pid: u32) -> bool;

    /// Send `signal` to `pid`.
    fn signal(&self, pid: u32, signal: Signal) -> io::Result<SignalOutcome>;

    /// Wall-clock start time of the process, where the platform exposes it.
    fn start_time(&self, _pid: u32) -> Option<SystemTime> {
        None
    }
}

/// [`ProcessProbe`] backed by the host OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        Self
    }
}

/// PIDs that must never be probed or signalled: 0 and anything that would
/// wrap to a negative `pid_t` address process groups, not processes.
fn is_addressable(pid: u32) -> bool {
    pid > 0 && pid <= i32::MAX as u32
}

#[cfg(unix)]
impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if !is_addressable(pid) {
            return false;
        }

        // Signal 0 performs the permission and existence checks only
        let exists = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0
            || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);

        if !exists {
            return false;
        }

        // An exited child we haven't reaped still answers signal 0
        !is_zombie(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<SignalOutcome> {
        if !is_addressable(pid) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to signal PID {pid}"),
            ));
        }

        trace!("Sending {:?} to PID {}", signal, pid);
        if unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) } == 0 {
            return Ok(SignalOutcome::Delivered);
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(SignalOutcome::NoSuchProcess)
        } else {
            Err(err)
        }
    }

    fn start_time(&self, pid: u32) -> Option<SystemTime> {
        proc_start_time(pid)
    }
}

#[cfg(target_os = "linux")]
fn proc_stat_fields(pid: u32) -> Option<Vec<String>> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces and parentheses; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    Some(rest.split_whitespace().map(str::to_string).collect())
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    proc_stat_fields(pid)
        .and_then(|fields| fields.first().cloned())
        .map(|state| state == "Z" || state == "X")
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn proc_start_time(pid: u32) -> Option<SystemTime> {
    // Field 22 of /proc/<pid>/stat is the start time in clock ticks since boot;
    // after stripping pid and comm it sits at index 19.
    let ticks: u64 = proc_stat_fields(pid)?.get(19)?.parse().ok()?;
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_sec <= 0 {
        return None;
    }

    let boot_secs: u64 = std::fs::read_to_string("/proc/stat")
        .ok()?
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|v| v.trim().parse().ok())?;

    let since_boot = Duration::from_secs_f64(ticks as f64 / ticks_per_sec as f64);
    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(boot_secs) + since_boot)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn proc_start_time(_pid: u32) -> Option<SystemTime> {
    None
}

/// Poll `probe` until `pid` is gone or `timeout` elapses. Returns whether the
/// process exited within the window.
pub async fn wait_for_exit(probe: &dyn ProcessProbe, pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !probe.is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
