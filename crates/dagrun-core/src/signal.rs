//! OS signal table
//!
//! Maps signal names to numbers and classifies each as terminating or not.
//! The table is per-platform, built once at first use, and read-only
//! thereafter. Unknown names resolve to SIGTERM unless a fallback is given.

use std::collections::HashMap;
use std::sync::OnceLock;

/// SIGHUP
pub const SIGHUP: i32 = 1;
/// SIGINT
pub const SIGINT: i32 = 2;
/// SIGKILL
pub const SIGKILL: i32 = 9;
/// SIGTERM
pub const SIGTERM: i32 = 15;

/// One row of the signal table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo {
    pub name: &'static str,
    pub number: i32,
    /// Whether default delivery terminates the receiving process
    pub terminating: bool,
}

#[cfg(unix)]
fn build_table() -> Vec<SignalInfo> {
    // POSIX baseline, Linux numbering. Non-terminating signals are the
    // job-control and informational ones; everything else (termination
    // requests, fault signals, timers) terminates by default.
    vec![
        SignalInfo { name: "SIGHUP", number: 1, terminating: true },
        SignalInfo { name: "SIGINT", number: 2, terminating: true },
        SignalInfo { name: "SIGQUIT", number: 3, terminating: true },
        SignalInfo { name: "SIGILL", number: 4, terminating: true },
        SignalInfo { name: "SIGTRAP", number: 5, terminating: true },
        SignalInfo { name: "SIGABRT", number: 6, terminating: true },
        SignalInfo { name: "SIGBUS", number: 7, terminating: true },
        SignalInfo { name: "SIGFPE", number: 8, terminating: true },
        SignalInfo { name: "SIGKILL", number: 9, terminating: true },
        SignalInfo { name: "SIGUSR1", number: 10, terminating: true },
        SignalInfo { name: "SIGSEGV", number: 11, terminating: true },
        SignalInfo { name: "SIGUSR2", number: 12, terminating: true },
        SignalInfo { name: "SIGPIPE", number: 13, terminating: true },
        SignalInfo { name: "SIGALRM", number: 14, terminating: true },
        SignalInfo { name: "SIGTERM", number: 15, terminating: true },
        SignalInfo { name: "SIGSTKFLT", number: 16, terminating: true },
        SignalInfo { name: "SIGCHLD", number: 17, terminating: false },
        SignalInfo { name: "SIGCONT", number: 18, terminating: false },
        SignalInfo { name: "SIGSTOP", number: 19, terminating: false },
        SignalInfo { name: "SIGTSTP", number: 20, terminating: true },
        SignalInfo { name: "SIGTTIN", number: 21, terminating: false },
        SignalInfo { name: "SIGTTOU", number: 22, terminating: false },
        SignalInfo { name: "SIGURG", number: 23, terminating: false },
        SignalInfo { name: "SIGXCPU", number: 24, terminating: true },
        SignalInfo { name: "SIGXFSZ", number: 25, terminating: true },
        SignalInfo { name: "SIGVTALRM", number: 26, terminating: true },
        SignalInfo { name: "SIGPROF", number: 27, terminating: true },
        SignalInfo { name: "SIGWINCH", number: 28, terminating: false },
        SignalInfo { name: "SIGIO", number: 29, terminating: true },
        SignalInfo { name: "SIGPWR", number: 30, terminating: true },
        SignalInfo { name: "SIGSYS", number: 31, terminating: true },
    ]
}

#[cfg(windows)]
fn build_table() -> Vec<SignalInfo> {
    // Windows recognizes only this subset; anything else maps to SIGTERM.
    vec![
        SignalInfo { name: "SIGHUP", number: 1, terminating: true },
        SignalInfo { name: "SIGINT", number: 2, terminating: true },
        SignalInfo { name: "SIGILL", number: 4, terminating: true },
        SignalInfo { name: "SIGFPE", number: 8, terminating: true },
        SignalInfo { name: "SIGKILL", number: 9, terminating: true },
        SignalInfo { name: "SIGSEGV", number: 11, terminating: true },
        SignalInfo { name: "SIGTERM", number: 15, terminating: true },
        SignalInfo { name: "SIGABRT", number: 22, terminating: true },
    ]
}

fn by_name() -> &'static HashMap<&'static str, SignalInfo> {
    static TABLE: OnceLock<HashMap<&'static str, SignalInfo>> = OnceLock::new();
    TABLE.get_or_init(|| build_table().into_iter().map(|s| (s.name, s)).collect())
}

/// Look up a signal by name.
pub fn lookup(name: &str) -> Option<SignalInfo> {
    by_name().get(name).copied()
}

/// Resolve a signal name to its number, falling back to SIGTERM.
pub fn signal_num(name: &str) -> i32 {
    signal_num_or(name, SIGTERM)
}

/// Resolve a signal name to its number with an explicit fallback.
pub fn signal_num_or(name: &str, fallback: i32) -> i32 {
    lookup(name).map(|s| s.number).unwrap_or(fallback)
}

/// Resolve a signal number back to its name.
pub fn signal_name(number: i32) -> Option<&'static str> {
    by_name()
        .values()
        .find(|s| s.number == number)
        .map(|s| s.name)
}

/// Whether default delivery of the named signal terminates a process.
///
/// Unknown names classify as terminating, matching the SIGTERM fallback.
pub fn is_terminating(name: &str) -> bool {
    lookup(name).map(|s| s.terminating).unwrap_or(true)
}

/// Convert a signal number to a [`nix`] signal for delivery.
#[cfg(unix)]
pub fn to_nix(number: i32) -> Option<nix::sys::signal::Signal> {
    nix::sys::signal::Signal::try_from(number).ok()
}
