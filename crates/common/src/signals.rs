//! Signal name table
//!
//! Steps declare `signal_on_stop` by name; the node runtime translates to
//! numbers when forwarding to executors. Numbers follow the Linux
//! convention.

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGKILL: i32 = 9;
pub const SIGUSR1: i32 = 10;
pub const SIGUSR2: i32 = 12;
pub const SIGTERM: i32 = 15;

/// Resolve a signal name (with or without the `SIG` prefix, any case).
#[must_use]
pub fn signal_from_name(name: &str) -> Option<i32> {
    let upper = name.trim().to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    match bare {
        "HUP" => Some(SIGHUP),
        "INT" => Some(SIGINT),
        "QUIT" => Some(SIGQUIT),
        "KILL" => Some(SIGKILL),
        "USR1" => Some(SIGUSR1),
        "USR2" => Some(SIGUSR2),
        "TERM" => Some(SIGTERM),
        _ => None,
    }
}

/// Canonical name for a signal number.
#[must_use]
pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGHUP => "SIGHUP",
        SIGINT => "SIGINT",
        SIGQUIT => "SIGQUIT",
        SIGKILL => "SIGKILL",
        SIGUSR1 => "SIGUSR1",
        SIGUSR2 => "SIGUSR2",
        SIGTERM => "SIGTERM",
        _ => "UNKNOWN",
    }
}

/// Whether the signal requests process termination.
#[must_use]
pub fn is_termination_signal(signal: i32) -> bool {
    matches!(signal, SIGHUP | SIGINT | SIGQUIT | SIGKILL | SIGTERM)
}
