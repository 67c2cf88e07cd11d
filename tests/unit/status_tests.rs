//! Unit tests for exit status mapping on both sides of the wire.

use rexec::client::exit_code_for_status;
use rexec::proto::{STATUS_SPAWN_FAILED, STATUS_WAIT_FAILED};
#[cfg(unix)]
use rexec::server::executor::map_exit_status;

// ── Server-side mapping ──────────────────────────────────────────────────────

/// A normal exit yields its code directly.
#[cfg(unix)]
#[test]
fn normal_exit_maps_to_its_code() {
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    // Raw wait status: exit code in the high byte.
    let status = ExitStatus::from_raw(42 << 8);
    assert_eq!(map_exit_status(status), 42);
}

/// Exit code zero maps to zero.
#[cfg(unix)]
#[test]
fn successful_exit_maps_to_zero() {
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    let status = ExitStatus::from_raw(0);
    assert_eq!(map_exit_status(status), 0);
}

/// A signal death yields `128 + signal`, the shell convention.
#[cfg(unix)]
#[test]
fn signal_death_maps_to_shell_convention() {
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    // Raw wait status: termination signal in the low seven bits.
    let status = ExitStatus::from_raw(9);
    assert_eq!(map_exit_status(status), 128 + 9);

    let status = ExitStatus::from_raw(15);
    assert_eq!(map_exit_status(status), 128 + 15);
}

// ── Client-side mapping ──────────────────────────────────────────────────────

/// Real process results pass through unchanged, across the full range.
#[test]
fn real_statuses_pass_through() {
    assert_eq!(exit_code_for_status(0), 0);
    assert_eq!(exit_code_for_status(1), 1);
    assert_eq!(exit_code_for_status(42), 42);
    assert_eq!(exit_code_for_status(143), 143);
    assert_eq!(exit_code_for_status(255), 255);
}

/// The spawn-failure sentinel maps to the shell's command-not-found code.
#[test]
fn spawn_failure_maps_to_127() {
    assert_eq!(exit_code_for_status(STATUS_SPAWN_FAILED), 127);
}

/// Any other out-of-range status maps to the reserved fallback code.
#[test]
fn out_of_range_statuses_map_to_254() {
    assert_eq!(exit_code_for_status(STATUS_WAIT_FAILED), 254);
    assert_eq!(exit_code_for_status(-17), 254);
    assert_eq!(exit_code_for_status(999), 254);
}
