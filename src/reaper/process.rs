// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! OS process identity and signalling.
//!
//! A pid alone never identifies a runtime instance: pids are recycled. An
//! instance counts as alive only while a process with its pid still runs
//! the argv recorded at launch.

use std::fmt;

use crate::error::ReaperError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Term => f.write_str("SIGTERM"),
            Signal::Kill => f.write_str("SIGKILL"),
        }
    }
}

/// View of the host's process table.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessTable: Send + Sync {
    /// Argv of a running process, `None` if there is none (or it is a zombie).
    fn cmdline(&self, pid: u32) -> Option<Vec<String>>;

    /// Deliver `signal` to `pid`. A process that is already gone is not an error.
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), ReaperError>;
}

/// Whether `actual` is the process launched with `recorded`.
///
/// The recorded argv must be a suffix of the live one, which tolerates the
/// interpreter the kernel prepends when the launched entry is a script.
pub fn command_matches(actual: &[String], recorded: &[String]) -> bool {
    !recorded.is_empty() && actual.len() >= recorded.len() && actual.ends_with(recorded)
}

/// Whether `pid` still runs `recorded`.
pub fn is_running(table: &dyn ProcessTable, pid: u32, recorded: &[String]) -> bool {
    table
        .cmdline(pid)
        .map(|actual| command_matches(&actual, recorded))
        .unwrap_or(false)
}

/// `/proc` and `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxProcessTable;

impl ProcessTable for LinuxProcessTable {
    fn cmdline(&self, pid: u32) -> Option<Vec<String>> {
        if pid == 0 {
            return None;
        }
        let raw = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
        let argv: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect();
        if argv.is_empty() {
            None
        } else {
            Some(argv)
        }
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), ReaperError> {
        let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
            return Err(ReaperError::SignalFailed {
                pid,
                message: "pid out of range".to_string(),
            });
        };
        if raw_pid <= 0 {
            return Err(ReaperError::SignalFailed {
                pid,
                message: "refusing to signal a process group wildcard".to_string(),
            });
        }

        // Spawned instances lead their own process group; take it down whole.
        // SAFETY: getpgid/kill take plain integers and have no memory effects.
        let target = if unsafe { libc::getpgid(raw_pid) } == raw_pid {
            -raw_pid
        } else {
            raw_pid
        };
        let rc = unsafe { libc::kill(target, signal.raw()) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(ReaperError::SignalFailed {
            pid,
            message: err.to_string(),
        })
    }

    #[cfg(not(unix))]
    fn signal(&self, pid: u32, _signal: Signal) -> Result<(), ReaperError> {
        Err(ReaperError::SignalFailed {
            pid,
            message: "signals are not supported on this platform".to_string(),
        })
    }
}
