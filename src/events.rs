//! Event definitions for the supervisor event loop.
//!
//! Reader tasks, exit waiters and watcher threads never touch the supervision
//! table directly; they send an `Event` and the process manager applies it.

use std::fmt;
use std::path::PathBuf;

use crate::output::Color;
use crate::process::ReplicaId;

/// Represents an event in the supervisor's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A line of output (stdout or stderr) was received from a replica.
    ProcessOutput {
        id: ReplicaId,
        color: Color,
        line: String,
    },
    /// The replica generation with `pid` has exited.
    ProcessExited {
        id: ReplicaId,
        pid: u32,
        color: Color,
        report: ExitReport,
    },
    /// Watched files belonging to process group `name` changed.
    FileChanged { name: String, paths: Vec<PathBuf> },
}

/// How a replica ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReport {
    /// Exited normally with a status code.
    Code(i32),
    /// Terminated by a signal.
    Signal(i32),
    /// Could not be launched or waited on.
    Error(String),
}

impl ExitReport {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitReport::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitReport::Signal(signal);
            }
        }
        ExitReport::Error(status.to_string())
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReport::Code(code) => write!(f, "exited with code {}", code),
            ExitReport::Signal(signal) => write!(f, "exited with signal {}", signal),
            ExitReport::Error(error) => write!(f, "exited with error: {}", error),
        }
    }
}
