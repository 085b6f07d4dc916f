//! Data structures for tracking supervised processes.
//!
//! A Procfile entry (`ProcessSpec`) expands into one or more replicas, each
//! identified by a `ReplicaId`. Running replicas live in the `SupervisionTable`,
//! which is owned by the process manager and mutated only from its event loop.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::output::Color;

/// One `name: command` entry of the Procfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Logical process name (word characters only).
    pub name: String,
    /// Unparsed remainder of the Procfile line.
    pub command_line: String,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command_line: command_line.into(),
        }
    }
}

/// Identifies one replica of a logical process, displayed as `name-index`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaId {
    name: String,
    index: usize,
}

impl ReplicaId {
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }

    /// The logical process name this replica belongs to.
    pub fn base_name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.index)
    }
}

/// Everything needed to launch (and later relaunch) a replica.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub id: ReplicaId,
    pub command_line: String,
    pub working_dir: PathBuf,
    /// Complete environment of the child.
    pub env: HashMap<String, String>,
}

impl SpawnOptions {
    /// Splits the command line on single spaces into program and arguments.
    ///
    /// There is no quoting support: `a  b` yields an empty middle argument.
    pub fn program_and_args(&self) -> (&str, Vec<&str>) {
        let mut tokens = self.command_line.split(' ');
        let program = tokens.next().unwrap_or_default();
        (program, tokens.collect())
    }

    /// The `PORT` assigned to this replica, if any.
    pub fn port(&self) -> Option<&str> {
        self.env.get("PORT").map(String::as_str)
    }
}

/// A replica with a live OS process.
#[derive(Debug, Clone)]
pub struct RunningProcess {
    pub id: ReplicaId,
    pub pid: u32,
    /// Console color assigned when this generation was spawned.
    pub color: Color,
    /// Options of the initial spawn, reused verbatim on restart.
    pub options: Arc<SpawnOptions>,
}

/// Registry of running replicas keyed by replica id.
#[derive(Debug, Default)]
pub struct SupervisionTable {
    processes: BTreeMap<ReplicaId, RunningProcess>,
}

impl SupervisionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a replica, returning the generation it replaced.
    pub fn insert(&mut self, process: RunningProcess) -> Option<RunningProcess> {
        self.processes.insert(process.id.clone(), process)
    }

    pub fn get(&self, id: &ReplicaId) -> Option<&RunningProcess> {
        self.processes.get(id)
    }

    /// Removes `id` only if its current generation has the given pid.
    pub fn remove_if_pid(&mut self, id: &ReplicaId, pid: u32) -> Option<RunningProcess> {
        match self.processes.get(id) {
            Some(process) if process.pid == pid => self.processes.remove(id),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// All registered replicas of the logical process `name`, by index.
    pub fn find_by_base_name(&self, name: &str) -> Vec<ReplicaId> {
        self.processes
            .keys()
            .filter(|id| id.base_name() == name)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunningProcess> {
        self.processes.values()
    }
}
