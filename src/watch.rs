//! File watching and watch-triggered restarts.
//!
//! Each `name=path` watch spec gets a background thread. The path is resolved
//! to a flat list of files (a directory is walked recursively), the directory of
//! every file is registered with a `notify` watcher, and each debounced burst of
//! changes to those files is sent to the event loop as `Event::FileChanged`.
//! The event loop owns the `WatchRegistry`, which remembers which files
//! triggered restarts of which replica so they can be unwatched when that
//! replica exits.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::events::Event;
use crate::process::ReplicaId;

const DEBOUNCE: Duration = Duration::from_millis(100);

enum WatchMessage {
    Fs(notify::Result<NotifyEvent>),
    Unwatch(PathBuf),
}

/// Handles to the running watcher threads, one per process group.
#[derive(Default)]
pub struct FileWatchers {
    groups: HashMap<String, std::sync::mpsc::Sender<WatchMessage>>,
}

impl FileWatchers {
    /// Starts a watcher thread for every `(name, path)` pair.
    pub fn arm(watch: &BTreeMap<String, PathBuf>, tx: mpsc::Sender<Event>) -> Self {
        let mut groups = HashMap::new();
        for (name, root) in watch {
            let (msg_tx, msg_rx) = std::sync::mpsc::channel();
            let raw_tx = msg_tx.clone();
            let name = name.clone();
            let root = root.clone();
            let tx = tx.clone();
            groups.insert(name.clone(), msg_tx);
            std::thread::spawn(move || {
                if let Err(err) = watch_group(&name, &root, raw_tx, msg_rx, tx) {
                    tracing::error!("[forewoman] watcher for {} failed: {:#}", name, err);
                }
            });
        }
        Self { groups }
    }

    /// Stops watching `paths` on behalf of process group `name`.
    pub fn unwatch(&self, name: &str, paths: Vec<PathBuf>) {
        let Some(group) = self.groups.get(name) else {
            return;
        };
        for path in paths {
            let _ = group.send(WatchMessage::Unwatch(path));
        }
    }
}

fn watch_group(
    name: &str,
    root: &Path,
    raw_tx: std::sync::mpsc::Sender<WatchMessage>,
    rx: std::sync::mpsc::Receiver<WatchMessage>,
    tx: mpsc::Sender<Event>,
) -> Result<()> {
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = raw_tx.send(WatchMessage::Fs(res));
        },
        notify::Config::default(),
    )
    .context("failed to create watcher")?;

    // Directories are watched instead of files so that a save which renames a
    // new file over the old one keeps being seen.
    let mut watched = WatchedFiles::default();
    for file in resolve_watch_files(root) {
        if let Some(dir) = watched.add(&file) {
            if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                tracing::error!("[forewoman] Error watching {}: {}", dir.display(), err);
            }
        }
    }
    tracing::debug!("[forewoman] watching {} files for {}", watched.len(), name);

    loop {
        let first = match rx.recv() {
            Ok(WatchMessage::Fs(res)) => watched.matching(changed_paths(res)),
            Ok(WatchMessage::Unwatch(path)) => {
                stop_watching(&mut watcher, &mut watched, &path);
                continue;
            }
            Err(_) => break,
        };
        if first.is_empty() {
            continue;
        }

        let mut paths: BTreeSet<PathBuf> = first.into_iter().collect();
        let mut last = Instant::now();
        loop {
            let elapsed = last.elapsed();
            if elapsed >= DEBOUNCE {
                break;
            }
            match rx.recv_timeout(DEBOUNCE - elapsed) {
                Ok(WatchMessage::Fs(res)) => {
                    let more = watched.matching(changed_paths(res));
                    if !more.is_empty() {
                        paths.extend(more);
                        last = Instant::now();
                    }
                }
                Ok(WatchMessage::Unwatch(path)) => {
                    stop_watching(&mut watcher, &mut watched, &path);
                    paths.remove(&path);
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
        if paths.is_empty() {
            continue;
        }

        let event = Event::FileChanged {
            name: name.to_string(),
            paths: paths.into_iter().collect(),
        };
        if tx.blocking_send(event).is_err() {
            break;
        }
    }

    Ok(())
}

fn stop_watching(watcher: &mut RecommendedWatcher, watched: &mut WatchedFiles, path: &Path) {
    let Some(dir) = watched.remove(path) else {
        return;
    };
    if let Err(err) = watcher.unwatch(&dir) {
        tracing::debug!("[forewoman] failed to unwatch {}: {}", dir.display(), err);
    }
}

fn changed_paths(event: notify::Result<NotifyEvent>) -> Vec<PathBuf> {
    match event {
        Ok(event) if matches!(event.kind, EventKind::Access(_)) => Vec::new(),
        Ok(event) => event.paths,
        Err(err) => {
            tracing::error!("[forewoman] watch error: {}", err);
            Vec::new()
        }
    }
}

/// Files of one group and the directories watched on their behalf.
///
/// Paths are kept with their directory canonicalized, which is how the
/// watcher backends report them.
#[derive(Debug, Default)]
struct WatchedFiles {
    files: BTreeSet<PathBuf>,
    dirs: BTreeMap<PathBuf, usize>,
}

impl WatchedFiles {
    /// Adds `file`; returns its directory when that directory is new.
    fn add(&mut self, file: &Path) -> Option<PathBuf> {
        let file = normalize(file);
        let dir = file.parent()?.to_path_buf();
        if !self.files.insert(file) {
            return None;
        }
        let count = self.dirs.entry(dir.clone()).or_insert(0);
        *count += 1;
        (*count == 1).then_some(dir)
    }

    /// Removes `file`; returns its directory when nothing else there is watched.
    fn remove(&mut self, file: &Path) -> Option<PathBuf> {
        let file = normalize(file);
        if !self.files.remove(&file) {
            return None;
        }
        let dir = file.parent()?;
        let count = self.dirs.get_mut(dir)?;
        *count -= 1;
        if *count > 0 {
            return None;
        }
        self.dirs.remove(dir);
        Some(dir.to_path_buf())
    }

    fn matching(&self, paths: Vec<PathBuf>) -> Vec<PathBuf> {
        paths
            .iter()
            .map(|path| normalize(path))
            .filter(|path| self.files.contains(path))
            .collect()
    }

    fn len(&self) -> usize {
        self.files.len()
    }
}

fn normalize(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(dir), Some(name)) => match std::fs::canonicalize(dir) {
            Ok(dir) => dir.join(name),
            Err(_) => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}

/// Resolves a watch path to the files it covers.
///
/// A directory yields every file beneath it, hidden files included, following
/// symlinks. A file yields itself. A path that cannot be stat'ed is logged and
/// yields nothing.
pub fn resolve_watch_files(path: &Path) -> Vec<PathBuf> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) => {
            tracing::error!("[forewoman] Error retrieving stats for file: {}: {}", path.display(), err);
            return Vec::new();
        }
    };
    if !metadata.is_dir() {
        return vec![path.to_path_buf()];
    }

    let mut files = Vec::new();
    for entry in WalkBuilder::new(path)
        .standard_filters(false)
        .follow_links(true)
        .build()
    {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_some_and(|kind| kind.is_file()) {
                    files.push(entry.into_path());
                }
            }
            Err(err) => {
                tracing::error!("[forewoman] Error reading path: {}: {}", path.display(), err);
            }
        }
    }
    files.sort();
    files
}

/// Files that triggered restarts, per replica.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    by_replica: HashMap<ReplicaId, BTreeSet<PathBuf>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: &ReplicaId, path: &Path) {
        self.by_replica
            .entry(id.clone())
            .or_default()
            .insert(path.to_path_buf());
    }

    pub fn watched_by(&self, id: &ReplicaId) -> Vec<PathBuf> {
        self.by_replica
            .get(id)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forgets the files recorded for `id`.
    ///
    /// Returns the files no other replica of the same process group still
    /// holds; those can be unwatched.
    pub fn release(&mut self, id: &ReplicaId) -> Vec<PathBuf> {
        let Some(paths) = self.by_replica.remove(id) else {
            return Vec::new();
        };
        paths
            .into_iter()
            .filter(|path| {
                !self
                    .by_replica
                    .iter()
                    .any(|(other, held)| other.base_name() == id.base_name() && held.contains(path))
            })
            .collect()
    }
}
