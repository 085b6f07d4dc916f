//! Process execution and supervision.
//!
//! The `ProcessManager` owns the supervision table, the watch registry and the
//! watcher handles. It is driven by a single event loop: output readers, exit
//! waiters and watcher threads only send `Event`s, so every mutation of the
//! table happens on one control flow.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::config::RunOptions;
use crate::env::resolve_env;
use crate::events::{Event, ExitReport};
use crate::output::{Color, Console};
use crate::parser::OrderedMap;
use crate::pidfile::{kill_from_pid_file, remove_pid_file, write_pid_file};
use crate::process::{ProcessSpec, ReplicaId, RunningProcess, SpawnOptions, SupervisionTable};
use crate::watch::{FileWatchers, WatchRegistry};

/// Spawns, tracks and restarts the replicas of one run.
pub struct ProcessManager {
    options: RunOptions,
    table: SupervisionTable,
    registry: WatchRegistry,
    watchers: FileWatchers,
    console: Console,
    event_tx: mpsc::Sender<Event>,
}

impl ProcessManager {
    pub fn new(options: RunOptions, console: Console, event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            options,
            table: SupervisionTable::new(),
            registry: WatchRegistry::new(),
            watchers: FileWatchers::default(),
            console,
            event_tx,
        }
    }

    /// Starts watcher threads for the configured watch specs.
    pub fn arm_watchers(&mut self) {
        if self.options.watch.is_empty() {
            return;
        }
        self.watchers = FileWatchers::arm(&self.options.watch, self.event_tx.clone());
    }

    /// Spawns every replica of every process in manifest order.
    ///
    /// Ports come from one counter shared by all process names, so with
    /// `web=2` followed by `worker` the ports are 5000, 5001 and 5002.
    pub async fn spawn_all(
        &mut self,
        specs: &[ProcessSpec],
        base_env: &HashMap<String, String>,
        file_vars: &OrderedMap<String>,
    ) {
        let mut port = u32::from(self.options.port);
        for spec in specs {
            let count = self.options.replica_count(&spec.name);
            for index in 0..count {
                let options = SpawnOptions {
                    id: ReplicaId::new(&spec.name, index),
                    command_line: spec.command_line.clone(),
                    working_dir: self.options.working_dir.clone(),
                    env: resolve_env(base_env, file_vars, port),
                };
                port += 1;
                self.spawn(Arc::new(options)).await;
            }
        }
    }

    /// Launches one replica and registers it in the table.
    ///
    /// A program that cannot be started is reported like an abnormal exit;
    /// this never fails.
    pub async fn spawn(&mut self, options: Arc<SpawnOptions>) {
        let id = options.id.clone();
        let color = Color::for_slot(self.table.len());
        let (program, args) = options.program_and_args();

        let mut command = Command::new(program);
        command
            .args(&args)
            .current_dir(&options.working_dir)
            .env_clear()
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.console.exited(&id, color, &ExitReport::Error(err.to_string()));
                if self.table.get(&id).is_none() {
                    self.release(&id).await;
                }
                return;
            }
        };
        let pid = child.id().unwrap_or(0);
        if let Err(err) = write_pid_file(&self.options.pid_dir, &id, pid).await {
            tracing::error!("[forewoman] {:#}", err);
        }
        tracing::debug!(
            "[forewoman] started {} (pid {}, port {}): {}",
            id,
            pid,
            options.port().unwrap_or("-"),
            shell_words::join(std::iter::once(program).chain(args.iter().copied()))
        );

        tokio::spawn(supervise_child(id.clone(), pid, color, child, self.event_tx.clone()));
        self.table.insert(RunningProcess {
            id,
            pid,
            color,
            options,
        });
    }

    /// Applies one event to the supervision state.
    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::ProcessOutput { id, color, line } => self.console.line(&id, color, &line),
            Event::ProcessExited {
                id,
                pid,
                color,
                report,
            } => {
                self.console.exited(&id, color, &report);
                // Exits of killed generations arrive after their replacement is registered.
                if self.table.remove_if_pid(&id, pid).is_some() {
                    self.release(&id).await;
                }
            }
            Event::FileChanged { name, paths } => self.restart_group(&name, &paths).await,
        }
    }

    /// Processes events until no replica is left running.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<Event>) {
        while !self.table.is_empty() {
            let Some(event) = event_rx.recv().await else {
                break;
            };
            self.handle_event(event).await;
        }
        tracing::info!("[forewoman] all processes exited");
    }

    // Kill every replica of `name` through its PID file and spawn it again
    // with the options it was first started with.
    async fn restart_group(&mut self, name: &str, paths: &[std::path::PathBuf]) {
        let ids = self.table.find_by_base_name(name);
        if ids.is_empty() {
            tracing::debug!("[forewoman] change ignored, {} is not running", name);
            return;
        }
        tracing::info!("[forewoman] files changed, restarting {}", name);
        for id in &ids {
            for path in paths {
                self.registry.record(id, path);
            }
            tracing::debug!(
                "[forewoman] {} now tracks {} watched files",
                id,
                self.registry.watched_by(id).len()
            );
        }

        for id in ids {
            if let Err(err) = kill_from_pid_file(&self.options.pid_dir, &id).await {
                tracing::error!("[forewoman] Error stopping the process {}: {:#}", id, err);
                continue;
            }
            let Some(options) = self.table.get(&id).map(|process| process.options.clone()) else {
                continue;
            };
            self.spawn(options).await;
        }
    }

    // Drop the bookkeeping of a replica that is gone for good.
    async fn release(&mut self, id: &ReplicaId) {
        if let Err(err) = remove_pid_file(&self.options.pid_dir, id).await {
            tracing::error!("[forewoman] {:#}", err);
        }
        let unwatched = self.registry.release(id);
        if !unwatched.is_empty() {
            self.watchers.unwatch(id.base_name(), unwatched);
        }
    }
}

// Forward both output streams, then report the exit once they are drained.
async fn supervise_child(id: ReplicaId, pid: u32, color: Color, mut child: Child, tx: mpsc::Sender<Event>) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::join!(
        async {
            if let Some(stdout) = stdout {
                read_stream(&id, color, stdout, &tx).await;
            }
        },
        async {
            if let Some(stderr) = stderr {
                read_stream(&id, color, stderr, &tx).await;
            }
        }
    );
    let report = match child.wait().await {
        Ok(status) => ExitReport::from_status(status),
        Err(err) => ExitReport::Error(err.to_string()),
    };
    let _ = tx
        .send(Event::ProcessExited {
            id,
            pid,
            color,
            report,
        })
        .await;
}

async fn read_stream<R>(id: &ReplicaId, color: Color, reader: R, tx: &mpsc::Sender<Event>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                let _ = tx
                    .send(Event::ProcessOutput {
                        id: id.clone(),
                        color,
                        line,
                    })
                    .await;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::parser::parse_procfile;
    use crate::pidfile::{pid_file_path, read_pid_file};

    fn test_options(dir: &Path, concurrency: &[(&str, usize)]) -> RunOptions {
        RunOptions {
            procfile: dir.join("Procfile"),
            working_dir: dir.to_path_buf(),
            concurrency: concurrency
                .iter()
                .map(|(name, count)| (name.to_string(), *count))
                .collect(),
            port: 5000,
            env_files: None,
            watch: BTreeMap::new(),
            pid_dir: dir.join("tmp").join("pids"),
            process: None,
        }
    }

    fn inherited_env() -> HashMap<String, String> {
        std::env::vars().collect()
    }

    fn console_text(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
        String::from_utf8(buffer.lock().unwrap().clone()).unwrap()
    }

    async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    async fn drain(manager: &mut ProcessManager, rx: &mut mpsc::Receiver<Event>) {
        while !manager.table.is_empty() {
            let event = next_event(rx).await;
            manager.handle_event(event).await;
        }
    }

    fn pids(manager: &ProcessManager) -> Vec<(String, u32)> {
        manager
            .table
            .iter()
            .map(|process| (process.id.to_string(), process.pid))
            .collect()
    }

    #[tokio::test]
    async fn ports_follow_one_counter_across_process_names() {
        let dir = tempfile::tempdir().unwrap();
        let specs = parse_procfile("server1: printenv PORT\nserver2: printenv PORT");
        let (console, buffer) = Console::buffered();
        let (tx, mut rx) = mpsc::channel(64);
        let mut manager = ProcessManager::new(test_options(dir.path(), &[("server1", 2)]), console, tx);

        manager.spawn_all(&specs, &inherited_env(), &OrderedMap::new()).await;
        let ports: Vec<(String, String)> = manager
            .table
            .iter()
            .map(|p| (p.id.to_string(), p.options.port().unwrap().to_string()))
            .collect();
        assert_eq!(
            ports,
            vec![
                ("server1-0".to_string(), "5000".to_string()),
                ("server1-1".to_string(), "5001".to_string()),
                ("server2-0".to_string(), "5002".to_string()),
            ]
        );

        drain(&mut manager, &mut rx).await;
        let text = console_text(&buffer);
        assert!(text.contains("[server1-0] 5000\n"));
        assert!(text.contains("[server1-1] 5001\n"));
        assert!(text.contains("[server2-0] 5002\n"));
        assert_eq!(text.matches("exited with code 0").count(), 3);
    }

    #[tokio::test]
    async fn env_file_variables_reach_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let specs = parse_procfile("web: printenv SERVER_MSG");
        let (console, buffer) = Console::buffered();
        let (tx, mut rx) = mpsc::channel(64);
        let mut manager = ProcessManager::new(test_options(dir.path(), &[]), console, tx);
        let file_vars = crate::env::parse_env_content("SERVER_MSG=hello from env");

        manager.spawn_all(&specs, &inherited_env(), &file_vars).await;
        drain(&mut manager, &mut rx).await;
        let text = console_text(&buffer);
        assert!(text.contains("[web-0] hello from env\n"));
        assert!(text.contains("[web-0] exited with code 0"));
    }

    #[tokio::test]
    async fn pid_files_track_table_membership() {
        let dir = tempfile::tempdir().unwrap();
        let specs = parse_procfile("worker: sleep 0.2");
        let (console, _buffer) = Console::buffered();
        let (tx, mut rx) = mpsc::channel(64);
        let options = test_options(dir.path(), &[]);
        let pid_dir = options.pid_dir.clone();
        let mut manager = ProcessManager::new(options, console, tx);

        manager.spawn_all(&specs, &inherited_env(), &OrderedMap::new()).await;
        let id = ReplicaId::new("worker", 0);
        let pid = manager.table.get(&id).unwrap().pid;
        assert_eq!(read_pid_file(&pid_dir, &id).await.unwrap(), pid);

        drain(&mut manager, &mut rx).await;
        assert!(!pid_file_path(&pid_dir, &id).exists());
    }

    #[tokio::test]
    async fn a_missing_program_is_reported_as_an_exit_and_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let specs = parse_procfile("bad: forewoman-no-such-program --flag\ngood: echo ok");
        let (console, buffer) = Console::buffered();
        let (tx, mut rx) = mpsc::channel(64);
        let mut manager = ProcessManager::new(test_options(dir.path(), &[]), console, tx);

        manager.spawn_all(&specs, &inherited_env(), &OrderedMap::new()).await;
        assert!(manager.table.get(&ReplicaId::new("bad", 0)).is_none());
        assert!(manager.table.get(&ReplicaId::new("good", 0)).is_some());

        drain(&mut manager, &mut rx).await;
        let text = console_text(&buffer);
        assert!(text.contains("[bad-0] exited with error:"));
        assert!(text.contains("[good-0] ok\n"));
    }

    #[tokio::test]
    async fn file_change_restarts_every_replica_of_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let specs = parse_procfile("server1: sleep 30\nserver2: sleep 30");
        let (console, buffer) = Console::buffered();
        let (tx, mut rx) = mpsc::channel(64);
        let options = test_options(dir.path(), &[("server1", 2)]);
        let pid_dir = options.pid_dir.clone();
        let mut manager = ProcessManager::new(options, console, tx);
        manager.spawn_all(&specs, &inherited_env(), &OrderedMap::new()).await;
        let before = pids(&manager);
        let original_env = manager.table.get(&ReplicaId::new("server1", 1)).unwrap().options.env.clone();

        let changed = PathBuf::from("/app/server.js");
        manager
            .handle_event(Event::FileChanged {
                name: "server1".to_string(),
                paths: vec![changed.clone()],
            })
            .await;
        let after = pids(&manager);
        assert_eq!(after.len(), 3);
        assert_ne!(after[0].1, before[0].1);
        assert_ne!(after[1].1, before[1].1);
        assert_eq!(after[2], before[2]);

        for (name, pid) in &after[..2] {
            let index = name.rsplit('-').next().unwrap().parse().unwrap();
            let id = ReplicaId::new("server1", index);
            assert_eq!(read_pid_file(&pid_dir, &id).await.unwrap(), *pid);
            assert_eq!(manager.registry.watched_by(&id), vec![changed.clone()]);
        }
        let respawned = manager.table.get(&ReplicaId::new("server1", 1)).unwrap();
        assert_eq!(respawned.options.env, original_env);

        // The killed generations exit without disturbing their replacements.
        let mut stale_exits = 0;
        while stale_exits < 2 {
            let event = next_event(&mut rx).await;
            if matches!(event, Event::ProcessExited { .. }) {
                stale_exits += 1;
            }
            manager.handle_event(event).await;
        }
        assert_eq!(pids(&manager), after);
        for (name, _) in &after {
            assert!(pid_dir.join(format!("{}.pid", name)).exists());
        }

        for (_, pid) in &after {
            crate::pidfile::terminate(*pid).unwrap();
        }
        drain(&mut manager, &mut rx).await;
        assert!(manager.registry.watched_by(&ReplicaId::new("server1", 0)).is_empty());
        assert!(!pid_dir.join("server1-0.pid").exists());
        assert_eq!(console_text(&buffer).matches("exited with signal 15").count(), 5);
    }

    #[tokio::test]
    async fn restart_is_abandoned_without_a_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let specs = parse_procfile("server1: sleep 30");
        let (console, _buffer) = Console::buffered();
        let (tx, mut rx) = mpsc::channel(64);
        let options = test_options(dir.path(), &[("server1", 2)]);
        let pid_dir = options.pid_dir.clone();
        let mut manager = ProcessManager::new(options, console, tx);
        manager.spawn_all(&specs, &inherited_env(), &OrderedMap::new()).await;
        let before = pids(&manager);
        std::fs::remove_file(pid_dir.join("server1-0.pid")).unwrap();

        manager
            .handle_event(Event::FileChanged {
                name: "server1".to_string(),
                paths: vec![PathBuf::from("/app/server.js")],
            })
            .await;
        let after = pids(&manager);
        assert_eq!(after[0], before[0]);
        assert_ne!(after[1], before[1]);

        for (_, pid) in &after {
            crate::pidfile::terminate(*pid).unwrap();
        }
        drain(&mut manager, &mut rx).await;
    }

    #[tokio::test]
    async fn respawn_takes_a_color_from_the_current_table_size() {
        let dir = tempfile::tempdir().unwrap();
        let specs = parse_procfile("a: sleep 30\nb: sleep 30");
        let (console, _buffer) = Console::buffered();
        let (tx, mut rx) = mpsc::channel(64);
        let mut manager = ProcessManager::new(test_options(dir.path(), &[]), console, tx);
        manager.spawn_all(&specs, &inherited_env(), &OrderedMap::new()).await;
        let a = ReplicaId::new("a", 0);
        assert_eq!(manager.table.get(&a).unwrap().color, Color::Yellow);
        assert_eq!(manager.table.get(&ReplicaId::new("b", 0)).unwrap().color, Color::Cyan);

        manager
            .handle_event(Event::FileChanged {
                name: "a".to_string(),
                paths: vec![PathBuf::from("/app/a.js")],
            })
            .await;
        assert_eq!(manager.table.get(&a).unwrap().color, Color::Magenta);

        let live: Vec<u32> = manager.table.iter().map(|p| p.pid).collect();
        for pid in live {
            crate::pidfile::terminate(pid).unwrap();
        }
        drain(&mut manager, &mut rx).await;
    }
}
