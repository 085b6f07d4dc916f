//! Configuration management for forewoman.
//!
//! Options come from the command line, optionally backed by a
//! `.forewoman.toml` file whose values act as defaults. This module defines
//! that file's structure and resolves both layers into `RunOptions` for
//! `start` and `ExportOptions` for `export`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;

use crate::parser::{absolutize, parse_concurrency, parse_template_overrides, parse_watch_spec, OrderedMap};

pub const CONFIG_FILE: &str = ".forewoman.toml";
pub const DEFAULT_PORT: u16 = 5000;

/// Options shared by `start` and `export`.
///
/// The same struct is read from the command line and from the config file;
/// command-line values win.
#[derive(Debug, Clone, Default, Deserialize, Args)]
pub struct ProcfileArgs {
    /// Procfile path (default: <directory>/Procfile).
    #[arg(short = 'f', long)]
    pub procfile: Option<String>,
    /// Working directory of the processes.
    #[arg(short = 'd', long)]
    pub directory: Option<String>,
    /// Comma-separated env files (default: .env in the working directory).
    #[arg(short = 'e', long)]
    pub env: Option<String>,
    /// Base port; each replica gets the next one.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,
    /// Replica counts, e.g. "web=2,worker=3".
    #[arg(short = 'c', long)]
    pub concurrency: Option<String>,
}

impl ProcfileArgs {
    /// Fills every unset value from `defaults`.
    pub fn or(self, defaults: &ProcfileArgs) -> Self {
        Self {
            procfile: self.procfile.or_else(|| defaults.procfile.clone()),
            directory: self.directory.or_else(|| defaults.directory.clone()),
            env: self.env.or_else(|| defaults.env.clone()),
            port: self.port.or(defaults.port),
            concurrency: self.concurrency.or_else(|| defaults.concurrency.clone()),
        }
    }
}

/// Top-level structure of `.forewoman.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub procfile: ProcfileArgs,
    /// Watch specs for `start`, e.g. "web=src".
    pub watch: Option<String>,
    #[serde(default)]
    pub export: ExportConfig,
}

/// The `[export]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportConfig {
    pub app: Option<String>,
    pub user: Option<String>,
    pub log: Option<String>,
    pub template: Option<String>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Finds the config to use: an explicit path must exist, the implicit
/// `.forewoman.toml` in `cwd` is optional.
pub fn discover_config(explicit: Option<&Path>, no_config: bool, cwd: &Path) -> Result<Config> {
    if no_config {
        return Ok(Config::default());
    }
    if let Some(path) = explicit {
        return load_config(path);
    }
    let implicit = cwd.join(CONFIG_FILE);
    if implicit.is_file() {
        tracing::debug!("[forewoman] using {}", implicit.display());
        return load_config(&implicit);
    }
    Ok(Config::default())
}

/// Replica count for `name`; a missing or zero entry means one replica.
pub fn replica_count(concurrency: &HashMap<String, usize>, name: &str) -> usize {
    match concurrency.get(name) {
        Some(&count) if count > 0 => count,
        _ => 1,
    }
}

/// Resolved configuration of a `start` run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub procfile: PathBuf,
    pub working_dir: PathBuf,
    pub concurrency: HashMap<String, usize>,
    pub port: u16,
    pub env_files: Option<Vec<PathBuf>>,
    pub watch: BTreeMap<String, PathBuf>,
    pub pid_dir: PathBuf,
    /// Restricts the run to one process of the Procfile.
    pub process: Option<String>,
}

impl RunOptions {
    pub fn resolve(args: &ProcfileArgs, watch: Option<&str>, process: Option<String>, cwd: &Path) -> Result<Self> {
        let (procfile, working_dir) = resolve_paths(args, cwd);
        Ok(Self {
            procfile,
            working_dir,
            concurrency: resolve_concurrency(args)?,
            port: args.port.unwrap_or(DEFAULT_PORT),
            env_files: resolve_env_files(args, cwd),
            watch: watch.map(|spec| parse_watch_spec(spec, cwd)).unwrap_or_default(),
            pid_dir: cwd.join("tmp").join("pids"),
            process,
        })
    }

    pub fn replica_count(&self, name: &str) -> usize {
        replica_count(&self.concurrency, name)
    }
}

/// Resolved configuration of an `export` run.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub procfile: PathBuf,
    pub working_dir: PathBuf,
    pub location: Option<PathBuf>,
    pub app: String,
    pub user: String,
    pub log_root: PathBuf,
    pub port: u16,
    pub concurrency: HashMap<String, usize>,
    pub env_files: Option<Vec<PathBuf>>,
    /// Env-file variables, loaded once before rendering.
    pub env_vars: OrderedMap<String>,
    pub templates: HashMap<String, PathBuf>,
}

impl ExportOptions {
    pub fn resolve(
        args: &ProcfileArgs,
        export: &ExportConfig,
        location: Option<&str>,
        cwd: &Path,
    ) -> Result<Self> {
        let (procfile, working_dir) = resolve_paths(args, cwd);
        let app = match &export.app {
            Some(app) => app.clone(),
            None => default_app_name(&working_dir),
        };
        let user = export.user.clone().unwrap_or_else(|| app.clone());
        let log_root = match &export.log {
            Some(log) => absolutize(cwd, log),
            None => PathBuf::from("/var/log").join(&app),
        };
        Ok(Self {
            procfile,
            working_dir,
            location: location.map(|location| absolutize(cwd, location)),
            app,
            user,
            log_root,
            port: args.port.unwrap_or(DEFAULT_PORT),
            concurrency: resolve_concurrency(args)?,
            env_files: resolve_env_files(args, cwd),
            env_vars: OrderedMap::new(),
            templates: export
                .template
                .as_deref()
                .map(|spec| parse_template_overrides(spec, cwd))
                .unwrap_or_default(),
        })
    }

    pub fn replica_count(&self, name: &str) -> usize {
        replica_count(&self.concurrency, name)
    }
}

// Working directory: -d, else the Procfile's directory, else cwd.
fn resolve_paths(args: &ProcfileArgs, cwd: &Path) -> (PathBuf, PathBuf) {
    let procfile = args.procfile.as_deref().map(|path| absolutize(cwd, path));
    let working_dir = match (&args.directory, &procfile) {
        (Some(directory), _) => absolutize(cwd, directory),
        (None, Some(procfile)) => procfile
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf()),
        (None, None) => cwd.to_path_buf(),
    };
    let procfile = procfile.unwrap_or_else(|| working_dir.join("Procfile"));
    (procfile, working_dir)
}

fn resolve_concurrency(args: &ProcfileArgs) -> Result<HashMap<String, usize>> {
    match args.concurrency.as_deref() {
        Some(spec) => parse_concurrency(spec),
        None => Ok(HashMap::new()),
    }
}

fn resolve_env_files(args: &ProcfileArgs, cwd: &Path) -> Option<Vec<PathBuf>> {
    let spec = args.env.as_deref()?;
    Some(
        spec.split(',')
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(|path| absolutize(cwd, path))
            .collect(),
    )
}

fn default_app_name(working_dir: &Path) -> String {
    working_dir
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("app")
        .to_string()
}
