//! Export of a Procfile into init-system configuration.
//!
//! Each format implements `Exporter`. Output is rendered from built-in
//! templates with `{{key}}` placeholders; any template can be replaced with
//! `--template name=path`.

mod inittab;
mod runit;
mod supervisord;
mod upstart;

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use regex::{Captures, Regex};

use crate::config::ExportOptions;
use crate::env::export_env;
use crate::parser::OrderedMap;
use crate::process::ProcessSpec;

pub use inittab::Inittab;
pub use runit::Runit;
pub use supervisord::Supervisord;
pub use upstart::Upstart;

/// Writes configuration for one init system.
pub trait Exporter {
    /// Format name used in messages, e.g. `Runit`.
    fn name(&self) -> &'static str;

    fn write_templates(&self, processes: &[ProcessSpec], options: &ExportOptions) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Inittab,
    Runit,
    Supervisord,
    Upstart,
}

impl ExportFormat {
    pub fn exporter(self) -> Box<dyn Exporter + Send> {
        match self {
            ExportFormat::Inittab => Box::new(Inittab),
            ExportFormat::Runit => Box::new(Runit),
            ExportFormat::Supervisord => Box::new(Supervisord),
            ExportFormat::Upstart => Box::new(Upstart),
        }
    }
}

/// One replica of an exported process.
#[derive(Debug, Clone)]
pub struct ExportReplica<'a> {
    pub process: &'a ProcessSpec,
    pub index: usize,
    pub port: u32,
    /// `PORT`, then env-file variables, then inline command variables.
    pub env: OrderedMap<String>,
}

impl ExportReplica<'_> {
    pub fn name(&self) -> &str {
        &self.process.name
    }

    pub fn command(&self) -> &str {
        &self.process.command_line
    }
}

/// Expands processes into replicas with the same numbering as `start`: one
/// port counter runs across all process names.
pub fn expand_replicas<'a>(processes: &'a [ProcessSpec], options: &ExportOptions) -> Vec<ExportReplica<'a>> {
    let mut port = u32::from(options.port);
    let mut replicas = Vec::new();
    for process in processes {
        for index in 0..options.replica_count(&process.name) {
            replicas.push(ExportReplica {
                process,
                index,
                port,
                env: export_env(port, &options.env_vars, &process.command_line),
            });
            port += 1;
        }
    }
    replicas
}

pub fn require_location<'a>(format: &str, options: &'a ExportOptions) -> Result<&'a Path> {
    options
        .location
        .as_deref()
        .ok_or_else(|| anyhow!("{} requires a location argument", format))
}

/// Returns the override for template `name`, or `builtin`.
pub fn load_template(name: &str, builtin: &str, options: &ExportOptions) -> Result<String> {
    match options.templates.get(name) {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Error reading template {} from {}", name, path.display())),
        None => Ok(builtin.to_string()),
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex"))
}

/// Substitutes `{{key}}` placeholders. Unknown keys render as empty text.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &Captures| {
            values
                .iter()
                .find(|(key, _)| *key == &caps[1])
                .map(|(_, value)| value.to_string())
                .unwrap_or_default()
        })
        .into_owned()
}

/// Removes `<app>*.conf` files left in `location` by an earlier export.
pub fn remove_previous_configs(location: &Path, app: &str) -> Result<()> {
    let entries = match std::fs::read_dir(location) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("Error reading {}", location.display())),
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("Error reading {}", location.display()))?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if file_name.starts_with(app) && file_name.ends_with(".conf") {
            tracing::debug!("[forewoman] removing previous config {}", file_name);
            std::fs::remove_file(entry.path())
                .with_context(|| format!("Error removing {}", entry.path().display()))?;
        }
    }
    Ok(())
}

pub fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("Error creating directory {}", path.display()))
}

pub fn write_file(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).with_context(|| format!("Error writing {}", path.display()))?;
    tracing::info!("[forewoman] wrote {}", path.display());
    Ok(())
}

/// Writes a script with mode 0755.
pub fn write_executable(path: &Path, content: &str) -> Result<()> {
    write_file(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Error setting permissions on {}", path.display()))?;
    }
    Ok(())
}

/// Hands `path` to `user` with the system `chown`.
pub fn chown(user: &str, path: &Path) -> Result<()> {
    let status = std::process::Command::new("chown")
        .arg(user)
        .arg(path)
        .status()
        .context("Error running chown")?;
    if !status.success() {
        return Err(anyhow!("chown {} {} failed: {}", user, path.display(), status));
    }
    Ok(())
}
