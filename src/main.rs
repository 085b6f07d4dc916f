//! forewoman: run and export Procfile-based applications.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, layers them over `.forewoman.toml`, and either supervises the
//! Procfile's processes (`start`) or renders them for an init system
//! (`export`).

mod config;
mod env;
mod events;
mod export;
mod output;
mod parser;
mod pidfile;
mod process;
mod runner;
mod watch;

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::config::{discover_config, Config, ExportConfig, ExportOptions, ProcfileArgs, RunOptions};
use crate::env::load_env_files;
use crate::export::ExportFormat;
use crate::output::Console;
use crate::parser::parse_procfile;
use crate::process::ProcessSpec;
use crate::runner::ProcessManager;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "forewoman",
    version,
    about = "Run and export Procfile-based applications",
    styles = help_styles()
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to a .forewoman.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any .forewoman.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the processes of the Procfile.
    Start(StartArgs),
    /// Export the Procfile to an init system.
    Export(ExportArgs),
}

#[derive(Debug, Args)]
struct StartArgs {
    /// Only start this process.
    process: Option<String>,
    #[command(flatten)]
    procfile: ProcfileArgs,
    /// Restart a process when files change, e.g. "web=src,worker=lib".
    #[arg(short = 'w', long)]
    watch: Option<String>,
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Target init system.
    #[arg(value_enum)]
    format: ExportFormat,
    /// Where to write the configuration.
    location: Option<String>,
    #[command(flatten)]
    procfile: ProcfileArgs,
    /// Application name (default: name of the working directory).
    #[arg(short = 'a', long)]
    app: Option<String>,
    /// User to run the processes as (default: the application name).
    #[arg(short = 'u', long)]
    user: Option<String>,
    /// Log directory (default: /var/log/<app>).
    #[arg(short = 'l', long)]
    log: Option<String>,
    /// Template overrides, e.g. "run=templates/run".
    #[arg(short = 't', long)]
    template: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        tracing::error!("[forewoman] {:#}", err);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FOREWOMAN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to read the current directory")?;
    let config = discover_config(cli.config.as_deref(), cli.no_config, &cwd)?;
    match cli.command {
        Commands::Start(args) => start(args, config, &cwd).await,
        Commands::Export(args) => export(args, config, &cwd).await,
    }
}

async fn start(args: StartArgs, config: Config, cwd: &Path) -> Result<()> {
    let procfile_args = args.procfile.or(&config.procfile);
    let watch = args.watch.or(config.watch);
    let options = RunOptions::resolve(&procfile_args, watch.as_deref(), args.process, cwd)?;

    let specs = select_process(read_procfile(&options.procfile).await?, options.process.as_deref())?;
    let file_vars = load_env_files(options.env_files.as_deref(), &options.working_dir).await;
    let base_env = inherited_env();

    let (event_tx, event_rx) = mpsc::channel(256);
    let mut manager = ProcessManager::new(options, Console::stdout(), event_tx);
    manager.arm_watchers();
    manager.spawn_all(&specs, &base_env, &file_vars).await;
    manager.run(event_rx).await;
    Ok(())
}

async fn export(args: ExportArgs, config: Config, cwd: &Path) -> Result<()> {
    let procfile_args = args.procfile.or(&config.procfile);
    let export_config = ExportConfig {
        app: args.app.or(config.export.app),
        user: args.user.or(config.export.user),
        log: args.log.or(config.export.log),
        template: args.template.or(config.export.template),
    };
    let mut options = ExportOptions::resolve(&procfile_args, &export_config, args.location.as_deref(), cwd)?;
    let processes = read_procfile(&options.procfile).await?;
    options.env_vars = load_env_files(options.env_files.as_deref(), &options.working_dir).await;

    let exporter = args.format.exporter();
    tokio::task::spawn_blocking(move || exporter.write_templates(&processes, &options))
        .await
        .context("export task failed")??;
    Ok(())
}

async fn read_procfile(path: &Path) -> Result<Vec<ProcessSpec>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Error opening Procfile {}", path.display()))?;
    let specs = parse_procfile(&text);
    if specs.is_empty() {
        bail!("no processes defined in {}", path.display());
    }
    Ok(specs)
}

fn select_process(specs: Vec<ProcessSpec>, only: Option<&str>) -> Result<Vec<ProcessSpec>> {
    let Some(name) = only else {
        return Ok(specs);
    };
    let selected: Vec<ProcessSpec> = specs.into_iter().filter(|spec| spec.name == name).collect();
    if selected.is_empty() {
        bail!("unknown process {}", name);
    }
    Ok(selected)
}

fn inherited_env() -> HashMap<String, String> {
    unicode_env(std::env::vars_os())
}

// Variables that are not valid unicode cannot be passed through the resolved map.
fn unicode_env(vars: impl IntoIterator<Item = (OsString, OsString)>) -> HashMap<String, String> {
    vars.into_iter()
        .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (Ok(key), Err(_)) => {
                tracing::debug!("[forewoman] dropping {} from the environment, its value is not unicode", key);
                None
            }
            (Err(key), _) => {
                tracing::debug!("[forewoman] dropping non-unicode variable {:?} from the environment", key);
                None
            }
        })
        .collect()
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
