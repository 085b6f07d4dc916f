use anyhow::Result;

use super::{create_dir, expand_replicas, load_template, render, require_location, write_executable, write_file, Exporter};
use crate::config::ExportOptions;
use crate::parser::is_env_key;
use crate::process::ProcessSpec;

const RUN: &str = "#!/bin/sh
cd {{directory}}
exec chpst -u {{user}} -e {{env_dir}} {{command}}
";

const LOG_RUN: &str = "#!/bin/sh
set -e

LOG={{log_root}}/{{process}}-{{num}}

test -d \"$LOG\" || mkdir -p -m 2750 \"$LOG\" && chown {{user}} \"$LOG\"
exec chpst -u {{user}} svlogd \"$LOG\"
";

/// One runit service directory per replica.
///
/// ```text
/// <location>/<app>-<name>-<i>/run
/// <location>/<app>-<name>-<i>/env/<KEY>
/// <location>/<app>-<name>-<i>/log/run
/// ```
pub struct Runit;

impl Exporter for Runit {
    fn name(&self) -> &'static str {
        "Runit"
    }

    fn write_templates(&self, processes: &[ProcessSpec], options: &ExportOptions) -> Result<()> {
        let location = require_location(self.name(), options)?;
        let run_template = load_template("run", RUN, options)?;
        let log_run_template = load_template("log_run", LOG_RUN, options)?;
        let directory = options.working_dir.display().to_string();
        let log_root = options.log_root.display().to_string();

        for replica in expand_replicas(processes, options) {
            let service_dir = location.join(format!("{}-{}-{}", options.app, replica.name(), replica.index));
            let env_dir = service_dir.join("env");
            let log_dir = service_dir.join("log");
            for dir in [&service_dir, &env_dir, &log_dir] {
                create_dir(dir)?;
            }

            let env_dir_text = env_dir.display().to_string();
            let run = render(
                &run_template,
                &[
                    ("directory", directory.as_str()),
                    ("user", options.user.as_str()),
                    ("env_dir", env_dir_text.as_str()),
                    ("command", replica.command()),
                ],
            );
            write_executable(&service_dir.join("run"), &run)?;

            // Each key becomes a file name inside env_dir.
            for (key, value) in replica.env.iter() {
                if !is_env_key(key) {
                    tracing::warn!("[forewoman] skipping invalid env key {:?} for {}", key, replica.name());
                    continue;
                }
                write_file(&env_dir.join(key), value)?;
            }

            let num = replica.index.to_string();
            let log_run = render(
                &log_run_template,
                &[
                    ("log_root", log_root.as_str()),
                    ("process", replica.name()),
                    ("num", num.as_str()),
                    ("user", options.user.as_str()),
                ],
            );
            write_executable(&log_dir.join("run"), &log_run)?;
        }
        Ok(())
    }
}
