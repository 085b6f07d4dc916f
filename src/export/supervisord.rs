use anyhow::Result;

use super::{
    create_dir, expand_replicas, load_template, remove_previous_configs, render, require_location, write_file,
    ExportReplica, Exporter,
};
use crate::config::ExportOptions;
use crate::process::ProcessSpec;

const APP_CONF: &str = "{{processes}}
[group:{{app}}]
programs={{programs}}
";

const PROGRAM: &str = "[program:{{program}}]
command={{command}}
autostart=true
autorestart=true
stopsignal=QUIT
stdout_logfile={{log_root}}/{{process}}-{{num}}-out.log
stderr_logfile={{log_root}}/{{process}}-{{num}}-err.log
user={{user}}
directory={{directory}}
environment={{environment}}
";

/// A single `<app>.conf` holding every replica as a program plus a group.
pub struct Supervisord;

impl Exporter for Supervisord {
    fn name(&self) -> &'static str {
        "Supervisord"
    }

    fn write_templates(&self, processes: &[ProcessSpec], options: &ExportOptions) -> Result<()> {
        let location = require_location(self.name(), options)?;
        create_dir(location)?;
        remove_previous_configs(location, &options.app)?;
        let content = render_app_conf(processes, options)?;
        write_file(&location.join(format!("{}.conf", options.app)), &content)
    }
}

fn render_app_conf(processes: &[ProcessSpec], options: &ExportOptions) -> Result<String> {
    let program_template = load_template("program", PROGRAM, options)?;
    let app_template = load_template("app.conf", APP_CONF, options)?;
    let directory = options.working_dir.display().to_string();
    let log_root = options.log_root.display().to_string();

    let mut programs = Vec::new();
    let mut entries = Vec::new();
    for replica in expand_replicas(processes, options) {
        let program = program_name(&options.app, &replica);
        let num = replica.index.to_string();
        let environment = replica
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key.to_uppercase(), value))
            .collect::<Vec<_>>()
            .join(",");
        entries.push(render(
            &program_template,
            &[
                ("program", program.as_str()),
                ("command", replica.command()),
                ("log_root", log_root.as_str()),
                ("process", replica.name()),
                ("num", num.as_str()),
                ("user", options.user.as_str()),
                ("directory", directory.as_str()),
                ("environment", environment.as_str()),
            ],
        ));
        programs.push(program);
    }

    Ok(render(
        &app_template,
        &[
            ("app", options.app.as_str()),
            ("processes", entries.join("\n").as_str()),
            ("programs", programs.join(",").as_str()),
        ],
    ))
}

// The first replica goes without an index suffix.
fn program_name(app: &str, replica: &ExportReplica<'_>) -> String {
    if replica.index > 0 {
        format!("{}-{}-{}", app, replica.name(), replica.index)
    } else {
        format!("{}-{}", app, replica.name())
    }
}
