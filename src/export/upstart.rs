use anyhow::Result;

use super::{create_dir, expand_replicas, load_template, remove_previous_configs, render, require_location, write_file, Exporter};
use crate::config::ExportOptions;
use crate::process::ProcessSpec;

const MASTER: &str = "pre-start script

bash << \"EOF\"
  mkdir -p {{log_root}}
  chown -R {{user}} {{log_root}}
EOF

end script
";

const PROCESS_MASTER: &str = "start on starting {{app}}
stop on stopping {{app}}
";

const PROCESS: &str = "start on starting {{app}}-{{process}}
stop on stopping {{app}}-{{process}}
respawn

exec su - {{user}} -c 'cd {{directory}}; {{exports}}{{command}} >> {{log_root}}/{{process}}-{{num}}.log 2>&1'
";

/// A job hierarchy: `<app>.conf`, then `<app>-<name>.conf` per process and
/// `<app>-<name>-<i>.conf` per replica.
pub struct Upstart;

impl Exporter for Upstart {
    fn name(&self) -> &'static str {
        "Upstart"
    }

    fn write_templates(&self, processes: &[ProcessSpec], options: &ExportOptions) -> Result<()> {
        let location = require_location(self.name(), options)?;
        remove_previous_configs(location, &options.app)?;
        create_dir(location)?;
        create_dir(&options.log_root)?;

        let master = load_template("master.conf", MASTER, options)?;
        let process_master = load_template("process_master.conf", PROCESS_MASTER, options)?;
        let process_template = load_template("process.conf", PROCESS, options)?;
        let app = options.app.as_str();
        let user = options.user.as_str();
        let log_root = options.log_root.display().to_string();
        let directory = options.working_dir.display().to_string();

        write_file(
            &location.join(format!("{}.conf", app)),
            &render(&master, &[("user", user), ("log_root", log_root.as_str())]),
        )?;

        for process in processes {
            write_file(
                &location.join(format!("{}-{}.conf", app, process.name)),
                &render(&process_master, &[("app", app)]),
            )?;
        }

        for replica in expand_replicas(processes, options) {
            let num = replica.index.to_string();
            let port = replica.port.to_string();
            let exports: String = replica
                .env
                .iter()
                .map(|(key, value)| format!("export {}={}; ", key.to_uppercase(), value))
                .collect();
            let content = render(
                &process_template,
                &[
                    ("app", app),
                    ("process", replica.name()),
                    ("user", user),
                    ("directory", directory.as_str()),
                    ("port", port.as_str()),
                    ("exports", exports.as_str()),
                    ("command", replica.command()),
                    ("log_root", log_root.as_str()),
                    ("num", num.as_str()),
                ],
            );
            write_file(
                &location.join(format!("{}-{}-{}.conf", app, replica.name(), replica.index)),
                &content,
            )?;
        }
        Ok(())
    }
}
