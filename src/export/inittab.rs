use anyhow::Result;

use super::{chown, create_dir, expand_replicas, load_template, render, require_location, write_file, Exporter};
use crate::config::ExportOptions;
use crate::process::ProcessSpec;

const MASTER: &str = "# ----- forewoman {{app}} processes -----
{{processes}}
# ----- end forewoman {{app}} processes -----
";

const PROCESS: &str = "{{id}}:4:respawn:/bin/su - {{user}} -c 'PORT={{port}} {{command}} >> {{log_root}}/{{process}}-{{num}}.log 2>&1'";

/// A block of `/etc/inittab` entries, one per replica.
pub struct Inittab;

impl Exporter for Inittab {
    fn name(&self) -> &'static str {
        "Inittab"
    }

    fn write_templates(&self, processes: &[ProcessSpec], options: &ExportOptions) -> Result<()> {
        let location = require_location(self.name(), options)?;
        create_dir(&options.log_root)?;
        chown(&options.user, &options.log_root)?;
        let content = render_inittab(processes, options)?;
        write_file(location, &content)
    }
}

fn render_inittab(processes: &[ProcessSpec], options: &ExportOptions) -> Result<String> {
    let process_template = load_template("process", PROCESS, options)?;
    let master_template = load_template("master", MASTER, options)?;
    let log_root = options.log_root.display().to_string();

    let entries: Vec<String> = expand_replicas(processes, options)
        .iter()
        .map(|replica| {
            let id = format!("{}{}", replica.name().to_uppercase(), replica.index);
            let port = replica.port.to_string();
            let num = replica.index.to_string();
            render(
                &process_template,
                &[
                    ("id", id.as_str()),
                    ("user", options.user.as_str()),
                    ("port", port.as_str()),
                    ("command", replica.command()),
                    ("log_root", log_root.as_str()),
                    ("process", replica.name()),
                    ("num", num.as_str()),
                ],
            )
        })
        .collect();

    Ok(render(
        &master_template,
        &[("app", options.app.as_str()), ("processes", entries.join("\n").as_str())],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::tests::{sample_options, sample_processes};

    #[test]
    fn renders_one_entry_per_replica() {
        let rendered = render_inittab(&sample_processes(), &sample_options(None)).unwrap();
        let expected = "# ----- forewoman shop processes -----
WEB0:4:respawn:/bin/su - deploy -c 'PORT=5000 node server.js >> /var/log/shop/web-0.log 2>&1'
WEB1:4:respawn:/bin/su - deploy -c 'PORT=5001 node server.js >> /var/log/shop/web-1.log 2>&1'
WORKER0:4:respawn:/bin/su - deploy -c 'PORT=5002 LEVEL=debug node worker.js >> /var/log/shop/worker-0.log 2>&1'
# ----- end forewoman shop processes -----
";
        assert_eq!(rendered, expected);
    }

    #[test]
    fn process_template_can_be_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("process.tpl");
        std::fs::write(&path, "{{id}} {{command}}").unwrap();
        let mut options = sample_options(None);
        options.templates.insert("process".to_string(), path);

        let rendered = render_inittab(&sample_processes(), &options).unwrap();
        assert!(rendered.contains("\nWEB0 node server.js\n"));
        assert!(rendered.contains("\nWORKER0 LEVEL=debug node worker.js\n"));
    }
}
