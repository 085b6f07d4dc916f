//! Console output for supervised processes.
//!
//! Every line a replica prints is tagged `[name-index]` and colored with the
//! color the replica was given at spawn time. Colors cycle through a fixed
//! palette indexed by the size of the supervision table.

use std::io::{IsTerminal, Write};
use std::sync::{Arc, Mutex};

use crate::events::ExitReport;
use crate::process::ReplicaId;

/// Display colors handed out to replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Yellow,
    Cyan,
    Magenta,
    Green,
    Blue,
}

pub const PALETTE: [Color; 5] = [
    Color::Yellow,
    Color::Cyan,
    Color::Magenta,
    Color::Green,
    Color::Blue,
];

impl Color {
    /// Color for the `slot`-th concurrently registered replica.
    pub fn for_slot(slot: usize) -> Self {
        PALETTE[slot % PALETTE.len()]
    }

    fn ansi_code(self) -> &'static str {
        match self {
            Color::Yellow => "33",
            Color::Cyan => "36",
            Color::Magenta => "35",
            Color::Green => "32",
            Color::Blue => "34",
        }
    }
}

#[derive(Debug, Clone)]
enum Sink {
    Stdout,
    #[cfg_attr(not(test), allow(dead_code))]
    Buffer(Arc<Mutex<Vec<u8>>>),
}

/// Writes tagged replica output.
#[derive(Debug, Clone)]
pub struct Console {
    colors: bool,
    sink: Sink,
}

impl Console {
    /// Console on stdout, colored when stdout is a terminal and `NO_COLOR` is unset.
    pub fn stdout() -> Self {
        let colors = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        Self {
            colors,
            sink: Sink::Stdout,
        }
    }

    /// Uncolored console capturing everything into a shared buffer.
    #[cfg(test)]
    pub fn buffered() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let console = Self {
            colors: false,
            sink: Sink::Buffer(buffer.clone()),
        };
        (console, buffer)
    }

    /// Writes one line of replica output.
    pub fn line(&self, id: &ReplicaId, color: Color, text: &str) {
        self.write(id, color, text);
    }

    /// Reports how a replica exited.
    pub fn exited(&self, id: &ReplicaId, color: Color, report: &ExitReport) {
        self.write(id, color, &report.to_string());
    }

    fn write(&self, id: &ReplicaId, color: Color, text: &str) {
        let mut line = format_line(id, text);
        if self.colors {
            line = apply_color(&line, color);
        }
        match &self.sink {
            Sink::Stdout => {
                let mut stdout = std::io::stdout().lock();
                let _ = writeln!(stdout, "{}", line);
            }
            Sink::Buffer(buffer) => {
                if let Ok(mut buffer) = buffer.lock() {
                    let _ = writeln!(buffer, "{}", line);
                }
            }
        }
    }
}

pub fn format_line(id: &ReplicaId, text: &str) -> String {
    format!("[{}] {}", id, text)
}

pub fn apply_color(text: &str, color: Color) -> String {
    format!("\u{1b}[{}m{}\u{1b}[0m", color.ansi_code(), text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_cycle_after_five_slots() {
        assert_eq!(Color::for_slot(0), Color::Yellow);
        assert_eq!(Color::for_slot(4), Color::Blue);
        assert_eq!(Color::for_slot(5), Color::Yellow);
        assert_eq!(Color::for_slot(7), Color::Magenta);
    }

    #[test]
    fn lines_are_tagged_with_replica_id() {
        let id = ReplicaId::new("web", 1);
        assert_eq!(format_line(&id, "listening"), "[web-1] listening");
        assert_eq!(
            apply_color("[web-1] listening", Color::Cyan),
            "\u{1b}[36m[web-1] listening\u{1b}[0m"
        );
    }

    #[test]
    fn buffered_console_records_output_and_exits() {
        let (console, buffer) = Console::buffered();
        let id = ReplicaId::new("worker", 0);
        console.line(&id, Color::Green, "tick");
        console.exited(&id, Color::Green, &ExitReport::Code(0));
        let text = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "[worker-0] tick\n[worker-0] exited with code 0\n");
    }
}
