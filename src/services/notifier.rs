//! Line-oriented sinks for orchestrator progress notes.

use std::sync::Mutex;

pub trait Notifier: Send + Sync {
    fn note(&self, line: &str);
}

/// Prints each note to stdout.
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn note(&self, line: &str) {
        println!("{}", line);
    }
}

/// Keeps every note in memory.
#[derive(Default)]
pub struct MemoryNotifier {
    lines: Mutex<Vec<String>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl Notifier for MemoryNotifier {
    fn note(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}
