use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::Level;

/// Logging context handed to every component at construction time.
///
/// Records are forwarded to the `log` facade under a per-component target and,
/// when a file sink is attached, appended to that file as well. The apply helper
/// runs detached from any terminal, so the sink is where a failed state ends up.
#[derive(Clone)]
pub struct UpdateLogger {
    component: &'static str,
    sink: Option<Arc<Mutex<File>>>,
}

impl UpdateLogger {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            sink: None,
        }
    }

    /// Attach an append-only log file shared by all loggers derived from this one.
    pub fn with_file(mut self, path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.sink = Some(Arc::new(Mutex::new(file)));
        Ok(self)
    }

    /// Derive a logger for another component sharing the same sink.
    pub fn scoped(&self, component: &'static str) -> Self {
        Self {
            component,
            sink: self.sink.clone(),
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.emit(Level::Debug, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.emit(Level::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.emit(Level::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.emit(Level::Error, message.as_ref());
    }

    fn emit(&self, level: Level, message: &str) {
        log::log!(target: "delta_updater", level, "{}: {}", self.component, message);

        if level > Level::Info {
            return;
        }
        if let Some(sink) = &self.sink
            && let Ok(mut file) = sink.lock()
        {
            // The sink is best effort; the log facade already has the record.
            let _ = writeln!(
                file,
                "{} {:<5} {}: {}",
                Utc::now().to_rfc3339(),
                level,
                self.component,
                message
            );
        }
    }
}
