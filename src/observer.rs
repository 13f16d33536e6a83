use crate::{branch::Branch, orchestrator::SyncState, snapshot::CopyProgress};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Log { level: LogLevel, message: String },
    CopyProgress { branch: Branch, progress: CopyProgress },
    SwitchRequested { from: Option<Branch>, to: Branch },
    StateChanged(SyncState),
}

/// Sink for everything the engine wants to tell the outside world.
///
/// Notifications may arrive from a worker thread; implementations must not
/// assume they run on any particular thread and must not block for long.
pub trait Observer: Send + Sync {
    fn notify(&self, event: Event);

    fn info(&self, message: String) {
        self.notify(Event::Log {
            level: LogLevel::Info,
            message,
        });
    }

    fn warn(&self, message: String) {
        self.notify(Event::Log {
            level: LogLevel::Warn,
            message,
        });
    }

    fn error(&self, message: String) {
        self.notify(Event::Log {
            level: LogLevel::Error,
            message,
        });
    }
}

pub struct NullObserver;

impl Observer for NullObserver {
    fn notify(&self, _event: Event) {}
}

/// Appends log events to a plain text file, one `[LEVEL] message` per line.
pub struct LogFileObserver {
    path: PathBuf,
}

impl LogFileObserver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Observer for LogFileObserver {
    fn notify(&self, event: Event) {
        let (level, message) = match event {
            Event::Log { level, message } => (level, message),
            Event::SwitchRequested { from, to } => (
                LogLevel::Info,
                format!(
                    "Waiting for Steam to switch from {} to {to}",
                    from.map(|branch| branch.as_str()).unwrap_or("unknown")
                ),
            ),
            Event::StateChanged(state) => (LogLevel::Info, format!("State: {state}")),
            Event::CopyProgress { .. } => return,
        };
        let _ = append_log_file(&self.path, level, &message);
    }
}

fn append_log_file(path: &Path, level: LogLevel, message: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "[{}] {message}", level.label())
}
