use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Verbose,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Verbose => "verbose",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "error" => Some(LogLevel::Error),
            "warning" => Some(LogLevel::Warning),
            "info" => Some(LogLevel::Info),
            "verbose" => Some(LogLevel::Verbose),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
enum LogSink {
    Stderr,
    File(PathBuf),
    Null,
}

/// Structured event logger. Constructed explicitly and threaded through the
/// engine; there is no process-global logger to reset between tests.
#[derive(Debug, Clone)]
pub struct Logger {
    level: LogLevel,
    sink: LogSink,
}

impl Logger {
    pub fn stderr(level: LogLevel) -> Self {
        Self {
            level,
            sink: LogSink::Stderr,
        }
    }

    pub fn file(level: LogLevel, path: impl Into<PathBuf>) -> Self {
        Self {
            level,
            sink: LogSink::File(path.into()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            level: LogLevel::Error,
            sink: LogSink::Null,
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn error(&self, source: &str, action: &str, message: &str, data: Option<&Value>) {
        self.emit(LogLevel::Error, source, action, message, data);
    }

    pub fn warning(&self, source: &str, action: &str, message: &str, data: Option<&Value>) {
        self.emit(LogLevel::Warning, source, action, message, data);
    }

    pub fn info(&self, source: &str, action: &str, message: &str, data: Option<&Value>) {
        self.emit(LogLevel::Info, source, action, message, data);
    }

    pub fn verbose(&self, source: &str, action: &str, message: &str, data: Option<&Value>) {
        self.emit(LogLevel::Verbose, source, action, message, data);
    }

    pub fn debug(&self, source: &str, action: &str, message: &str, data: Option<&Value>) {
        self.emit(LogLevel::Debug, source, action, message, data);
    }

    pub fn trace(&self, source: &str, action: &str, message: &str, data: Option<&Value>) {
        self.emit(LogLevel::Trace, source, action, message, data);
    }

    fn emit(&self, level: LogLevel, source: &str, action: &str, message: &str, data: Option<&Value>) {
        if level > self.level {
            return;
        }
        let line = render_line(level, source, action, message, data);
        match &self.sink {
            LogSink::Stderr => eprintln!("{line}"),
            LogSink::File(path) => {
                let _ = append_line(path, &line);
            }
            LogSink::Null => {}
        }
    }
}

fn render_line(
    level: LogLevel,
    source: &str,
    action: &str,
    message: &str,
    data: Option<&Value>,
) -> String {
    let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut line = format!("ts={ts} level={level} source={source} action={action} message={message:?}");
    if let Some(data) = data {
        line.push_str(&format!(" data={data}"));
    }
    line
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
