//! Context-owned log sink
//!
//! Console output goes through the `log` facade so the host application keeps
//! control of formatting, while an optional text file records a persistent
//! copy. Print and write paths have independent severity thresholds, and a
//! redirect hook can divert everything to the application's own logger.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Severity of a log entry, ordered from least to most severe.
///
/// `Layer` sits between informational and warning output: it carries
/// validation-layer reports and device banners which are noisy but not
/// actionable by themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    /// Allocation traces, cache decisions
    Debug,
    /// Lifecycle milestones
    Info,
    /// Validation layer and device reports
    Layer,
    /// Recoverable anomalies
    Warning,
    /// Failures
    Error,
}

impl LogLevel {
    fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Layer => log::Level::Trace,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }

    fn header(self) -> &'static str {
        match self {
            LogLevel::Debug => "(DEBUG)\t",
            LogLevel::Info => "(INFO)\t",
            LogLevel::Layer => "",
            LogLevel::Warning => "(WARN)\t",
            LogLevel::Error => "(ERROR)\t",
        }
    }
}

/// Redirect hook type; when set, entries bypass both the console and the file.
pub type LogRedirect = Box<dyn Fn(&str, LogLevel) + Send + Sync>;

struct FileSink {
    writer: BufWriter<File>,
}

/// Log sink owned by the device context.
///
/// Cheap to call concurrently: the console path hands off to the `log`
/// facade, only the file writer is guarded.
pub struct LogSink {
    draw_logs: bool,
    min_print_level: LogLevel,
    min_write_level: LogLevel,
    file: Option<Mutex<FileSink>>,
    redirect: Option<LogRedirect>,
}

impl LogSink {
    /// Open the sink. When `save_logs` is set, `{log_path}/EntityCore-logs.txt`
    /// is created (truncating any previous run) and every entry at or above
    /// `min_write_level` is appended to it.
    pub fn new(
        draw_logs: bool,
        save_logs: bool,
        log_path: &Path,
        min_print_level: LogLevel,
        min_write_level: LogLevel,
        redirect: Option<LogRedirect>,
    ) -> Self {
        let file = if save_logs {
            match File::create(log_path.join("EntityCore-logs.txt")) {
                Ok(f) => Some(Mutex::new(FileSink {
                    writer: BufWriter::new(f),
                })),
                Err(e) => {
                    log::warn!("Failed to open log file in {}: {e}", log_path.display());
                    None
                }
            }
        } else {
            None
        };
        Self {
            draw_logs,
            min_print_level,
            min_write_level,
            file,
            redirect,
        }
    }

    /// Record one entry.
    pub fn put(&self, msg: &str, level: LogLevel) {
        if let Some(redirect) = &self.redirect {
            redirect(msg, level);
            return;
        }
        if self.draw_logs && level >= self.min_print_level {
            log::log!(level.as_log_level(), "{msg}");
        }
        if level >= self.min_write_level {
            if let Some(file) = &self.file {
                let mut sink = file.lock().unwrap();
                let _ = writeln!(sink.writer, "{}{}", level.header(), msg);
                let _ = sink.writer.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Layer);
        assert!(LogLevel::Layer < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn test_redirect_bypasses_sinks() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sink = LogSink::new(
            true,
            false,
            Path::new("."),
            LogLevel::Debug,
            LogLevel::Debug,
            Some(Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::Relaxed);
            })),
        );
        sink.put("one", LogLevel::Debug);
        sink.put("two", LogLevel::Error);
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_file_sink_respects_write_level() {
        let dir = std::env::temp_dir().join("entity_core_log_test");
        std::fs::create_dir_all(&dir).unwrap();
        {
            let sink = LogSink::new(
                false,
                true,
                &dir,
                LogLevel::Error,
                LogLevel::Warning,
                None,
            );
            sink.put("ignored", LogLevel::Info);
            sink.put("kept", LogLevel::Error);
        }
        let content = std::fs::read_to_string(dir.join("EntityCore-logs.txt")).unwrap();
        assert!(!content.contains("ignored"));
        assert!(content.contains("(ERROR)\tkept"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
