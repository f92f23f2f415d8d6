//! Structured logging, grounded on the teacher's homegrown `crate::log::Log`
//! (referenced but not retrieved from `zerotier-system-service::service`,
//! which calls it as `l!(service.log, "...")`/`d!(service.log, "...")`)
//! rather than an ecosystem logging facade. Levels map onto spec §7's
//! `LOG_ERR`/`LOG_NOTICE` taxonomy.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Notice => "NOTICE",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

struct FileSink {
    path: PathBuf,
    max_size: u64,
    file: File,
}

impl FileSink {
    fn open(path: PathBuf, max_size: u64) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, max_size, file })
    }

    fn write_line(&mut self, line: &str) {
        if let Ok(meta) = self.file.metadata() {
            if meta.len() > self.max_size {
                if let Ok(f) = OpenOptions::new().create(true).write(true).truncate(true).open(&self.path) {
                    self.file = f;
                }
            }
        }
        let _ = writeln!(self.file, "{}", line);
    }
}

/// The daemon-wide logger: always writes to stderr, optionally also to a
/// size-capped rotating file. `set_debug` is wired to `SIGINT` (spec §9
/// "SIGINT (toggle debug verbosity)").
pub struct Log {
    to_stderr: bool,
    debug: std::sync::atomic::AtomicBool,
    file: Mutex<Option<FileSink>>,
}

impl Log {
    pub fn new(path: Option<PathBuf>, max_size: u64, to_stderr: bool, debug: bool) -> Self {
        let file = path.and_then(|p| FileSink::open(p, max_size).ok());
        Self { to_stderr, debug: std::sync::atomic::AtomicBool::new(debug), file: Mutex::new(file) }
    }

    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn log(&self, level: Level, message: &str) {
        if level == Level::Debug && !self.debug.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }
        let line = format!("[{}] {}", level.tag(), message);
        if self.to_stderr {
            eprintln!("{}", line);
        }
        if let Some(sink) = self.file.lock().unwrap().as_mut() {
            sink.write_line(&line);
        }
    }
}

/// Lets the reactor (spec §9 "Signals") report state dumps and reload
/// summaries through the daemon's own logger without `mesh-core` depending
/// on `mesh-service`'s macros.
impl mesh_core::reactor::ReactorLog for std::sync::Arc<Log> {
    fn notice(&self, message: &str) {
        self.log(Level::Notice, message);
    }
}

/// Notice-level convenience macro, mirroring the teacher's `l!(service.log, ...)`.
#[macro_export]
macro_rules! l {
    ($log:expr, $($arg:tt)*) => {
        $log.log($crate::logging::Level::Notice, &format!($($arg)*))
    };
}

/// Debug-level convenience macro, mirroring the teacher's `d!(service.log, ...)`.
#[macro_export]
macro_rules! d {
    ($log:expr, $($arg:tt)*) => {
        $log.log($crate::logging::Level::Debug, &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_suppressed_until_enabled() {
        let log = Log::new(None, 1024, false, false);
        log.log(Level::Debug, "hidden");
        log.set_debug(true);
        log.log(Level::Debug, "shown");
    }

    #[test]
    fn file_sink_rotates_past_max_size() {
        let dir = std::env::temp_dir().join(format!("mesh-service-log-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.log");
        let log = Log::new(Some(path.clone()), 16, false, false);
        for _ in 0..5 {
            log.log(Level::Notice, "0123456789");
        }
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
