use log::warn;
use simple_error::try_with;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::result::Result;

/// The five analysis streams. These are artifacts of the tool, separate
/// from the `log` facade used for tool-health diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSubject {
    /// What got instrumented and why.
    Instrumentation,
    /// Language transitions and cross-language calls.
    Execution,
    /// Allocator entry/exit observations.
    Memory,
    /// Read/write hits on registered objects.
    Access,
    /// Object lifecycle: register, move, remove.
    Objects,
}

const FILE_NAMES: [&str; 5] = [
    "instrumentation.log",
    "execution.log",
    "memory.log",
    "access.log",
    "objects.log",
];

type Stream = Mutex<Option<BufWriter<File>>>;

/// Append-only, buffered, best-effort. Each stream has its own lock; the
/// host does not serialise callbacks for us. A write that fails is
/// dropped rather than stalling the hook that issued it.
pub struct Logger {
    streams: [Stream; 5],
}

impl Logger {
    pub fn create(dir: &Path) -> Result<Logger> {
        try_with!(
            fs::create_dir_all(dir),
            "cannot create log directory {}",
            dir.display()
        );
        let open = |index: usize| -> Result<Stream> {
            let path = dir.join(FILE_NAMES[index]);
            let file = try_with!(File::create(&path), "cannot open log file {}", path.display());
            Ok(Mutex::new(Some(BufWriter::new(file))))
        };
        Ok(Logger {
            streams: [open(0)?, open(1)?, open(2)?, open(3)?, open(4)?],
        })
    }

    /// A logger with no backing files, for tests and hosts that do not
    /// want the streams on disk.
    pub fn disabled() -> Logger {
        Logger {
            streams: [
                Mutex::new(None),
                Mutex::new(None),
                Mutex::new(None),
                Mutex::new(None),
                Mutex::new(None),
            ],
        }
    }

    pub fn log(&self, subject: LogSubject, args: fmt::Arguments) {
        let mut guard = match self.streams[subject as usize].lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if let Some(stream) = guard.as_mut() {
            let _ = writeln!(stream, "{}", args);
        }
    }

    pub fn flush(&self) {
        for stream in &self.streams {
            if let Ok(mut guard) = stream.lock() {
                if let Some(stream) = guard.as_mut() {
                    if let Err(err) = stream.flush() {
                        warn!("cannot flush log stream: {}", err);
                    }
                }
            }
        }
    }
}
