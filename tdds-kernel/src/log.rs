//! Leveled logger with per-source action masks.
//!
//! Each log source (subsystem) and level resolves to an action mask:
//! print to stdout/stderr, append to the log file, prefix the line with
//! the source name, or exit the process. Per-`(source, level)` overrides
//! live in an ordered map. Lines are assembled per thread and flushed on
//! a line terminator or when the 1 KiB buffer would overflow. Every
//! completed line is also emitted as a `tracing` event.

use bitflags::bitflags;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;

/// Line assembly buffer limit.
const LINE_MAX: usize = 1024;

bitflags! {
    /// What to do with a completed log line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LogActions: u32 {
        const PRINT_STDOUT  = 0x01;
        const PRINT_STDERR  = 0x02;
        const SYSLOG        = 0x04;
        const FILE          = 0x08;
        const EXIT          = 0x10;
        const PREFIX_STDOUT = 0x20;
        const PREFIX_STDERR = 0x40;
    }
}

/// Log severity levels, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum LogLevel {
    Log = 0,
    Debug = 1,
    Warning = 2,
    Error = 3,
    Fatal = 4,
}

const NUM_LEVELS: usize = 5;

/// Identifies the subsystem a log line originates from.
pub type SourceId = u16;

/// Well-known log sources.
pub mod source {
    use super::SourceId;

    pub const DDS: SourceId = 0;
    pub const TMR: SourceId = 1;
    pub const SOCK: SourceId = 2;
    pub const CDR: SourceId = 3;
    pub const UDP: SourceId = 4;
    pub const CFG: SourceId = 5;
    pub const USER: SourceId = 6;

    pub fn name(id: SourceId) -> &'static str {
        match id {
            DDS => "DDS",
            TMR => "TMR",
            SOCK => "SOCK",
            CDR => "CDR",
            UDP => "UDP",
            CFG => "CFG",
            USER => "USER",
            _ => "?",
        }
    }
}

struct LoggerState {
    actions: [LogActions; NUM_LEVELS],
    overrides: BTreeMap<(SourceId, usize), LogActions>,
    logname: PathBuf,
}

/// The process-wide leveled logger.
pub struct Logger {
    state: Mutex<LoggerState>,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

thread_local! {
    static LINE_BUF: RefCell<String> = RefCell::new(String::with_capacity(LINE_MAX));
}

fn default_actions() -> [LogActions; NUM_LEVELS] {
    [
        LogActions::FILE,                                   // log
        LogActions::FILE,                                   // debug
        LogActions::PRINT_STDERR | LogActions::FILE,        // warning
        LogActions::PRINT_STDERR | LogActions::FILE,        // error
        LogActions::PRINT_STDERR | LogActions::FILE | LogActions::EXIT, // fatal
    ]
}

fn log_file_path() -> PathBuf {
    let mut p = match std::env::var("TDDS_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from("."),
    };
    p.push(format!(".tdds_log_{}", process::id()));
    p
}

impl Logger {
    /// The process logger, created on first use.
    pub fn global() -> &'static Logger {
        LOGGER.get_or_init(|| Logger {
            state: Mutex::new(LoggerState {
                actions: default_actions(),
                overrides: BTreeMap::new(),
                logname: log_file_path(),
            }),
        })
    }

    /// Replace the action mask for a level.
    pub fn actions_set(&self, level: LogLevel, actions: LogActions) {
        self.state.lock().actions[level as usize] = actions;
    }

    /// Add actions to a level.
    pub fn actions_add(&self, level: LogLevel, actions: LogActions) {
        self.state.lock().actions[level as usize] |= actions;
    }

    /// Remove actions from a level.
    pub fn actions_remove(&self, level: LogLevel, actions: LogActions) {
        self.state.lock().actions[level as usize] &= !actions;
    }

    /// Override the actions for one `(source, level)` pair.
    pub fn override_set(&self, id: SourceId, level: LogLevel, actions: LogActions) {
        self.state
            .lock()
            .overrides
            .insert((id, level as usize), actions);
    }

    /// Drop a per-source override.
    pub fn override_clear(&self, id: SourceId, level: LogLevel) {
        self.state.lock().overrides.remove(&(id, level as usize));
    }

    /// Re-resolve the log file location after a `TDDS_LOG_DIR` change.
    pub fn log_dir_changed(&self) {
        self.state.lock().logname = log_file_path();
    }

    /// Point the log file at an explicit directory (configuration file
    /// override).
    pub fn set_log_dir(&self, dir: &str) {
        let mut p = PathBuf::from(dir);
        p.push(format!(".tdds_log_{}", process::id()));
        self.state.lock().logname = p;
    }

    fn resolve(&self, id: SourceId, level: LogLevel) -> (LogActions, PathBuf) {
        let st = self.state.lock();
        let acts = st
            .overrides
            .get(&(id, level as usize))
            .copied()
            .unwrap_or(st.actions[level as usize]);
        (acts, st.logname.clone())
    }

    /// Append text to the calling thread's line buffer; every completed
    /// line (terminated by `\r` or `\n`) runs the resolved actions.
    pub fn append(&self, id: SourceId, level: LogLevel, text: &str) {
        LINE_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            for ch in text.chars() {
                if ch == '\r' || ch == '\n' {
                    if !buf.is_empty() {
                        self.emit_line(id, level, &buf);
                        buf.clear();
                    }
                } else {
                    if buf.len() + ch.len_utf8() > LINE_MAX {
                        self.emit_line(id, level, &buf);
                        buf.clear();
                    }
                    buf.push(ch);
                }
            }
        });
    }

    /// Emit a complete line in one call.
    pub fn line(&self, id: SourceId, level: LogLevel, text: &str) {
        let mut s = String::from(text);
        s.push('\n');
        self.append(id, level, &s);
    }

    fn emit_line(&self, id: SourceId, level: LogLevel, line: &str) {
        let (acts, logname) = self.resolve(id, level);
        let name = source::name(id);

        match level {
            LogLevel::Log => tracing::info!(source = name, "{line}"),
            LogLevel::Debug => tracing::debug!(source = name, "{line}"),
            LogLevel::Warning => tracing::warn!(source = name, "{line}"),
            LogLevel::Error | LogLevel::Fatal => tracing::error!(source = name, "{line}"),
        }

        if acts.contains(LogActions::PRINT_STDOUT) {
            if acts.contains(LogActions::PREFIX_STDOUT) {
                println!("{name}: {line}");
            } else {
                println!("{line}");
            }
        }
        if acts.contains(LogActions::PRINT_STDERR) {
            if acts.contains(LogActions::PREFIX_STDERR) {
                eprintln!("{name}: {line}");
            } else {
                eprintln!("{line}");
            }
        }
        if acts.contains(LogActions::FILE) {
            if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&logname) {
                let _ = writeln!(f, "{name}: {line}");
            }
        }
        if acts.contains(LogActions::EXIT) {
            process::abort();
        }
    }
}

/// Informational line from the given source.
pub fn log_line(id: SourceId, text: &str) {
    Logger::global().line(id, LogLevel::Log, text);
}

/// Debug line from the given source.
pub fn debug_line(id: SourceId, text: &str) {
    Logger::global().line(id, LogLevel::Debug, text);
}

/// Warning line from the given source.
pub fn warn_line(id: SourceId, text: &str) {
    Logger::global().line(id, LogLevel::Warning, text);
}

/// Error line from the given source.
pub fn error_line(id: SourceId, text: &str) {
    Logger::global().line(id, LogLevel::Error, text);
}

/// Fatal line: runs the fatal action mask, then aborts the process.
pub fn fatal_line(id: SourceId, text: &str) -> ! {
    Logger::global().line(id, LogLevel::Fatal, text);
    // EXIT in the fatal mask already aborted; this is the backstop for
    // a caller that cleared it.
    process::abort();
}
