use lazy_static::lazy_static;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Log levels in increasing verbosity. `LogPacket` traces every byte of the
/// remote protocol and is enabled by `--remote-debug`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum LogLevel {
    LogFatal = 0,
    LogError = 1,
    LogWarn = 2,
    LogInfo = 3,
    LogDebug = 4,
    LogPacket = 5,
}

struct LogSink {
    file: Option<File>,
    colors: bool,
}

lazy_static! {
    static ref LOG_SINK: Mutex<LogSink> = Mutex::new(LogSink {
        file: None,
        colors: true,
    });
}

static LOG_LEVEL: AtomicUsize = AtomicUsize::new(LogLevel::LogWarn as usize);

pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as usize, Ordering::Relaxed);
}

pub fn log_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::LogFatal,
        1 => LogLevel::LogError,
        2 => LogLevel::LogWarn,
        3 => LogLevel::LogInfo,
        4 => LogLevel::LogDebug,
        _ => LogLevel::LogPacket,
    }
}

pub fn log_enabled(level: LogLevel) -> bool {
    level as usize <= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn set_log_colors(enabled: bool) {
    LOG_SINK.lock().unwrap().colors = enabled;
}

/// Redirect log output to `path`. Color is disabled and the level raised to
/// debug, matching the behavior of `--log-file`.
pub fn set_log_file(path: &str) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut sink = LOG_SINK.lock().unwrap();
    sink.file = Some(file);
    sink.colors = false;
    Ok(())
}

fn level_tag(level: LogLevel) -> (&'static str, &'static str) {
    // (tag, ANSI color)
    match level {
        LogLevel::LogFatal => ("FATAL", "\x1b[1;31m"),
        LogLevel::LogError => ("ERROR", "\x1b[31m"),
        LogLevel::LogWarn => ("WARN", "\x1b[33m"),
        LogLevel::LogInfo => ("INFO", "\x1b[32m"),
        LogLevel::LogDebug => ("DEBUG", "\x1b[36m"),
        LogLevel::LogPacket => ("PACKET", "\x1b[35m"),
    }
}

pub fn write_log(level: LogLevel, module: &str, message: &str) {
    let (tag, color) = level_tag(level);
    let pid = unsafe { libc::getpid() };
    let mut sink = LOG_SINK.lock().unwrap();
    let line = if sink.colors && sink.file.is_none() {
        format!(
            "{}{:6}\x1b[0m [{}] {}: {}\n",
            color, tag, pid, module, message
        )
    } else {
        format!("{:6} [{}] {}: {}\n", tag, pid, module, message)
    };
    match sink.file.as_mut() {
        Some(f) => {
            let _ = f.write_all(line.as_bytes());
        }
        None => {
            let _ = io::stderr().write_all(line.as_bytes());
        }
    }
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {{
        let level = $level;
        if $crate::log::log_enabled(level) {
            $crate::log::write_log(level, module_path!(), &format!($($arg)*));
        }
    }};
}

/// Unrecoverable startup or configuration error: log and exit non-zero.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        $crate::log::write_log(
            $crate::log::LogLevel::LogFatal,
            module_path!(),
            &format!($($arg)*),
        );
        ::std::process::exit(1)
    }};
}

/// Internal invariant violation. Logs the message and a backtrace, then
/// aborts: the stub's state can no longer be trusted.
#[macro_export]
macro_rules! bug {
    ($($arg:tt)*) => {{
        $crate::log::write_log(
            $crate::log::LogLevel::LogFatal,
            module_path!(),
            &format!($($arg)*),
        );
        $crate::log::write_log(
            $crate::log::LogLevel::LogFatal,
            module_path!(),
            &format!("{:?}", ::backtrace::Backtrace::new()),
        );
        ::std::process::abort()
    }};
}
