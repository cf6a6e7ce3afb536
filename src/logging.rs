// Kernel logging.
//
// Lines are rendered with an ANSI color per level and pushed as raw bytes
// to the registered console character device. Until a console is attached
// the output is dropped; nothing in the log path ever blocks.

use crate::dev::CharDevice;
use alloc::format;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    fn color(self) -> &'static str {
        match self {
            LogLevel::Error => "\x1b[31m",
            LogLevel::Warn => "\x1b[33m",
            LogLevel::Info => "\x1b[32m",
            LogLevel::Debug => "\x1b[36m",
        }
    }
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

static CONSOLE: Mutex<Option<Arc<dyn CharDevice>>> = Mutex::new(None);

pub fn set_log_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Attach the default TTY. Called by the boot glue once the UART is up.
pub fn set_console(device: Arc<dyn CharDevice>) {
    *CONSOLE.lock() = Some(device);
}

/// Raw bytes straight to the console device (the print syscall).
pub fn console_write(bytes: &[u8]) {
    let console = CONSOLE.lock().clone();
    if let Some(console) = console {
        let _ = console.write(bytes);
    }
}

pub fn log(level: LogLevel, args: fmt::Arguments) {
    if level as u8 > MAX_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    let console = CONSOLE.lock().clone();
    if let Some(console) = console {
        let line = format!("{}[{:5}]\x1b[0m {}\n", level.color(), level.as_str(), args);
        let _ = console.write(line.as_bytes());
    }
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Debug, format_args!($($arg)*))
    };
}
