//! Build-time log channel.
//!
//! Messages are built by the `wv*!` macros, mirrored to the `log` facade and
//! handed to the callback registered on the channel, if any. A panicking
//! callback is caught and ignored.
use std::panic::{AssertUnwindSafe, catch_unwind};

use parking_lot::RwLock;
use strum::{Display, FromRepr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromRepr, Display)]
#[repr(u32)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl From<LogLevel> for log::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => log::Level::Trace,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogMessage {
    pub level: LogLevel,
    pub timepoint: chrono::NaiveDateTime,
    pub message: String,
    pub module: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

pub type LogCallback = Box<dyn Fn(&LogMessage) + Send + Sync>;

#[derive(Default)]
pub struct LogChannel {
    callback: RwLock<Option<LogCallback>>,
}

impl std::fmt::Debug for LogChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogChannel")
            .field("callback", &self.callback.read().is_some())
            .finish()
    }
}

impl LogChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&self, callback: impl Fn(&LogMessage) + Send + Sync + 'static) {
        *self.callback.write() = Some(Box::new(callback));
    }

    pub fn clear_callback(&self) {
        *self.callback.write() = None;
    }

    pub fn emit(&self, msg: LogMessage) {
        let level: log::Level = msg.level.into();
        log::log!(target: "loom", level, "{}", msg.message);
        if let Some(callback) = self.callback.read().as_ref() {
            let _ = catch_unwind(AssertUnwindSafe(|| callback(&msg)));
        }
    }
}

#[macro_export]
macro_rules! wvlog {
    (
        $channel:expr,
        $level:expr,
        $( $arg:tt )*
    ) => {
        {
            let msg = $crate::wvlog::LogMessage {
                level: $level,
                timepoint: $crate::chrono::Local::now().naive_local(),
                message: format!($($arg)*),
                module: module_path!().to_string(),
                file: Some(file!().to_string()),
                line: Some(line!()),
            };
            $channel.emit(msg);
        }
    };
}

#[macro_export]
macro_rules! wvtrace {
    (
        $channel:expr,
        $( $arg:tt )*
    ) => {
        $crate::wvlog!($channel, $crate::wvlog::LogLevel::Trace, $( $arg )*)
    };
}

#[macro_export]
macro_rules! wvdebug {
    (
        $channel:expr,
        $( $arg:tt )*
    ) => {
        $crate::wvlog!($channel, $crate::wvlog::LogLevel::Debug, $( $arg )*)
    };
}

#[macro_export]
macro_rules! wvinfo {
    (
        $channel:expr,
        $( $arg:tt )*
    ) => {
        $crate::wvlog!($channel, $crate::wvlog::LogLevel::Info, $( $arg )*)
    };
}

#[macro_export]
macro_rules! wvwarn {
    (
        $channel:expr,
        $( $arg:tt )*
    ) => {
        $crate::wvlog!($channel, $crate::wvlog::LogLevel::Warn, $( $arg )*)
    };
}

#[macro_export]
macro_rules! wverror {
    (
        $channel:expr,
        $( $arg:tt )*
    ) => {
        $crate::wvlog!($channel, $crate::wvlog::LogLevel::Error, $( $arg )*)
    };
}

/// Elapsed time of one named phase of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTiming {
    pub phase: String,
    pub elapsed: chrono::TimeDelta,
}

/// Measures a named phase; [`PhaseTimer::finish`] logs and returns the
/// elapsed time.
pub struct PhaseTimer<'c> {
    channel: &'c LogChannel,
    phase: String,
    start: chrono::DateTime<chrono::Local>,
}

impl<'c> PhaseTimer<'c> {
    pub fn start(channel: &'c LogChannel, phase: impl Into<String>) -> Self {
        Self {
            channel,
            phase: phase.into(),
            start: chrono::Local::now(),
        }
    }

    pub fn finish(self) -> PhaseTiming {
        let elapsed = chrono::Local::now() - self.start;
        crate::wvdebug!(
            self.channel,
            "Phase '{}' took {} ms",
            self.phase,
            elapsed.num_milliseconds()
        );
        PhaseTiming {
            phase: self.phase,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn messages_reach_the_callback_with_their_origin() {
        let channel = LogChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.set_callback(move |msg| sink.lock().unwrap().push((msg.level, msg.message.clone(), msg.module.clone())));

        crate::wvinfo!(channel, "Implementing method interceptors: {} {}", "Foo", "Bar(i32)");
        crate::wvtrace!(channel, "detail");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, LogLevel::Info);
        assert_eq!(seen[0].1, "Implementing method interceptors: Foo Bar(i32)");
        assert!(seen[0].2.ends_with("wvlog::tests"));
        assert_eq!(seen[1].0, LogLevel::Trace);
    }

    #[test]
    fn panicking_callback_is_contained() {
        let channel = LogChannel::new();
        channel.set_callback(|_| panic!("broken sink"));
        crate::wverror!(channel, "still fine");

        let timing = PhaseTimer::start(&channel, "verify").finish();
        assert_eq!(timing.phase, "verify");
        assert!(timing.elapsed >= chrono::TimeDelta::zero());
    }
}
