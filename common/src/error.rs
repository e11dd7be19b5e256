use std::io;

use thiserror::Error;

/// Failure of one network exchange. Always transient from the controller's
/// point of view: the caller backs off and tries again later.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("timed out after {0} ms")]
    Timeout(u32),
    #[error("not connected")]
    NotConnected,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("switch frame: {0}")]
    Frame(#[from] FrameError),
}

impl LinkError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload of {0} bytes does not fit a 16-bit length")]
    TooLong(usize),
    #[error("frame shorter than its header")]
    Truncated,
    #[error("header declares {declared} bytes but {actual} follow")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload is not valid json: {0}")]
    Json(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("worst-case tick of {worst_case_ms} ms does not fit the {watchdog_ms} ms watchdog")]
    WatchdogBudget { worst_case_ms: u32, watchdog_ms: u32 },
    #[error("porch debounce window is inverted ({min_ms} ms > {max_ms} ms)")]
    DebounceWindow { min_ms: u32, max_ms: u32 },
    #[error("{name} must be non-zero")]
    Zero { name: &'static str },
    #[error("site latitude {0} is outside -90..=90")]
    Latitude(String),
    #[error("gpio {0} is missing or assigned twice")]
    Pin(i32),
}
