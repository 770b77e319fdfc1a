use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    /// Every tuple is emitted as its own window.
    NotWindow,
    Tumbling,
    Hopping,
    Sliding,
    Session,
    Count,
}

/// Window definition.
///
/// `length` and `interval` are milliseconds for time windows and tuple
/// counts for count windows. For session windows `length` is the maximum
/// session duration and `interval` the idle gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub window_type: WindowType,
    pub length: i64,
    #[serde(default)]
    pub interval: i64,
}

impl WindowConfig {
    pub fn new(window_type: WindowType, length: i64, interval: i64) -> Self {
        Self {
            window_type,
            length,
            interval,
        }
    }

    pub fn not_window() -> Self {
        Self::new(WindowType::NotWindow, 0, 0)
    }

    pub fn tumbling(length: i64) -> Self {
        Self::new(WindowType::Tumbling, length, 0)
    }

    pub fn hopping(length: i64, interval: i64) -> Self {
        Self::new(WindowType::Hopping, length, interval)
    }

    pub fn sliding(length: i64) -> Self {
        Self::new(WindowType::Sliding, length, 0)
    }

    pub fn session(length: i64, gap: i64) -> Self {
        Self::new(WindowType::Session, length, gap)
    }

    /// Count window of `length` tuples emitted every `interval` tuples;
    /// `interval` 0 means every `length` tuples.
    pub fn count(length: i64, interval: i64) -> Self {
        Self::new(WindowType::Count, length, interval)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(EngineError::Configuration(msg).into()) };
        match self.window_type {
            WindowType::NotWindow => Ok(()),
            WindowType::Tumbling | WindowType::Sliding if self.length <= 0 => invalid(format!(
                "{:?} window length must be > 0, got {}",
                self.window_type, self.length
            )),
            WindowType::Hopping if self.length <= 0 || self.interval <= 0 => invalid(format!(
                "hopping window needs positive length and interval, got {} and {}",
                self.length, self.interval
            )),
            WindowType::Session if self.length <= 0 || self.interval <= 0 => invalid(format!(
                "session window needs positive length and gap, got {} and {}",
                self.length, self.interval
            )),
            WindowType::Count if self.length <= 0 || self.interval < 0 => invalid(format!(
                "count window needs positive length and non-negative interval, got {} and {}",
                self.length, self.interval
            )),
            _ => Ok(()),
        }
    }

    /// Period of the processing-time ticker, `None` for types driven by
    /// arrivals.
    pub fn ticker_interval(&self) -> Option<Duration> {
        let ms = match self.window_type {
            WindowType::Tumbling | WindowType::Session => self.length,
            WindowType::Hopping => self.interval,
            WindowType::NotWindow | WindowType::Sliding | WindowType::Count => return None,
        };
        (ms > 0).then(|| Duration::from_millis(ms as u64))
    }

    /// Effective count-window step.
    pub fn count_interval(&self) -> i64 {
        if self.interval > 0 {
            self.interval
        } else {
            self.length
        }
    }

    /// Window types that evict by age instead of emptying on trigger.
    pub fn is_overlapping(&self) -> bool {
        matches!(self.window_type, WindowType::Hopping | WindowType::Sliding)
    }
}
