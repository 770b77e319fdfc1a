use super::*;

/// Source of wall-clock milliseconds.
///
/// Checkpoint ids and processing-time timestamps come from a clock so that
/// tests can drive them with [`VirtualClock`].
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> EventTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> EventTime {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as EventTime)
            .unwrap_or_default()
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Clock that starts at a fixed millisecond value and follows tokio time.
///
/// Under `tokio::time::pause()` it only moves when the runtime advances
/// time, which makes window and checkpoint timing deterministic in tests.
/// [`advance`](Self::advance) and [`set`](Self::set) shift it further.
#[derive(Debug)]
pub struct VirtualClock {
    origin_ms: EventTime,
    origin: tokio::time::Instant,
    offset_ms: AtomicI64,
}

impl VirtualClock {
    pub fn new(origin_ms: EventTime) -> Self {
        Self {
            origin_ms,
            origin: tokio::time::Instant::now(),
            offset_ms: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: EventTime) {
        let current = self.now_ms();
        self.offset_ms
            .fetch_add(now_ms - current, Ordering::SeqCst);
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> EventTime {
        self.origin_ms
            + self.origin.elapsed().as_millis() as EventTime
            + self.offset_ms.load(Ordering::SeqCst)
    }
}
