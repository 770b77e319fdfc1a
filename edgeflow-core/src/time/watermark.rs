use super::*;

/// State key of the last emitted watermark.
pub const WATERMARK_KEY: &str = "$$watermark";

/// Per-operator event-time progress.
///
/// Tracks the max timestamp seen per input stream. The watermark is the
/// minimum over all expected streams minus the late tolerance, and is only
/// computed once every expected stream has reported. Emitted watermarks
/// strictly increase; emission is non-blocking and drops when the operator
/// input is full.
#[derive(Debug)]
pub struct WatermarkGenerator {
    input_streams: Vec<String>,
    stream_to_ts: AHashMap<String, EventTime>,
    window: WindowConfig,
    late_tolerance: i64,
    interval: Option<i64>,
    output: Option<WeakChannelSender>,
    last_watermark: Option<EventTime>,
}

impl WatermarkGenerator {
    pub fn new(
        window: &WindowConfig,
        late_tolerance: i64,
        input_streams: Vec<String>,
    ) -> Result<Self> {
        let interval = match window.window_type {
            WindowType::Tumbling => Some(window.length),
            WindowType::Hopping | WindowType::Session => Some(window.interval),
            WindowType::Sliding | WindowType::NotWindow => None,
            WindowType::Count => {
                return Err(EngineError::configuration(
                    "count window is not supported in event-time mode",
                )
                .into())
            }
        };
        Ok(Self {
            input_streams,
            stream_to_ts: AHashMap::new(),
            window: window.clone(),
            late_tolerance,
            interval,
            output: None,
            last_watermark: None,
        })
    }

    /// Channel the generated watermarks are pushed into.
    pub fn set_output(&mut self, output: WeakChannelSender) {
        self.output = Some(output);
    }

    /// Period of the watermark ticker. Sliding windows have none: they
    /// trigger on every admitted tuple.
    pub fn tick_interval(&self) -> Option<Duration> {
        self.interval
            .filter(|interval| *interval > 0)
            .map(|interval| Duration::from_millis(interval as u64))
    }

    pub fn last_watermark(&self) -> Option<EventTime> {
        self.last_watermark
    }

    /// Resume from a checkpointed watermark.
    pub fn restore(&mut self, last_watermark: Option<EventTime>) {
        self.last_watermark = last_watermark;
    }

    /// Record a tuple timestamp. Returns whether the tuple is admissible,
    /// i.e. not older than the last emitted watermark.
    pub fn track(&mut self, stream: &str, timestamp: EventTime) -> bool {
        debug!(stream, timestamp, "Watermark generator track event");
        match self.stream_to_ts.get_mut(stream) {
            Some(current) if timestamp > *current => *current = timestamp,
            Some(_) => {}
            None => {
                self.stream_to_ts.insert(stream.to_string(), timestamp);
            }
        }
        let admissible = self
            .last_watermark
            .map_or(true, |watermark| timestamp >= watermark);
        if admissible && self.window.window_type == WindowType::Sliding {
            self.trigger();
        }
        admissible
    }

    /// Emit a new watermark if it advanced past the last one.
    pub fn trigger(&mut self) -> Option<WatermarkTuple> {
        let watermark = self.compute_watermark()?;
        if self.last_watermark.is_some_and(|last| watermark <= last) {
            return None;
        }
        let tuple = WatermarkTuple::new(watermark);
        if let Some(output) = &self.output {
            if !output.try_send(StreamItem::Event(StreamEvent::Watermark(tuple))) {
                debug!(watermark, "Operator input full, watermark dropped");
            }
        }
        self.last_watermark = Some(watermark);
        Some(tuple)
    }

    /// Current candidate watermark, `None` until every expected stream reported.
    pub fn compute_watermark(&self) -> Option<EventTime> {
        let min = if self.input_streams.is_empty() {
            self.stream_to_ts.values().copied().min()?
        } else {
            let mut min: Option<EventTime> = None;
            for stream in &self.input_streams {
                let ts = *self.stream_to_ts.get(stream)?;
                min = Some(min.map_or(ts, |m| m.min(ts)));
            }
            min?
        };
        Some(min.saturating_sub(self.late_tolerance))
    }

    /// End of the next window to fire after `current`, if it can be known
    /// from the buffered `inputs` and the `watermark`.
    pub fn next_window(
        &self,
        inputs: &[Tuple],
        current: Option<EventTime>,
        watermark: EventTime,
        triggered: bool,
    ) -> Option<EventTime> {
        match self.window.window_type {
            WindowType::Tumbling | WindowType::Hopping => {
                let interval = self.interval.filter(|i| *i > 0)?;
                if triggered {
                    if let Some(current) = current {
                        return Some(current + interval);
                    }
                }
                let next_ts = earliest_event_ts(inputs, current, watermark)?;
                let rem = next_ts.rem_euclid(interval);
                if rem == 0 {
                    Some(next_ts)
                } else {
                    Some(next_ts + (interval - rem))
                }
            }
            WindowType::Sliding => earliest_event_ts(inputs, current, watermark),
            WindowType::Session => {
                session_window_end(inputs, self.window.length, self.window.interval)
            }
            WindowType::NotWindow | WindowType::Count => None,
        }
    }
}

/// Smallest timestamp in `(start, end]`.
fn earliest_event_ts(inputs: &[Tuple], start: Option<EventTime>, end: EventTime) -> Option<EventTime> {
    inputs
        .iter()
        .map(|t| t.timestamp)
        .filter(|ts| start.map_or(true, |start| *ts > start) && *ts <= end)
        .min()
}
