use super::*;

pub const WINDOW_INPUTS_KEY: &str = "$$windowInputs";
pub const TRIGGER_TIME_KEY: &str = "$$triggerTime";
pub const MSG_COUNT_KEY: &str = "$$msgCount";

/// Tick lag above which a processing-time trigger is reported as late.
const LONG_COMPUTATION_THRESHOLD_MS: i64 = 100;

// ── WindowOperator ────────────────────────────────────────────────────────────

/// Window state machine, free of I/O.
///
/// The hosting node feeds it tuples, ticks, session timeouts and watermarks
/// and broadcasts whatever windows it returns.
///
/// # Buffering
///
/// - Tumbling and session windows drop every tuple they emit.
/// - Hopping and sliding windows keep tuples until they are older than
///   `length` (plus the tick lag in processing time).
/// - Count windows keep the newest `length - 1` tuples.
#[derive(Debug)]
pub struct WindowOperator {
    name: String,
    config: WindowConfig,
    is_event_time: bool,
    inputs: Vec<Tuple>,
    trigger_time: Option<EventTime>,
    msg_count: i64,
    // Event time only.
    next_window_end: Option<EventTime>,
    prev_window_end: Option<EventTime>,
    triggered: bool,
}

impl WindowOperator {
    pub fn new(name: impl Into<String>, config: WindowConfig, is_event_time: bool) -> Result<Self> {
        config.validate()?;
        if is_event_time && config.window_type == WindowType::Count {
            return Err(EngineError::configuration(
                "count window is not supported in event-time mode",
            )
            .into());
        }
        Ok(Self {
            name: name.into(),
            config,
            is_event_time,
            inputs: Vec::new(),
            trigger_time: None,
            msg_count: 0,
            next_window_end: None,
            prev_window_end: None,
            triggered: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn is_event_time(&self) -> bool {
        self.is_event_time
    }

    /// Buffered tuples, in arrival order.
    pub fn inputs(&self) -> &[Tuple] {
        &self.inputs
    }

    /// Time of the last trigger.
    pub fn trigger_time(&self) -> Option<EventTime> {
        self.trigger_time
    }

    // ── Processing time ──────────────────────────────────────────────────────

    /// Buffer a tuple and return the windows it closes.
    ///
    /// Only non-window, sliding and count types fire on arrival.
    pub fn push(&mut self, tuple: Tuple) -> Result<Vec<WindowTuplesSet>> {
        let timestamp = tuple.timestamp;
        self.inputs.push(tuple);
        match self.config.window_type {
            WindowType::NotWindow | WindowType::Sliding => Ok(self.scan(timestamp).into_iter().collect()),
            WindowType::Count => self.split_count_window(),
            _ => Ok(Vec::new()),
        }
    }

    /// Mark the start of a session at the timestamp of its first tuple.
    pub fn start_session(&mut self, timestamp: EventTime) {
        self.trigger_time = Some(timestamp);
    }

    /// Periodic ticker fired at `now`.
    pub fn on_tick(&mut self, now: EventTime) -> Option<WindowTuplesSet> {
        let first = self.inputs.first()?.timestamp;
        // A session only closes on tick once it spans a full length.
        if self.config.window_type == WindowType::Session && now - self.config.length < first {
            return None;
        }
        self.scan(now)
    }

    /// Session idle gap elapsed: flush and clear the buffer.
    pub fn on_session_timeout(&mut self, now: EventTime) -> Option<WindowTuplesSet> {
        if self.inputs.is_empty() {
            return None;
        }
        let result = self.scan(now);
        self.inputs.clear();
        result
    }

    /// Fire the windows that should have fired while the rule was down.
    ///
    /// Replays triggers from the restored trigger time up to the next tick
    /// after `now`, so restored tuples are emitted in the windows they belong
    /// to.
    pub fn catch_up(&mut self, now: EventTime) -> Vec<WindowTuplesSet> {
        let mut fired = Vec::new();
        let Some(mut next) = self.trigger_time else {
            return fired;
        };
        let Some(period) = self.config.ticker_interval() else {
            return fired;
        };
        let period = period.as_millis() as i64;
        let next_tick = now + period;
        match self.config.window_type {
            WindowType::Tumbling | WindowType::Hopping => {
                while !self.inputs.is_empty() {
                    next += period;
                    if next > next_tick {
                        break;
                    }
                    debug!(window = %self.name, trigger_time = next, "Triggered by restore inputs");
                    fired.extend(self.scan(next));
                }
            }
            WindowType::Session => {
                while let Some(end) =
                    session_window_end(&self.inputs, self.config.length, self.config.interval)
                {
                    if end > next_tick {
                        break;
                    }
                    debug!(window = %self.name, trigger_time = end, "Triggered by restore inputs");
                    fired.extend(self.scan(end));
                }
            }
            _ => {}
        }
        fired
    }

    // ── Event time ───────────────────────────────────────────────────────────

    /// Buffer an admitted event-time tuple. Windows only fire on watermarks.
    pub fn push_event(&mut self, tuple: Tuple) {
        self.inputs.push(tuple);
    }

    /// Fire every window whose end is at or before `watermark`.
    pub fn on_watermark(
        &mut self,
        watermark: EventTime,
        generator: &WatermarkGenerator,
    ) -> Vec<WindowTuplesSet> {
        let mut window_end = self.next_window_end;
        if window_end.is_none()
            || matches!(
                self.config.window_type,
                WindowType::Session | WindowType::Sliding
            )
        {
            window_end =
                generator.next_window(&self.inputs, self.prev_window_end, watermark, self.triggered);
        }

        let mut fired = Vec::new();
        while let Some(end) = window_end.filter(|end| *end <= watermark) {
            let result = self.scan(end);
            self.triggered = result.is_some();
            fired.extend(result);
            self.prev_window_end = Some(end);
            window_end = generator.next_window(&self.inputs, Some(end), watermark, self.triggered);
        }
        self.next_window_end = window_end;
        fired
    }

    // ── Scan ─────────────────────────────────────────────────────────────────

    /// Emit the buffered tuples with `timestamp <= trigger_time`.
    ///
    /// Tumbling and session windows drop what they emit. Hopping and sliding
    /// windows first evict tuples older than `length + delta` and keep the
    /// rest. Returns `None` for an empty window.
    pub fn scan(&mut self, trigger_time: EventTime) -> Option<WindowTuplesSet> {
        debug!(window = %self.name, trigger_time, buffered = self.inputs.len(), "Window triggered");
        let overlapping = self.config.is_overlapping();
        let horizon = if overlapping {
            self.config
                .length
                .saturating_add(self.eviction_delta(trigger_time))
        } else {
            0
        };

        let mut results = WindowTuplesSet::new(trigger_time);
        let mut retained = Vec::with_capacity(self.inputs.len());
        for tuple in std::mem::take(&mut self.inputs) {
            if overlapping && trigger_time.saturating_sub(tuple.timestamp) > horizon {
                debug!(window = %self.name, timestamp = tuple.timestamp, "Evicted expired tuple");
                continue;
            }
            if tuple.timestamp > trigger_time {
                retained.push(tuple);
            } else if overlapping {
                results.add_tuple(tuple.clone());
                retained.push(tuple);
            } else {
                results.add_tuple(tuple);
            }
        }
        self.inputs = retained;
        self.trigger_time = Some(trigger_time);

        if results.is_empty() {
            debug!(window = %self.name, trigger_time, "Nothing to emit");
            return None;
        }
        if self.is_event_time {
            results.sort();
        }
        Some(results)
    }

    /// Extra age tolerated on eviction: the lag of this trigger behind its
    /// schedule. Unbounded on the first trigger.
    fn eviction_delta(&self, trigger_time: EventTime) -> i64 {
        let Some(last) = self.trigger_time else {
            return i64::MAX;
        };
        if self.is_event_time || self.config.interval <= 0 {
            return 0;
        }
        let delta = trigger_time - last - self.config.interval;
        if delta > LONG_COMPUTATION_THRESHOLD_MS {
            warn!(
                window = %self.name,
                last_trigger = last,
                trigger_time,
                "Possible long computation in window; triggers are running late"
            );
        }
        delta.max(0)
    }

    fn split_count_window(&mut self) -> Result<Vec<WindowTuplesSet>> {
        self.msg_count += 1;
        if self.msg_count % self.config.count_interval() != 0 {
            return Ok(Vec::new());
        }
        self.msg_count = 0;

        let mut list = TupleList::new(std::mem::take(&mut self.inputs), self.config.length as usize)?;
        let mut fired = Vec::new();
        while list.has_more_count_window() {
            fired.push(list.next_count_window());
        }
        self.inputs = list.into_rest();
        if let Some(window) = fired.last() {
            self.trigger_time = Some(window.window_end);
        }
        Ok(fired)
    }

    // ── State ────────────────────────────────────────────────────────────────

    /// Copy the recoverable state into the context ahead of a snapshot.
    pub fn save_to(&self, ctx: &StreamContext) -> Result<()> {
        ctx.put_state(WINDOW_INPUTS_KEY, &self.inputs)?;
        ctx.put_state(TRIGGER_TIME_KEY, &self.trigger_time)?;
        ctx.put_state(MSG_COUNT_KEY, &self.msg_count)?;
        Ok(())
    }

    /// Load state restored into the context from the last checkpoint.
    pub fn restore_from(&mut self, ctx: &StreamContext) -> Result<()> {
        if let Some(inputs) = ctx.get_state::<Vec<Tuple>>(WINDOW_INPUTS_KEY)? {
            self.inputs = inputs;
        }
        if let Some(trigger_time) = ctx.get_state::<Option<EventTime>>(TRIGGER_TIME_KEY)? {
            self.trigger_time = trigger_time;
        }
        if let Some(msg_count) = ctx.get_state::<i64>(MSG_COUNT_KEY)? {
            self.msg_count = msg_count;
        }
        if !self.inputs.is_empty() {
            debug!(window = %self.name, restored = self.inputs.len(), "Restored window inputs");
        }
        Ok(())
    }
}
