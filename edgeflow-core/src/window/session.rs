use super::*;

/// End of the first session that can be closed in `inputs`.
///
/// A session closes at `prev + gap` when two consecutive tuples are at least
/// `gap` apart, or at a `duration`-aligned tick once the session spans a full
/// duration, whichever comes first. The end always stays below the tuple
/// that opens the next session. Returns `None` while the session is
/// still open.
pub fn session_window_end(inputs: &[Tuple], duration: i64, gap: i64) -> Option<EventTime> {
    let first = inputs.first()?.timestamp;
    if duration <= 0 {
        return None;
    }
    let rem = first.rem_euclid(duration);
    let mut tick = if rem == 0 { first } else { first + duration - rem };
    let mut prev: Option<EventTime> = None;
    for tuple in inputs {
        let mut end = None;
        if let Some(prev) = prev {
            if tuple.timestamp - prev >= gap {
                end = Some((prev + gap).min(tuple.timestamp - 1));
            }
        }
        if tuple.timestamp > tick {
            if tick - duration > first && end.map_or(true, |end| tick < end) {
                end = Some(tick);
            }
            tick += duration;
        }
        if end.is_some() {
            return end;
        }
        prev = Some(tuple.timestamp);
    }
    None
}
