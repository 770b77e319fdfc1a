use super::*;

/// Splits a buffer into count windows of `size` tuples, newest last.
#[derive(Debug)]
pub struct TupleList {
    tuples: Vec<Tuple>,
    index: usize,
    size: usize,
}

impl TupleList {
    pub fn new(tuples: Vec<Tuple>, size: usize) -> Result<Self> {
        if tuples.is_empty() {
            return Err(anyhow!("tuple list is empty"));
        }
        if size == 0 {
            return Err(anyhow!("window size must be > 0"));
        }
        Ok(Self {
            tuples,
            index: 0,
            size,
        })
    }

    pub fn has_more_count_window(&self) -> bool {
        self.tuples.len() >= self.size && self.index == 0
    }

    /// The last `size` tuples as one window.
    pub fn next_count_window(&mut self) -> WindowTuplesSet {
        let start = self.tuples.len() - self.size;
        let window_end = self.tuples.last().map(|t| t.timestamp).unwrap_or_default();
        let mut results = WindowTuplesSet::new(window_end);
        for tuple in &self.tuples[start..] {
            results.add_tuple(tuple.clone());
        }
        self.index = 1;
        results
    }

    /// Tuples kept for the next window: the newest `size - 1`.
    pub fn into_rest(mut self) -> Vec<Tuple> {
        let keep = self.size - 1;
        if self.tuples.len() > keep {
            self.tuples.drain(..self.tuples.len() - keep);
        }
        self.tuples
    }
}
