//! Stop sequence handling for generated text
//!
//! TGI includes the matched stop sequence in its output. Clients of the chat
//! API expect it removed, and for streams that means holding back any text
//! that might turn out to be the start of a stop sequence.

/// Cut `text` at the earliest occurrence of any stop sequence
pub fn trim_at_stop<'a>(text: &'a str, stops: &[String]) -> &'a str {
    match earliest_match(text, stops) {
        Some(pos) => &text[..pos],
        None => text,
    }
}

fn earliest_match(text: &str, stops: &[String]) -> Option<usize> {
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}

/// Incremental stop sequence filter for token streams
#[derive(Debug, Clone, Default)]
pub struct StopSequenceFilter {
    stops: Vec<String>,
    pending: String,
    stopped: bool,
}

impl StopSequenceFilter {
    pub fn new(stops: Vec<String>) -> Self {
        Self {
            stops: stops.into_iter().filter(|s| !s.is_empty()).collect(),
            pending: String::new(),
            stopped: false,
        }
    }

    /// Whether a stop sequence has been seen
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Feed generated text, returning what is safe to emit now
    pub fn push(&mut self, text: &str) -> String {
        if self.stopped {
            return String::new();
        }
        self.pending.push_str(text);

        if let Some(pos) = earliest_match(&self.pending, &self.stops) {
            let out = self.pending[..pos].to_string();
            self.pending.clear();
            self.stopped = true;
            return out;
        }

        let hold = self.partial_suffix_len();
        let split = self.pending.len() - hold;
        self.pending.drain(..split).collect()
    }

    /// Flush held-back text at the end of generation
    pub fn finish(&mut self) -> String {
        if self.stopped {
            String::new()
        } else {
            std::mem::take(&mut self.pending)
        }
    }

    /// Length of the longest suffix of `pending` that is a proper prefix of a
    /// stop sequence
    fn partial_suffix_len(&self) -> usize {
        let mut longest = 0;
        for stop in &self.stops {
            let max = stop.len().saturating_sub(1).min(self.pending.len());
            for len in (longest + 1..=max).rev() {
                let start = self.pending.len() - len;
                if !self.pending.is_char_boundary(start) || !stop.is_char_boundary(len) {
                    continue;
                }
                if stop.starts_with(&self.pending[start..]) {
                    longest = len;
                    break;
                }
            }
        }
        longest
    }
}
