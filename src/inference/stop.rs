//! Incremental text assembly for the decode loop.
//!
//! Token pieces arrive as raw bytes that may split a UTF-8 sequence, and a
//! stop sequence may straddle several pieces. [`Utf8Buffer`] holds back
//! incomplete sequences; [`StopMatcher`] accumulates the decoded text,
//! truncates it at the first stop sequence, and releases only text that can
//! no longer turn into a stop sequence.

/// Reassembles UTF-8 text from byte pieces.
#[derive(Debug, Default)]
pub struct Utf8Buffer {
    pending: Vec<u8>,
}

impl Utf8Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes, returning every complete character. Invalid sequences
    /// become U+FFFD; a trailing incomplete sequence is kept for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is left, lossily.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// Result of feeding one fragment to the matcher.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StopStep {
    /// Text safe to emit now.
    pub emit: String,
    /// The stop sequence that ended generation, if any.
    pub matched: Option<String>,
}

/// Stop-sequence matcher over the growing generated text.
#[derive(Debug)]
pub struct StopMatcher {
    stops: Vec<String>,
    max_len: usize,
    text: String,
    emitted: usize,
    stopped: bool,
}

impl StopMatcher {
    /// Empty stop strings are ignored.
    pub fn new<S: AsRef<str>>(stops: &[S]) -> Self {
        let stops: Vec<String> = stops
            .iter()
            .map(|s| s.as_ref().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let max_len = stops.iter().map(String::len).max().unwrap_or(0);
        Self {
            stops,
            max_len,
            text: String::new(),
            emitted: 0,
            stopped: false,
        }
    }

    pub fn push(&mut self, fragment: &str) -> StopStep {
        if self.stopped {
            return StopStep::default();
        }

        let prev_len = self.text.len();
        self.text.push_str(fragment);

        // A new match must end inside the fragment, so it starts at most
        // max_len - 1 bytes before it.
        let search_from = floor_char_boundary(&self.text, prev_len.saturating_sub(self.max_len));
        if let Some((pos, stop)) = self.find_stop(search_from) {
            self.text.truncate(pos);
            self.stopped = true;
            let emit = self.take_emittable(pos);
            return StopStep {
                emit,
                matched: Some(stop),
            };
        }

        let safe_end = self.text.len() - self.partial_stop_len();
        StopStep {
            emit: self.take_emittable(safe_end),
            matched: None,
        }
    }

    /// Release held-back text once generation ends without a match.
    pub fn finish(&mut self) -> String {
        let end = self.text.len();
        self.take_emittable(end)
    }

    /// Generated text so far, truncated at the stop sequence if one matched.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    fn find_stop(&self, from: usize) -> Option<(usize, String)> {
        let haystack = &self.text[from..];
        self.stops
            .iter()
            .filter_map(|stop| haystack.find(stop.as_str()).map(|p| (from + p, stop)))
            .min_by_key(|(p, _)| *p)
            .map(|(p, stop)| (p, stop.clone()))
    }

    /// Length of the longest text suffix that is a proper prefix of a stop sequence.
    fn partial_stop_len(&self) -> usize {
        let start = floor_char_boundary(&self.text, self.text.len().saturating_sub(self.max_len));
        let tail = &self.text[start..];
        tail.char_indices()
            .map(|(i, _)| &tail[i..])
            .find(|suffix| {
                self.stops
                    .iter()
                    .any(|stop| stop.len() > suffix.len() && stop.starts_with(suffix))
            })
            .map_or(0, str::len)
    }

    fn take_emittable(&mut self, end: usize) -> String {
        if end <= self.emitted {
            return String::new();
        }
        let out = self.text[self.emitted..end].to_string();
        self.emitted = end;
        out
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(stops: &[&str], pieces: &[&str]) -> (String, String, Option<String>) {
        let mut matcher = StopMatcher::new(stops);
        let mut streamed = String::new();
        let mut matched = None;
        for piece in pieces {
            let step = matcher.push(piece);
            streamed.push_str(&step.emit);
            if step.matched.is_some() {
                matched = step.matched;
                break;
            }
        }
        if matched.is_none() {
            streamed.push_str(&matcher.finish());
        }
        (matcher.into_text(), streamed, matched)
    }

    #[test]
    fn test_stop_inside_single_piece() {
        let (text, streamed, matched) = run(&["</s>"], &["Hello</s>World"]);
        assert_eq!(text, "Hello");
        assert_eq!(streamed, "Hello");
        assert_eq!(matched.as_deref(), Some("</s>"));
    }

    #[test]
    fn test_stop_across_pieces_is_never_streamed() {
        let (text, streamed, matched) = run(&["</s>"], &["Hello", "</", "s", ">", "World"]);
        assert_eq!(text, "Hello");
        assert_eq!(streamed, "Hello");
        assert!(matched.is_some());
    }

    #[test]
    fn test_false_partial_is_released() {
        let (text, streamed, matched) = run(&["</s>"], &["a</", "b", "c"]);
        assert_eq!(text, "a</bc");
        assert_eq!(streamed, "a</bc");
        assert!(matched.is_none());
    }

    #[test]
    fn test_earliest_stop_wins() {
        let (text, _, matched) = run(&["World", "\n"], &["Hi\nthere World"]);
        assert_eq!(text, "Hi");
        assert_eq!(matched.as_deref(), Some("\n"));
    }

    #[test]
    fn test_held_prefix_flushed_at_end() {
        let (text, streamed, matched) = run(&["User:"], &["Answer. Us"]);
        assert!(matched.is_none());
        assert_eq!(text, "Answer. Us");
        assert_eq!(streamed, "Answer. Us");
    }

    #[test]
    fn test_no_stops_streams_everything() {
        let mut matcher = StopMatcher::new::<&str>(&[]);
        assert_eq!(matcher.push("abc").emit, "abc");
        assert_eq!(matcher.push("").emit, "");
        assert_eq!(matcher.finish(), "");
    }

    #[test]
    fn test_multibyte_text() {
        let (text, streamed, _) = run(&["ωx"], &["Καλημέρα ω", "ς"]);
        assert_eq!(text, "Καλημέρα ως");
        assert_eq!(streamed, "Καλημέρα ως");
    }

    #[test]
    fn test_utf8_buffer_joins_split_sequence() {
        let bytes = "έ".as_bytes();
        let mut buf = Utf8Buffer::new();
        assert_eq!(buf.push(&bytes[..1]), "");
        assert_eq!(buf.push(&bytes[1..]), "έ");
        assert_eq!(buf.finish(), "");
    }

    #[test]
    fn test_utf8_buffer_replaces_invalid() {
        let mut buf = Utf8Buffer::new();
        assert_eq!(buf.push(&[b'a', 0xff, b'b']), "a\u{FFFD}b");
        assert_eq!(buf.push(&[0xe2, 0x82]), "");
        assert_eq!(buf.finish(), "\u{FFFD}");
    }
}
