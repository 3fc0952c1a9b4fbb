//! Turns a generator's chunk stream into answer words.
//!
//! Generated text starts with an echo of the chat template and prompt, then
//! the answer, then an end marker. The extractor splits the accumulated text
//! on whitespace, keeps a count of the words it has already looked at, and only
//! examines words past that count. Words before the start marker are swallowed;
//! the word carrying the end marker closes the answer.
//!
//! The word-count diff assumes the text only ever grows by appending. A
//! generator that rewrites earlier text (for example by re-tokenizing a
//! partial word with different whitespace) can skip or repeat words.

use serde::{Deserialize, Serialize};

pub const DEFAULT_START_MARKER: &str = "<|end|><|assistant|>";
pub const DEFAULT_END_MARKER: &str = "<|end|>";

/// How successive chunks relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    /// Every chunk is the full text generated so far.
    #[default]
    Cumulative,
    /// Every chunk is new text to append.
    Incremental,
}

/// Sentinels delimiting the answer inside generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    /// Empty means the answer starts with the first word.
    pub start: String,
    pub end: String,
}

impl Markers {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

impl Default for Markers {
    fn default() -> Self {
        Self::new(DEFAULT_START_MARKER, DEFAULT_END_MARKER)
    }
}

/// A word ready to be sent to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    pub text: String,
    pub is_last: bool,
}

impl Word {
    fn new(text: impl Into<String>, is_last: bool) -> Self {
        Self {
            text: text.into(),
            is_last,
        }
    }
}

pub struct AnswerExtractor {
    markers: Markers,
    mode: ChunkMode,
    buffer: String,
    consumed: usize,
    started: bool,
    finished: bool,
}

impl AnswerExtractor {
    pub fn new(markers: Markers, mode: ChunkMode) -> Self {
        let started = markers.start.is_empty();
        Self {
            markers,
            mode,
            buffer: String::new(),
            consumed: 0,
            started,
            finished: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// True once a word with `is_last` has been produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one chunk and collect the words it completes.
    pub fn push(&mut self, chunk: &str) -> Vec<Word> {
        if self.finished {
            return Vec::new();
        }
        match self.mode {
            ChunkMode::Cumulative => {
                self.buffer.clear();
                self.buffer.push_str(chunk);
            }
            ChunkMode::Incremental => self.buffer.push_str(chunk),
        }

        let buffer = std::mem::take(&mut self.buffer);
        let words: Vec<&str> = buffer.split_whitespace().collect();
        let trailing_open = !buffer.ends_with(char::is_whitespace);
        let complete = if trailing_open {
            words.len().saturating_sub(1)
        } else {
            words.len()
        };

        let mut out = Vec::new();
        while self.consumed < complete && !self.finished {
            self.examine(words[self.consumed], &mut out);
            self.consumed += 1;
        }

        // An unterminated word that already holds the end marker cannot grow
        // into anything that would be sent.
        if !self.finished
            && trailing_open
            && self.consumed + 1 == words.len()
            && self.started
            && self.contains_end(words[self.consumed])
        {
            self.examine(words[self.consumed], &mut out);
            self.consumed += 1;
        }

        self.buffer = buffer;
        out
    }

    /// Flush at end of stream. The returned words always end with `is_last`
    /// unless the answer was already closed.
    pub fn finish(&mut self) -> Vec<Word> {
        if self.finished {
            return Vec::new();
        }

        let buffer = std::mem::take(&mut self.buffer);
        let mut out = Vec::new();
        for word in buffer.split_whitespace().skip(self.consumed) {
            if self.finished {
                break;
            }
            self.examine(word, &mut out);
            self.consumed += 1;
        }

        if !self.finished {
            match out.last_mut() {
                Some(last) => last.is_last = true,
                None => out.push(Word::new("", true)),
            }
            self.finished = true;
        }
        self.buffer = buffer;
        out
    }

    fn contains_end(&self, word: &str) -> bool {
        !self.markers.end.is_empty() && word.contains(&self.markers.end)
    }

    fn examine(&mut self, word: &str, out: &mut Vec<Word>) {
        if self.started {
            if self.contains_end(word) {
                out.push(Word::new(word.replace(&self.markers.end, ""), true));
                self.finished = true;
            } else {
                out.push(Word::new(word, false));
            }
        } else if word.contains(&self.markers.start) {
            self.started = true;
        }
    }
}
