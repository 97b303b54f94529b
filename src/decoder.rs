//! Chunk decoder: turns a fragmented byte stream into newline-delimited text
//! chunks.
//!
//! The `/chat` wire contract frames each logical chunk with `\n` (a preceding
//! `\r` is tolerated and treated as part of the delimiter). Reads from the
//! network can split a chunk, or a multi-byte UTF-8 character, at any byte,
//! so the decoder keeps two pieces of state between reads:
//!
//! - `pending`: trailing bytes of an incomplete UTF-8 sequence
//! - `buffer`: decoded text after the last delimiter
//!
//! Whitespace-only lines carry no content and are dropped.

use std::collections::VecDeque;

use futures_util::stream::{self, Stream, StreamExt};

use crate::error::{ChatError, Result};

/// Incremental line decoder scoped to a single response body.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
    buffer: String,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network read and return every line it completed, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>> {
        self.decode(bytes)?;
        Ok(self.drain_lines())
    }

    /// Signal end-of-stream and flush the retained remainder.
    ///
    /// Returns `Ok(None)` when the remainder is blank. An unfinished UTF-8
    /// sequence at this point can never complete and is a decode error.
    pub fn finish(&mut self) -> Result<Option<String>> {
        if !self.pending.is_empty() {
            let dangling = self.pending.len();
            self.pending.clear();
            return Err(ChatError::Decode(format!(
                "stream ended inside a multi-byte character ({dangling} dangling bytes)"
            )));
        }
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(rest))
        }
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                self.buffer.push_str(text);
                self.pending.clear();
            }
            Err(e) => {
                if e.error_len().is_some() {
                    let offset = e.valid_up_to();
                    self.pending.clear();
                    return Err(ChatError::Decode(format!(
                        "invalid UTF-8 sequence at byte {offset} of read"
                    )));
                }
                // Incomplete tail: decode the valid prefix, keep the rest.
                let valid = e.valid_up_to();
                let (head, _) = self.pending.split_at(valid);
                let text = std::str::from_utf8(head)
                    .map_err(|e| ChatError::Decode(e.to_string()))?;
                self.buffer.push_str(text);
                self.pending.drain(..valid);
            }
        }
        Ok(())
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line_end) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=line_end).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

struct LineState<S> {
    source: S,
    decoder: ChunkDecoder,
    ready: VecDeque<String>,
    done: bool,
}

/// Adapt a byte stream into a lazy stream of decoded lines.
///
/// The sequence is finite and non-restartable. The first error (from the
/// source or from decoding) is yielded once, after every line decoded before
/// it, and ends the stream.
pub fn lines<S>(source: S) -> impl Stream<Item = Result<String>>
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
{
    let state = LineState {
        source,
        decoder: ChunkDecoder::new(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(line) = st.ready.pop_front() {
                return Some((Ok(line), st));
            }
            if st.done {
                return None;
            }
            match st.source.next().await {
                Some(Ok(bytes)) => match st.decoder.push(&bytes) {
                    Ok(decoded) => st.ready.extend(decoded),
                    Err(e) => {
                        st.done = true;
                        return Some((Err(e), st));
                    }
                },
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.done = true;
                    match st.decoder.finish() {
                        Ok(Some(last)) => st.ready.push_back(last),
                        Ok(None) => {}
                        Err(e) => return Some((Err(e), st)),
                    }
                }
            }
        }
    })
}
