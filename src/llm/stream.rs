//! Think-tag stripping for streamed model output.
//!
//! Reasoning models interleave `<think>…</think>` blocks with the visible
//! answer. The filter removes those regions from user-facing streams even
//! when a tag is split across chunk boundaries, holding back only as many
//! trailing characters as could be the start of a tag.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// Incremental `<think>` region stripper.
///
/// Feed chunks in arrival order; each call returns the text safe to emit.
/// Call [`ThinkTagFilter::finish`] after the last chunk to flush anything
/// held back as a potential partial tag.
#[derive(Debug, Default)]
pub struct ThinkTagFilter {
    inside_think: bool,
    /// Carry-over that might be a tag prefix split across chunks.
    pending: String,
}

impl ThinkTagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one chunk, returning the emittable text.
    pub fn feed(&mut self, chunk: &str) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.push_str(chunk);

        let mut out = String::new();
        loop {
            if self.inside_think {
                match buf.find(CLOSE_TAG) {
                    Some(pos) => {
                        buf.drain(..pos + CLOSE_TAG.len());
                        self.inside_think = false;
                    }
                    None => {
                        // Keep a possible partial close tag, drop the rest.
                        self.pending = trailing_tag_prefix(&buf, CLOSE_TAG);
                        return out;
                    }
                }
            } else {
                match buf.find(OPEN_TAG) {
                    Some(pos) => {
                        out.push_str(&buf[..pos]);
                        buf.drain(..pos + OPEN_TAG.len());
                        self.inside_think = true;
                    }
                    None => {
                        let hold = trailing_tag_prefix(&buf, OPEN_TAG);
                        let emit_len = buf.len() - hold.len();
                        out.push_str(&buf[..emit_len]);
                        self.pending = hold;
                        return out;
                    }
                }
            }
        }
    }

    /// Flush held-back text after the stream ends.
    ///
    /// An unterminated `<think>` region is dropped entirely; a partial tag
    /// that never completed is emitted as ordinary text.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        if self.inside_think {
            String::new()
        } else {
            pending
        }
    }
}

/// Longest suffix of `buf` that is a proper prefix of `tag`.
fn trailing_tag_prefix(buf: &str, tag: &str) -> String {
    let max = tag.len().saturating_sub(1).min(buf.len());
    for len in (1..=max).rev() {
        if buf.is_char_boundary(buf.len() - len) && tag.starts_with(&buf[buf.len() - len..]) {
            return buf[buf.len() - len..].to_string();
        }
    }
    String::new()
}

/// Strip all `<think>…</think>` regions from a complete string.
pub fn strip_thinking_tags(text: &str) -> String {
    let mut filter = ThinkTagFilter::new();
    let mut out = filter.feed(text);
    out.push_str(&filter.finish());
    out
}
