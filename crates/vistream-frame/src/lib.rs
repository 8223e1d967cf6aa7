// vistream-frame/src/lib.rs
// ============================================================
// Frame data model for the vistream relay
// A Frame is an immutable snapshot: sequence number, capture
// timestamp, shared RGB24 pixel buffer, plus the overlay text
// the relay attaches just before emission.
// ------------------------------------------------------------
// Public API:
//   * Frame::new(seq, w, h, pixels) – build a frame at arrival
//   * Frame::with_overlay(text)     – attach caption text
//   * wrap_overlay(text, max)       – greedy word wrap for the
//     caption renderer downstream
// ============================================================

//! vistream – frame layer
//!
//! Frames are cheap to clone: the pixel buffer lives behind an [`Arc`],
//! so the one copy referenced by an in-flight inference request never
//! duplicates pixel data.  The relay owns a frame for exactly one
//! processing step; nothing else retains it.

use std::sync::Arc;
use std::time::SystemTime;

/// One captured frame, RGB24, stride `width * 3`.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic sequence number, assigned at arrival.
    pub seq: u64,
    /// Capture timestamp.
    pub ts: SystemTime,
    pub width: u32,
    pub height: u32,
    /// Shared pixel buffer; cloning a `Frame` never copies pixels.
    pub pixels: Arc<Vec<u8>>,
    /// Latest resolved caption, attached by the relay before emission.
    pub overlay: Option<String>,
}

impl Frame {
    pub fn new(seq: u64, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            seq,
            ts: SystemTime::now(),
            width,
            height,
            pixels: Arc::new(pixels),
            overlay: None,
        }
    }

    /// Return the same frame with caption text attached.
    pub fn with_overlay(mut self, text: impl Into<String>) -> Self {
        self.overlay = Some(text.into());
        self
    }
}

/// Greedy word wrap for overlay captions.
///
/// Splits `text` into lines of at most `max_chars` characters, breaking
/// on whitespace only.  A single word longer than `max_chars` gets a
/// line of its own rather than being split mid-word.
pub fn wrap_overlay(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if current.is_empty() {
            current.push_str(word);
        } else if current.len() + 1 + word.len() <= max_chars {
            current.push(' ');
            current.push_str(word);
        } else {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_pixels() {
        let f = Frame::new(1, 2, 2, vec![0u8; 12]);
        let g = f.clone();
        assert!(Arc::ptr_eq(&f.pixels, &g.pixels));
        assert_eq!(g.seq, 1);
    }

    #[test]
    fn overlay_attach() {
        let f = Frame::new(7, 1, 1, vec![0, 0, 0]).with_overlay("a red cup");
        assert_eq!(f.overlay.as_deref(), Some("a red cup"));
    }

    #[test]
    fn wrap_short_text_single_line() {
        assert_eq!(wrap_overlay("hello world", 60), vec!["hello world"]);
    }

    #[test]
    fn wrap_breaks_on_words() {
        let lines = wrap_overlay("one two three four", 9);
        assert_eq!(lines, vec!["one two", "three", "four"]);
    }

    #[test]
    fn wrap_long_word_gets_own_line() {
        let lines = wrap_overlay("a superlongunbreakableword b", 10);
        assert_eq!(lines, vec!["a", "superlongunbreakableword", "b"]);
    }

    #[test]
    fn wrap_empty_is_empty() {
        assert!(wrap_overlay("", 60).is_empty());
    }
}
