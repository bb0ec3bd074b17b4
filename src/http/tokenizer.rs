//! Lazy cursor over an immutable byte view.
//!
//! Every operation either fully succeeds and moves a cursor, or fails and
//! leaves the tokenizer untouched. The parser relies on that to try a match
//! (for example a version suffix) and fall back without bookkeeping.
//!
//! The tokenizer keeps two cursors: `start` advances as prefixes are consumed
//! and `end` retreats as suffixes are consumed. The unconsumed view is always
//! `buf[start..end]`.

use crate::http::charset::CharacterSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tokenizer<'a> {
    buf: &'a [u8],
    start: usize,
    end: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            start: 0,
            end: buf.len(),
        }
    }

    /// The unconsumed bytes.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.start..self.end]
    }

    pub fn at_end(&self) -> bool {
        self.start >= self.end
    }

    /// Bytes consumed from the front so far.
    pub fn parsed_size(&self) -> usize {
        self.start
    }

    /// Consumes the maximal run of `set` members from the front.
    ///
    /// Fails without moving the cursor when the run is empty.
    pub fn prefix(&mut self, set: &CharacterSet) -> Option<&'a [u8]> {
        self.prefix_limited(set, usize::MAX)
    }

    /// Like [`prefix`](Self::prefix) but stops after `limit` bytes.
    pub fn prefix_limited(&mut self, set: &CharacterSet, limit: usize) -> Option<&'a [u8]> {
        let view = self.remaining();
        let len = view
            .iter()
            .take(limit)
            .take_while(|b| set.contains(**b))
            .count();
        if len == 0 {
            return None;
        }
        self.start += len;
        Some(&view[..len])
    }

    /// Consumes the maximal run of `set` members from the back.
    pub fn suffix(&mut self, set: &CharacterSet) -> Option<&'a [u8]> {
        let view = self.remaining();
        let len = view.iter().rev().take_while(|b| set.contains(**b)).count();
        if len == 0 {
            return None;
        }
        self.end -= len;
        Some(&view[view.len() - len..])
    }

    /// Consumes `literal` if the view starts with it.
    pub fn skip(&mut self, literal: &[u8]) -> bool {
        if literal.is_empty() || !self.remaining().starts_with(literal) {
            return false;
        }
        self.start += literal.len();
        true
    }

    /// Consumes exactly one leading byte if it belongs to `set`.
    pub fn skip_one(&mut self, set: &CharacterSet) -> bool {
        match self.remaining().first() {
            Some(b) if set.contains(*b) => {
                self.start += 1;
                true
            }
            _ => false,
        }
    }

    /// Consumes all leading `set` members and returns how many were skipped.
    pub fn skip_all(&mut self, set: &CharacterSet) -> usize {
        self.prefix(set).map_or(0, <[u8]>::len)
    }

    /// Consumes `literal` if the view ends with it.
    pub fn skip_suffix(&mut self, literal: &[u8]) -> bool {
        if literal.is_empty() || !self.remaining().ends_with(literal) {
            return false;
        }
        self.end -= literal.len();
        true
    }

    /// Consumes exactly one trailing byte if it belongs to `set`.
    pub fn skip_one_trailing(&mut self, set: &CharacterSet) -> bool {
        match self.remaining().last() {
            Some(b) if set.contains(*b) => {
                self.end -= 1;
                true
            }
            _ => false,
        }
    }

    /// Consumes all trailing `set` members and returns how many were skipped.
    pub fn skip_all_trailing(&mut self, set: &CharacterSet) -> usize {
        self.suffix(set).map_or(0, <[u8]>::len)
    }

    /// Consumes everything that is left.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = self.remaining();
        self.start = self.end;
        rest
    }
}
