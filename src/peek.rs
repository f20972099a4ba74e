//! One-step lookahead over tree-sitter's query cursors.
//!
//! The streaming cursor reuses its internal capture buffer on every advance,
//! so a match obtained from it is only valid until the next step. These
//! wrappers copy each match's capture list into owned storage as it is
//! pulled, which is what makes holding on to a peeked match sound. This is a
//! correctness requirement for every consumer in this crate, not an
//! optimization.

use streaming_iterator::StreamingIterator;
use tree_sitter::{QueryCapture, QueryCaptures, QueryMatch, QueryMatches};

/// An owned copy of one query match.
#[derive(Debug, Clone)]
pub(crate) struct Match<'tree> {
    pub pattern_index: usize,
    pub captures: Vec<QueryCapture<'tree>>,
}

impl<'tree> Match<'tree> {
    fn copy_from(mat: &QueryMatch<'_, 'tree>) -> Self {
        Match {
            pattern_index: mat.pattern_index,
            captures: mat.captures.to_vec(),
        }
    }
}

/// Peekable wrapper around [`QueryCaptures`]. Yields `(match, index)` pairs
/// where `index` points at the capture within the match that this step is
/// about.
pub(crate) struct Captures<'a> {
    inner: QueryCaptures<'a, 'a, &'a [u8], &'a [u8]>,
    peeked: Option<Option<(Match<'a>, usize)>>,
}

impl<'a> Captures<'a> {
    pub fn new(inner: QueryCaptures<'a, 'a, &'a [u8], &'a [u8]>) -> Self {
        Captures {
            inner,
            peeked: None,
        }
    }

    fn pull(&mut self) -> Option<(Match<'a>, usize)> {
        self.inner
            .next()
            .map(|(mat, index)| (Match::copy_from(mat), *index))
    }

    pub fn next(&mut self) -> Option<(Match<'a>, usize)> {
        match self.peeked.take() {
            Some(peeked) => peeked,
            None => self.pull(),
        }
    }

    /// Idempotent: does not advance the underlying cursor.
    pub fn peek(&mut self) -> Option<&(Match<'a>, usize)> {
        if self.peeked.is_none() {
            self.peeked = Some(self.pull());
        }
        self.peeked.as_ref().unwrap().as_ref()
    }
}

/// Peekable wrapper around [`QueryMatches`].
pub(crate) struct Matches<'a> {
    inner: QueryMatches<'a, 'a, &'a [u8], &'a [u8]>,
    peeked: Option<Option<Match<'a>>>,
}

impl<'a> Matches<'a> {
    pub fn new(inner: QueryMatches<'a, 'a, &'a [u8], &'a [u8]>) -> Self {
        Matches {
            inner,
            peeked: None,
        }
    }

    fn pull(&mut self) -> Option<Match<'a>> {
        self.inner.next().map(Match::copy_from)
    }

    pub fn next(&mut self) -> Option<Match<'a>> {
        match self.peeked.take() {
            Some(peeked) => peeked,
            None => self.pull(),
        }
    }

    #[allow(dead_code)]
    pub fn peek(&mut self) -> Option<&Match<'a>> {
        if self.peeked.is_none() {
            self.peeked = Some(self.pull());
        }
        self.peeked.as_ref().unwrap().as_ref()
    }
}
