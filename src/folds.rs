use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use tree_sitter::{Language, Parser, Point, Query, QueryCursor, Range, Tree};

use crate::{peek, Error, TREE_SITTER_MATCH_LIMIT};

/// A range suitable for folding in a UI. `line_range` widens `range` to
/// cover the full source lines it intersects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fold {
    pub range: Range,
    pub line_range: Range,
}

/// A compiled folds query for one language, shareable across threads.
pub struct FoldConfiguration {
    pub language: Language,
    pub query: Query,
    fold_capture_index: Option<u32>,
}

impl FoldConfiguration {
    /// A query without a `@fold` capture is valid and yields no folds.
    pub fn new(language: Language, folds_query: &str) -> Result<Self, Error> {
        let query = Query::new(&language, folds_query)?;
        let fold_capture_index = query.capture_index_for_name("fold");
        Ok(FoldConfiguration {
            language,
            query,
            fold_capture_index,
        })
    }
}

/// Computes folds, one file at a time. Reusable across files; not safe to
/// share between threads.
pub struct Folder {
    parser: Parser,
    cursor: QueryCursor,
}

impl Default for Folder {
    fn default() -> Self {
        Self::new()
    }
}

impl Folder {
    pub fn new() -> Self {
        Folder {
            parser: Parser::new(),
            cursor: QueryCursor::new(),
        }
    }

    pub fn parser(&mut self) -> &mut Parser {
        &mut self.parser
    }

    /// Parse `source` and stream one fold per multi-line captured node,
    /// skipping captures that start on the same line as the previous fold.
    pub fn folds<'a>(
        &'a mut self,
        config: &'a FoldConfiguration,
        source: &'a [u8],
        cancellation_flag: Option<&'a AtomicUsize>,
    ) -> Result<impl Iterator<Item = Result<Fold, Error>> + 'a, Error> {
        self.parser
            .set_language(&config.language)
            .map_err(|_| Error::InvalidLanguage)?;
        self.parser.reset();
        let tree = self.parser.parse(source, None).ok_or(Error::Cancelled)?;

        // The iterator must own the tree it captures from. A `Tree` is a
        // thin wrapper around a heap pointer, so handing the cursor an
        // unbounded root node and then moving the tree into the iterator
        // leaves every node valid.
        let tree_ref = unsafe { mem::transmute::<&Tree, &'static Tree>(&tree) };
        self.cursor.set_match_limit(TREE_SITTER_MATCH_LIMIT);
        let captures = peek::Captures::new(self.cursor.captures(
            &config.query,
            tree_ref.root_node(),
            source,
        ));

        Ok(FoldsIter {
            source,
            _tree: tree,
            captures,
            config,
            cancellation_flag,
            last_fold_row: None,
            done: false,
        })
    }
}

struct FoldsIter<'a> {
    source: &'a [u8],
    _tree: Tree,
    captures: peek::Captures<'a>,
    config: &'a FoldConfiguration,
    cancellation_flag: Option<&'a AtomicUsize>,
    last_fold_row: Option<usize>,
    done: bool,
}

impl<'a> Iterator for FoldsIter<'a> {
    type Item = Result<Fold, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if let Some(cancellation_flag) = self.cancellation_flag {
                if cancellation_flag.load(Ordering::Relaxed) != 0 {
                    self.done = true;
                    return Some(Err(Error::Cancelled));
                }
            }

            let (mat, capture_index) = self.captures.next()?;
            let capture = mat.captures[capture_index];

            if Some(capture.index) != self.config.fold_capture_index {
                continue;
            }

            let range = capture.node.range();

            // A fold must span multiple lines.
            if range.start_point.row == range.end_point.row {
                continue;
            }

            // The query may capture the same line through several patterns;
            // the first one wins.
            if self.last_fold_row == Some(range.start_point.row) {
                continue;
            }
            self.last_fold_row = Some(range.start_point.row);

            return Some(Ok(Fold {
                range,
                line_range: line_span(self.source, range),
            }));
        }
    }
}

/// Widen `range` to whole lines: from column 0 of the start row to the end
/// of the end row.
fn line_span(source: &[u8], range: Range) -> Range {
    let line_start_byte = range.start_byte - range.start_point.column;
    let end_line_start = range.end_byte - range.end_point.column;
    let rest = &source[end_line_start..];
    let end_line_len = rest
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(rest.len());

    Range {
        start_byte: line_start_byte,
        start_point: Point::new(range.start_point.row, 0),
        end_byte: end_line_start + end_line_len,
        end_point: Point::new(range.end_point.row, end_line_len),
    }
}
