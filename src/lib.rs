//! Syntax analysis on top of tree-sitter: highlight events, symbol tags and
//! foldable ranges, driven by the standard query files grammars ship with.
//!
//! The crate exposes three engines over the same query machinery:
//!
//! * [`Highlighter`] turns a source buffer and a [`HighlightConfiguration`]
//!   into a flat stream of [`Event`]s. Regions whose language differs from
//!   the outer file (a regex inside a string, markup inside a comment) are
//!   reparsed as nested layers, delimited by `LayerStart`/`LayerEnd` events.
//! * [`Tagger`] extracts [`Tag`] records for definitions and references,
//!   with local-variable shadowing and documentation comments attached.
//! * [`Folder`] produces one [`Fold`] per multi-line captured node.
//!
//! Configurations are built once per language and are safe to share between
//! threads; the engines themselves are single-consumer and meant to be
//! reused across files.

pub mod config;
pub mod folds;
pub mod highlight;
mod peek;
pub mod resolve;
pub mod tags;

pub use config::{read_query, HighlightConfiguration, STANDARD_CAPTURE_NAMES};
pub use folds::{Fold, FoldConfiguration, Folder};
pub use highlight::{Event, Highlight, Highlighter};
pub use resolve::{resolve_refs, ResolvedTag};
pub use tags::{Tag, Tagger, TagsConfiguration};

/// Upper bound on in-flight query matches per cursor, to keep memory usage
/// predictable on pathological sources.
pub const TREE_SITTER_MATCH_LIMIT: u32 = 256;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid query\n{0}")]
    Query(#[from] tree_sitter::QueryError),
    #[error("invalid doc-strip regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("unknown capture name {0:?}")]
    UnknownCapture(String),
    #[error("language incompatible with this version of tree-sitter")]
    InvalidLanguage,
    #[error("iteration cancelled")]
    Cancelled,
}
