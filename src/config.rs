use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use regex::Regex;
use tree_sitter::{Language, Node, Query, QueryCapture};

use crate::highlight::Highlight;
use crate::Error;

/// Capture names that highlight queries conventionally use. Individual
/// grammars deviate from this table; it exists as a linting baseline for
/// [`HighlightConfiguration::nonconformant_capture_names`].
pub const STANDARD_CAPTURE_NAMES: &[&str] = &[
    "attribute",
    "boolean",
    "carriage-return",
    "comment",
    "comment.documentation",
    "constant",
    "constant.builtin",
    "constructor",
    "constructor.builtin",
    "embedded",
    "error",
    "escape",
    "function",
    "function.builtin",
    "keyword",
    "markup",
    "markup.bold",
    "markup.heading",
    "markup.italic",
    "markup.link",
    "markup.link.url",
    "markup.list",
    "markup.list.checked",
    "markup.list.numbered",
    "markup.list.unchecked",
    "markup.list.unnumbered",
    "markup.quote",
    "markup.raw",
    "markup.raw.block",
    "markup.raw.inline",
    "markup.strikethrough",
    "module",
    "number",
    "operator",
    "property",
    "property.builtin",
    "punctuation",
    "punctuation.bracket",
    "punctuation.delimiter",
    "punctuation.special",
    "string",
    "string.escape",
    "string.regexp",
    "string.special",
    "string.special.symbol",
    "tag",
    "type",
    "type.builtin",
    "variable",
    "variable.builtin",
    "variable.member",
    "variable.parameter",
];

/// The compiled queries and capture metadata that drive highlighting for
/// one language.
///
/// Built once, then shared freely: nothing in it mutates after
/// construction except the atomically-swapped recognized-name mapping.
pub struct HighlightConfiguration {
    pub language: Language,
    pub language_name: String,
    pub query: Query,
    pub(crate) combined_injections_query: Option<Query>,
    pub(crate) locals_pattern_index: usize,
    pub(crate) highlights_pattern_index: usize,
    pub(crate) highlight_indices: ArcSwap<Vec<Highlight>>,
    pub(crate) non_local_variable_patterns: Vec<bool>,
    pub(crate) injection_content_capture_index: Option<u32>,
    pub(crate) injection_language_capture_index: Option<u32>,
    pub(crate) local_scope_capture_index: Option<u32>,
    pub(crate) local_def_capture_index: Option<u32>,
    pub(crate) local_def_value_capture_index: Option<u32>,
    pub(crate) local_ref_capture_index: Option<u32>,
}

impl HighlightConfiguration {
    /// Compile the three query files of a language into one configuration.
    ///
    /// `highlights_query` carries the patterns that actually color code;
    /// without it no capture events are produced. `injection_query` and
    /// `locals_query` may each be empty when the language does not embed
    /// other languages or track local variables. `language_name` is the
    /// name reported in `LayerStart` events and the name `injection.self`
    /// resolves to.
    pub fn new(
        language: Language,
        language_name: impl Into<String>,
        highlights_query: &str,
        injection_query: &str,
        locals_query: &str,
    ) -> Result<Self, Error> {
        // Join the three sections into one source text, noting where each
        // section begins.
        let mut query_source = String::with_capacity(
            injection_query.len() + locals_query.len() + highlights_query.len(),
        );
        query_source.push_str(injection_query);
        let locals_query_offset = query_source.len();
        query_source.push_str(locals_query);
        let highlights_query_offset = query_source.len();
        query_source.push_str(highlights_query);

        // One compiled query serves all three roles; a pattern's role is
        // recovered from its index. Comparing each pattern's start byte
        // against the section offsets yields the two boundaries, which
        // partition the indices in order injections < locals < highlights.
        let mut query = Query::new(&language, &query_source)?;
        let mut locals_pattern_index = 0;
        let mut highlights_pattern_index = 0;
        for i in 0..query.pattern_count() {
            let pattern_offset = query.start_byte_for_pattern(i);
            if pattern_offset < locals_query_offset {
                locals_pattern_index += 1;
            }
            if pattern_offset < highlights_query_offset {
                highlights_pattern_index += 1;
            }
        }

        // Combined injections run through a secondary query compiled from
        // the injection section alone. Each injection pattern is enabled in
        // exactly one of the two queries: combined patterns only in the
        // secondary, everything else only in the main one.
        let mut combined_injections_query = Query::new(&language, injection_query)?;
        let mut has_combined_queries = false;
        for pattern_index in 0..locals_pattern_index {
            let settings = query.property_settings(pattern_index);
            if settings.iter().any(|s| &*s.key == "injection.combined") {
                has_combined_queries = true;
                query.disable_pattern(pattern_index);
            } else {
                combined_injections_query.disable_pattern(pattern_index);
            }
        }
        let combined_injections_query = has_combined_queries.then_some(combined_injections_query);

        // Patterns carrying `#is-not? local` must not fire on nodes the
        // locals pass recognizes as local variables; flag them per index.
        let non_local_variable_patterns = (0..query.pattern_count())
            .map(|i| {
                query
                    .property_predicates(i)
                    .iter()
                    .any(|(prop, positive)| !*positive && prop.key.as_ref() == "local")
            })
            .collect();

        // Resolve the well-known capture names to their indices once, so
        // the hot loops compare integers.
        let mut injection_content_capture_index = None;
        let mut injection_language_capture_index = None;
        let mut local_def_capture_index = None;
        let mut local_def_value_capture_index = None;
        let mut local_ref_capture_index = None;
        let mut local_scope_capture_index = None;
        for (i, name) in query.capture_names().iter().enumerate() {
            let i = Some(i as u32);
            match *name {
                "injection.content" => injection_content_capture_index = i,
                "injection.language" => injection_language_capture_index = i,
                "local.definition" => local_def_capture_index = i,
                "local.definition-value" => local_def_value_capture_index = i,
                "local.reference" => local_ref_capture_index = i,
                "local.scope" => local_scope_capture_index = i,
                _ => {}
            }
        }

        let highlight_indices =
            ArcSwap::from_pointee(vec![Highlight::DEFAULT; query.capture_names().len()]);
        Ok(HighlightConfiguration {
            language,
            language_name: language_name.into(),
            query,
            combined_injections_query,
            locals_pattern_index,
            highlights_pattern_index,
            highlight_indices,
            non_local_variable_patterns,
            injection_content_capture_index,
            injection_language_capture_index,
            local_scope_capture_index,
            local_def_capture_index,
            local_def_value_capture_index,
            local_ref_capture_index,
        })
    }

    /// Get a slice containing all of the highlight names used in the
    /// configuration.
    pub fn names(&self) -> &[&str] {
        self.query.capture_names()
    }

    /// Set the list of recognized highlight names.
    ///
    /// Query capture names form dot-separated hierarchies such as
    /// `punctuation.bracket` or `function.method.builtin`, and callers
    /// decide how finely they distinguish them: a theme that only knows
    /// `function` still styles a `function.builtin.constructor` capture,
    /// while one that also lists `function.builtin` gets the more specific
    /// bucket.
    ///
    /// Each capture name is walked down its hierarchy (`a.b.c` → `a.b` →
    /// `a`) until it equals a recognized name; the resulting index is the
    /// [`Highlight`] surfaced in capture events. Names that never match map
    /// to [`Highlight::DEFAULT`].
    ///
    /// May be called again at any time; the mapping is swapped atomically.
    pub fn configure(&self, recognized_names: &[String]) {
        let mut indices = Vec::with_capacity(self.query.capture_names().len());
        for capture_name in self.query.capture_names() {
            let mut capture_name = *capture_name;
            let index = loop {
                if let Some(i) = recognized_names.iter().position(|name| name == capture_name) {
                    break Highlight(i as u32);
                }
                match capture_name.rfind('.') {
                    Some(i) => capture_name = &capture_name[..i],
                    None => break Highlight::DEFAULT,
                }
            };
            indices.push(index);
        }
        self.highlight_indices.store(Arc::new(indices));
    }

    /// Lint helper: the query's capture names that appear in neither the
    /// given allowlist nor the underscore-prefixed private namespace.
    ///
    /// Passing an empty list checks against [`STANDARD_CAPTURE_NAMES`].
    pub fn nonconformant_capture_names(&self, capture_names: &[&str]) -> Vec<&str> {
        let capture_names = if capture_names.is_empty() {
            STANDARD_CAPTURE_NAMES
        } else {
            capture_names
        };
        self.names()
            .iter()
            .copied()
            .filter(|name| !(name.starts_with('_') || capture_names.contains(name)))
            .collect()
    }

    /// Resolve the injected language and content node for one match of an
    /// injection pattern.
    ///
    /// The language is determined, in priority order, by the text of an
    /// `injection.language` capture, an `injection.language` property, the
    /// layer's own name (`injection.self`) or the parent layer's name
    /// (`injection.parent`).
    pub(crate) fn injection_for_match<'a>(
        &'a self,
        query: &'a Query,
        pattern_index: usize,
        captures: &[QueryCapture<'a>],
        parent_name: Option<&'a str>,
        source: &'a [u8],
    ) -> (Option<&'a str>, Option<Node<'a>>, bool) {
        let mut language_name = None;
        let mut content_node = None;
        for capture in captures {
            let index = Some(capture.index);
            if index == self.injection_language_capture_index {
                language_name = capture.node.utf8_text(source).ok();
            } else if index == self.injection_content_capture_index {
                content_node = Some(capture.node);
            }
        }

        let mut include_children = false;
        for prop in query.property_settings(pattern_index) {
            match prop.key.as_ref() {
                // Property settings are the fallback when no language
                // capture matched: a hard-coded name, or a marker deferring
                // to this layer's or the parent layer's language.
                "injection.language" if language_name.is_none() => {
                    language_name = prop.value.as_deref();
                }
                "injection.self" if language_name.is_none() => {
                    language_name = Some(self.language_name.as_str());
                }
                "injection.parent" if language_name.is_none() => {
                    language_name = parent_name;
                }

                // Whether the nested document should also cover the content
                // node's children; recorded here, consumed by the range
                // computation.
                "injection.include-children" => include_children = true,
                _ => {}
            }
        }

        (language_name, content_node, include_children)
    }
}

/// Assemble a language's query text, recursively splicing in the queries
/// of any languages named by `; inherits: lang1,lang2` directives.
/// `read_query_text` supplies the raw text per (language, filename).
pub fn read_query(
    language: &str,
    filename: &str,
    mut read_query_text: impl FnMut(&str, &str) -> String,
) -> String {
    fn read_query_impl(
        language: &str,
        filename: &str,
        read_query_text: &mut impl FnMut(&str, &str) -> String,
    ) -> String {
        static INHERITS_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r";+\s*inherits\s*:?\s*([a-z_,()-]+)\s*").unwrap());

        let query = read_query_text(language, filename);

        INHERITS_REGEX
            .replace_all(&query, |captures: &regex::Captures| {
                captures[1]
                    .split(',')
                    .map(|language| {
                        format!(
                            "\n{}\n",
                            read_query_impl(language, filename, &mut *read_query_text)
                        )
                    })
                    .collect::<String>()
            })
            .to_string()
    }
    read_query_impl(language, filename, &mut read_query_text)
}
