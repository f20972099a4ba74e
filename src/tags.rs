use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::{mem, ops};

use regex::Regex;
use tree_sitter::{Language, Node, Parser, Point, Query, QueryCursor, QueryPredicateArg, Tree};

use crate::{peek, Error, TREE_SITTER_MATCH_LIMIT};

/// Lines longer than this are clamped in [`Tag::line_range`].
const MAX_LINE_LEN: usize = 180;

/// A named program entity found in the source: a definition or a reference.
///
/// Tags carry byte ranges into the source buffer rather than copies of the
/// text; use the accessors to resolve them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// The full syntactic extent of the tagged construct.
    pub range: ops::Range<usize>,
    /// The identifier span within the source.
    pub name_range: ops::Range<usize>,
    /// The owning scope's identifier span, e.g. the class of a method.
    pub scope_range: Option<ops::Range<usize>>,
    /// The trimmed source line containing the name, clamped to 180 bytes.
    pub line_range: ops::Range<usize>,
    /// Row of the line containing the name.
    pub line_row: usize,
    /// Start and end point of the name.
    pub span: ops::Range<Point>,
    /// UTF-16 column start and end of the name on its line.
    pub utf16_column_range: ops::Range<usize>,
    /// Documentation attached to the definition, possibly empty.
    pub docs: String,
    /// True if the capture name was `definition.*`.
    pub is_definition: bool,
    /// Index into [`TagsConfiguration::syntax_type_names`].
    pub syntax_type_id: u32,
}

impl Tag {
    fn ignored(name_range: ops::Range<usize>, scope_range: Option<ops::Range<usize>>) -> Self {
        Tag {
            range: usize::MAX..usize::MAX,
            name_range,
            scope_range,
            line_range: 0..0,
            line_row: 0,
            span: Point::new(0, 0)..Point::new(0, 0),
            utf16_column_range: 0..0,
            docs: String::new(),
            is_definition: false,
            syntax_type_id: 0,
        }
    }

    /// Sentinel tags produced by `@ignore` captures report this as true.
    pub fn is_ignored(&self) -> bool {
        self.range.start == usize::MAX
    }

    pub fn name<'a>(&self, source: &'a [u8]) -> std::borrow::Cow<'a, str> {
        String::from_utf8_lossy(&source[self.name_range.clone()])
    }

    pub fn scope_name<'a>(&self, source: &'a [u8]) -> Option<std::borrow::Cow<'a, str>> {
        self.scope_range
            .clone()
            .map(|range| String::from_utf8_lossy(&source[range]))
    }

    /// The name qualified by its scope, joined with a dot.
    pub fn full_name(&self, source: &[u8]) -> String {
        match self.scope_name(source) {
            Some(scope) => format!("{}.{}", scope, self.name(source)),
            None => self.name(source).into_owned(),
        }
    }

    pub fn content<'a>(&self, source: &'a [u8]) -> std::borrow::Cow<'a, str> {
        String::from_utf8_lossy(&source[self.range.clone()])
    }

    pub fn line<'a>(&self, source: &'a [u8]) -> std::borrow::Cow<'a, str> {
        String::from_utf8_lossy(&source[self.line_range.clone()])
    }
}

#[derive(Debug, Clone, Copy)]
struct NamedCapture {
    syntax_type_id: u32,
    is_definition: bool,
}

#[derive(Debug, Default)]
struct PatternInfo {
    docs_adjacent_capture: Option<u32>,
    local_scope_inherits: bool,
    name_must_be_nonlocal: bool,
    doc_strip_regex: Option<Regex>,
}

/// The compiled `locals + tags` query and capture metadata for one
/// language. Built once and freely shareable across threads.
pub struct TagsConfiguration {
    pub language: Language,
    pub query: Query,
    syntax_type_names: Vec<String>,
    capture_map: HashMap<u32, NamedCapture>,
    tags_pattern_index: usize,
    doc_capture_index: Option<u32>,
    name_capture_index: Option<u32>,
    scope_capture_index: Option<u32>,
    ignore_capture_index: Option<u32>,
    local_scope_capture_index: Option<u32>,
    local_definition_capture_index: Option<u32>,
    pattern_info: Vec<PatternInfo>,
}

impl TagsConfiguration {
    /// Compiles the concatenation of `locals_query` and `tags_query` into a
    /// single query and classifies its capture names.
    ///
    /// `definition.KIND` and `reference.KIND` captures register `KIND` as a
    /// syntax type name in first-seen order; any other capture that is not
    /// one of the known special names (and is not `_`-prefixed) is an
    /// [`Error::UnknownCapture`].
    pub fn new(language: Language, tags_query: &str, locals_query: &str) -> Result<Self, Error> {
        let mut query_source = String::with_capacity(locals_query.len() + tags_query.len());
        query_source.push_str(locals_query);
        let tags_query_offset = query_source.len();
        query_source.push_str(tags_query);

        let query = Query::new(&language, &query_source)?;
        let mut tags_pattern_index = 0;
        for i in 0..query.pattern_count() {
            if query.start_byte_for_pattern(i) < tags_query_offset {
                tags_pattern_index += 1;
            }
        }

        let mut syntax_type_names: Vec<String> = Vec::new();
        let mut capture_map = HashMap::new();
        let mut doc_capture_index = None;
        let mut name_capture_index = None;
        let mut scope_capture_index = None;
        let mut ignore_capture_index = None;
        let mut local_scope_capture_index = None;
        let mut local_definition_capture_index = None;
        for (i, name) in query.capture_names().iter().enumerate() {
            let index = i as u32;
            match *name {
                "doc" => doc_capture_index = Some(index),
                "name" => name_capture_index = Some(index),
                "scope" => scope_capture_index = Some(index),
                "ignore" => ignore_capture_index = Some(index),
                "local.scope" => local_scope_capture_index = Some(index),
                "local.definition" => local_definition_capture_index = Some(index),
                "local.definition-value" | "local.reference" => {}
                _ if name.starts_with('_') => {}
                _ => {
                    let (kind, is_definition) = if let Some(kind) = name.strip_prefix("definition.")
                    {
                        (kind, true)
                    } else if let Some(kind) = name.strip_prefix("reference.") {
                        (kind, false)
                    } else {
                        return Err(Error::UnknownCapture(name.to_string()));
                    };

                    let syntax_type_id = syntax_type_names
                        .iter()
                        .position(|n| n == kind)
                        .unwrap_or_else(|| {
                            syntax_type_names.push(kind.to_string());
                            syntax_type_names.len() - 1
                        }) as u32;

                    capture_map.insert(
                        index,
                        NamedCapture {
                            syntax_type_id,
                            is_definition,
                        },
                    );
                }
            }
        }

        let mut pattern_info = Vec::with_capacity(query.pattern_count());
        for pattern_index in 0..query.pattern_count() {
            let mut info = PatternInfo {
                local_scope_inherits: true,
                ..PatternInfo::default()
            };

            for (property, positive) in query.property_predicates(pattern_index) {
                if !positive && property.key.as_ref() == "local" {
                    info.name_must_be_nonlocal = true;
                }
            }
            for property in query.property_settings(pattern_index) {
                if property.key.as_ref() == "local.scope-inherits"
                    && property
                        .value
                        .as_ref()
                        .map_or(true, |value| value.as_ref() == "false")
                {
                    info.local_scope_inherits = false;
                }
            }

            if let Some(doc_capture_index) = doc_capture_index {
                for predicate in query.general_predicates(pattern_index) {
                    if predicate.args.len() < 2 {
                        continue;
                    }
                    let QueryPredicateArg::Capture(first) = &predicate.args[0] else {
                        continue;
                    };
                    if *first != doc_capture_index {
                        continue;
                    }
                    match (predicate.operator.as_ref(), &predicate.args[1]) {
                        ("select-adjacent!", QueryPredicateArg::Capture(anchor)) => {
                            info.docs_adjacent_capture = Some(*anchor);
                        }
                        ("strip!", QueryPredicateArg::String(pattern)) => {
                            info.doc_strip_regex = Some(Regex::new(pattern)?);
                        }
                        _ => {}
                    }
                }
            }
            pattern_info.push(info);
        }

        Ok(TagsConfiguration {
            language,
            query,
            syntax_type_names,
            capture_map,
            tags_pattern_index,
            doc_capture_index,
            name_capture_index,
            scope_capture_index,
            ignore_capture_index,
            local_scope_capture_index,
            local_definition_capture_index,
            pattern_info,
        })
    }

    /// The syntax type names registered by the query, in first-seen order.
    /// [`Tag::syntax_type_id`] indexes into this slice.
    pub fn syntax_type_names(&self) -> &[String] {
        &self.syntax_type_names
    }

    pub fn syntax_type_name(&self, id: u32) -> &str {
        &self.syntax_type_names[id as usize]
    }
}

/// Extracts tags from source code, one file at a time.
///
/// A `Tagger` owns a parser and a query cursor and can be reused across
/// files; it is not safe to share between threads.
pub struct Tagger {
    parser: Parser,
    cursor: QueryCursor,
}

impl Default for Tagger {
    fn default() -> Self {
        Self::new()
    }
}

impl Tagger {
    pub fn new() -> Self {
        Tagger {
            parser: Parser::new(),
            cursor: QueryCursor::new(),
        }
    }

    pub fn parser(&mut self) -> &mut Parser {
        &mut self.parser
    }

    /// Parse `source` and stream its tags, ordered by name position.
    ///
    /// The second element of the returned pair reports whether the parse
    /// tree contains syntax errors; tag extraction proceeds either way.
    pub fn tags<'a>(
        &'a mut self,
        config: &'a TagsConfiguration,
        source: &'a [u8],
        cancellation_flag: Option<&'a AtomicUsize>,
    ) -> Result<(impl Iterator<Item = Result<Tag, Error>> + 'a, bool), Error> {
        self.parser
            .set_language(&config.language)
            .map_err(|_| Error::InvalidLanguage)?;
        self.parser.reset();
        let tree = self.parser.parse(source, None).ok_or(Error::Cancelled)?;
        let has_error = tree.root_node().has_error();

        // The iterator must own the tree it matches against. A `Tree` is a
        // thin wrapper around a heap pointer, so handing the cursor an
        // unbounded root node and then moving the tree into the iterator
        // leaves every node valid.
        let tree_ref = unsafe { mem::transmute::<&Tree, &'static Tree>(&tree) };
        self.cursor.set_match_limit(TREE_SITTER_MATCH_LIMIT);
        let matches = peek::Matches::new(self.cursor.matches(
            &config.query,
            tree_ref.root_node(),
            source,
        ));

        Ok((
            TagsIter {
                source,
                _tree: tree,
                matches,
                config,
                cancellation_flag,
                scopes: vec![LocalScope {
                    inherits: false,
                    range: 0..source.len(),
                    local_defs: Vec::new(),
                }],
                tag_queue: VecDeque::new(),
                prev_line_info: None,
                done: false,
            },
            has_error,
        ))
    }
}

struct LocalDef<'a> {
    name: &'a [u8],
}

struct LocalScope<'a> {
    inherits: bool,
    range: ops::Range<usize>,
    local_defs: Vec<LocalDef<'a>>,
}

struct QueuedTag {
    tag: Tag,
    pattern_index: usize,
}

/// Line-dependent state carried from one tag to the next, so consecutive
/// tags on the same row don't rescan the line.
struct LineInfo {
    utf8_position: Point,
    utf8_byte: usize,
    utf16_column: usize,
    line_range: ops::Range<usize>,
}

struct TagsIter<'a> {
    source: &'a [u8],
    _tree: Tree,
    matches: peek::Matches<'a>,
    config: &'a TagsConfiguration,
    cancellation_flag: Option<&'a AtomicUsize>,
    scopes: Vec<LocalScope<'a>>,
    tag_queue: VecDeque<QueuedTag>,
    prev_line_info: Option<LineInfo>,
    done: bool,
}

impl<'a> Iterator for TagsIter<'a> {
    type Item = Result<Tag, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            // A queued tag can leave the queue once it ends before the
            // newest queued tag begins: no later match can sort ahead of
            // it anymore.
            if let Some(last_entry) = self.tag_queue.back() {
                if self.tag_queue.len() > 1
                    && self.tag_queue[0].tag.name_range.end < last_entry.tag.name_range.start
                {
                    let tag = self.tag_queue.pop_front().unwrap().tag;
                    if tag.is_ignored() {
                        continue;
                    }
                    return Some(Ok(tag));
                }
            }

            if let Some(cancellation_flag) = self.cancellation_flag {
                if cancellation_flag.load(Ordering::Relaxed) != 0 {
                    self.done = true;
                    return Some(Err(Error::Cancelled));
                }
            }

            if let Some(mat) = self.matches.next() {
                let pattern_info = &self.config.pattern_info[mat.pattern_index];

                // Matches from the locals sub-query only update the scope
                // stack; they never produce a tag themselves.
                if mat.pattern_index < self.config.tags_pattern_index {
                    for capture in &mat.captures {
                        let index = Some(capture.index);
                        let range = capture.node.byte_range();
                        if index == self.config.local_scope_capture_index {
                            self.scopes.push(LocalScope {
                                inherits: pattern_info.local_scope_inherits,
                                range,
                                local_defs: Vec::new(),
                            });
                        } else if index == self.config.local_definition_capture_index {
                            // Register with the innermost scope containing
                            // the definition.
                            if let Some(scope) = self.scopes.iter_mut().rev().find(|scope| {
                                scope.range.start <= range.start && scope.range.end >= range.end
                            }) {
                                scope.local_defs.push(LocalDef {
                                    name: &self.source[range],
                                });
                            }
                        }
                    }
                    continue;
                }

                let mut name_node: Option<Node> = None;
                let mut doc_nodes: Vec<Node> = Vec::new();
                let mut tag_node: Option<Node> = None;
                let mut scope_node: Option<Node> = None;
                let mut syntax_type_id = 0;
                let mut is_definition = false;
                let mut docs_adjacent_node: Option<Node> = None;
                let mut is_ignored = false;

                for capture in &mat.captures {
                    let index = Some(capture.index);

                    if index == self.config.ignore_capture_index {
                        is_ignored = true;
                        name_node = Some(capture.node);
                    }
                    if pattern_info.docs_adjacent_capture == Some(capture.index) {
                        docs_adjacent_node = Some(capture.node);
                    }

                    if index == self.config.name_capture_index {
                        name_node = Some(capture.node);
                    } else if index == self.config.doc_capture_index {
                        doc_nodes.push(capture.node);
                    } else if index == self.config.scope_capture_index {
                        scope_node = Some(capture.node);
                    }

                    if let Some(named_capture) = self.config.capture_map.get(&capture.index) {
                        tag_node = Some(capture.node);
                        syntax_type_id = named_capture.syntax_type_id;
                        is_definition = named_capture.is_definition;
                    }
                }

                let Some(name_node) = name_node else { continue };
                let name_range = name_node.byte_range();
                let scope_range = scope_node.map(|node| node.byte_range());

                let tag = if let Some(tag_node) = tag_node {
                    if name_node.has_error() {
                        continue;
                    }

                    if pattern_info.name_must_be_nonlocal {
                        let name = &self.source[name_range.clone()];
                        let mut is_local = false;
                        for scope in self.scopes.iter().rev() {
                            if scope.range.start <= name_range.start
                                && scope.range.end >= name_range.end
                            {
                                if scope.local_defs.iter().any(|def| def.name == name) {
                                    is_local = true;
                                    break;
                                }
                                if !scope.inherits {
                                    break;
                                }
                            }
                        }
                        if is_local {
                            continue;
                        }
                    }

                    // With an adjacency anchor, only the comment block that
                    // runs right up to the anchor counts as documentation:
                    // walk backward from the last doc node while the rows
                    // stay contiguous.
                    let mut doc_start_index = 0;
                    if let (Some(docs_adjacent_node), false) =
                        (docs_adjacent_node, doc_nodes.is_empty())
                    {
                        doc_start_index = doc_nodes.len();
                        let mut start_row = docs_adjacent_node.start_position().row;
                        while doc_start_index > 0 {
                            let doc_node = &doc_nodes[doc_start_index - 1];
                            let prev_doc_end_row = doc_node.end_position().row;
                            if prev_doc_end_row + 1 >= start_row {
                                doc_start_index -= 1;
                                start_row = doc_node.start_position().row;
                            } else {
                                break;
                            }
                        }
                    }

                    // Join the accepted doc nodes into one string, running
                    // each through the pattern's strip regex first.
                    let mut docs = String::new();
                    for doc_node in &doc_nodes[doc_start_index..] {
                        if let Ok(content) = doc_node.utf8_text(self.source) {
                            let content = match &pattern_info.doc_strip_regex {
                                Some(regex) => regex.replace_all(content, ""),
                                None => content.into(),
                            };
                            if !docs.is_empty() {
                                docs.push('\n');
                            }
                            docs.push_str(&content);
                        }
                    }

                    let tag_range = tag_node.byte_range();
                    let range = tag_range.start.min(name_range.start)
                        ..tag_range.end.max(name_range.end);
                    let span = name_node.start_position()..name_node.end_position();

                    // Line-derived fields are cached per row: a tag sitting
                    // on the same line as the previous one picks up its
                    // line span and continues the UTF-16 column count from
                    // where it stopped.
                    let mut prev_utf16_column = 0;
                    let mut prev_utf8_byte = name_range.start - span.start.column;
                    let line_range = match &self.prev_line_info {
                        Some(info) if info.utf8_position.row == span.start.row => {
                            if info.utf8_position.column <= span.start.column {
                                prev_utf8_byte = info.utf8_byte;
                                prev_utf16_column = info.utf16_column;
                            }
                            info.line_range.clone()
                        }
                        _ => line_range(self.source, name_range.start, span.start, MAX_LINE_LEN),
                    };

                    let utf16_start_column =
                        prev_utf16_column + utf16_len(&self.source[prev_utf8_byte..name_range.start]);
                    let utf16_end_column =
                        utf16_start_column + utf16_len(&self.source[name_range.clone()]);

                    self.prev_line_info = Some(LineInfo {
                        utf8_position: span.end,
                        utf8_byte: name_range.end,
                        utf16_column: utf16_end_column,
                        line_range: line_range.clone(),
                    });

                    Tag {
                        range,
                        name_range,
                        scope_range,
                        line_range,
                        line_row: span.start.row,
                        span,
                        utf16_column_range: utf16_start_column..utf16_end_column,
                        docs,
                        is_definition,
                        syntax_type_id,
                    }
                } else if is_ignored {
                    Tag::ignored(name_range, scope_range)
                } else {
                    continue;
                };

                // At most one tag survives per name position; when two
                // patterns collide, the one appearing earlier in the query
                // wins. Keeping the queue sorted makes the collision check
                // a binary search.
                match self
                    .tag_queue
                    .binary_search_by_key(&tag.name_range.start, |entry| entry.tag.name_range.start)
                {
                    Ok(i) => {
                        if self.tag_queue[i].pattern_index > mat.pattern_index {
                            self.tag_queue[i] = QueuedTag {
                                tag,
                                pattern_index: mat.pattern_index,
                            };
                        }
                    }
                    Err(i) => self.tag_queue.insert(
                        i,
                        QueuedTag {
                            tag,
                            pattern_index: mat.pattern_index,
                        },
                    ),
                }
            } else if let Some(entry) = self.tag_queue.pop_front() {
                // Matches are exhausted; whatever is still queued goes out
                // in order, sentinels included.
                return Some(Ok(entry.tag));
            } else {
                return None;
            }
        }
    }
}

fn utf16_len(bytes: &[u8]) -> usize {
    String::from_utf8_lossy(bytes).encode_utf16().count()
}

/// The trimmed line containing `start_byte`, clamped to `max_line_len`
/// bytes.
fn line_range(
    source: &[u8],
    start_byte: usize,
    start_point: Point,
    max_line_len: usize,
) -> ops::Range<usize> {
    // Trim leading whitespace.
    let mut line_start_byte = start_byte - start_point.column;
    while line_start_byte < source.len() && source[line_start_byte].is_ascii_whitespace() {
        line_start_byte += 1;
    }

    let max_line_len = max_line_len.min(source.len() - line_start_byte);
    let text_after_line_start = &source[line_start_byte..line_start_byte + max_line_len];
    let line_len = text_after_line_start
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(text_after_line_start.len());

    // Trim trailing whitespace.
    let mut line_end_byte = line_start_byte + line_len;
    while line_end_byte > line_start_byte && source[line_end_byte - 1].is_ascii_whitespace() {
        line_end_byte -= 1;
    }

    line_start_byte..line_end_byte
}
