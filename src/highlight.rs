use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::{mem, ops, str};

use streaming_iterator::StreamingIterator;
use tree_sitter::{Node, Parser, Point, QueryCursor, Range, Tree};

use crate::config::HighlightConfiguration;
use crate::{peek, Error, TREE_SITTER_MATCH_LIMIT};

/// Injections nested deeper than this are dropped silently.
const MAX_INJECTION_DEPTH: u32 = 6;

/// The classification assigned to a highlighted region.
///
/// The value is an index into the list of recognized names passed to
/// [`HighlightConfiguration::configure`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Highlight(pub u32);

impl Highlight {
    /// The catch-all highlight carried by captures whose name maps to none
    /// of the recognized names.
    pub const DEFAULT: Highlight = Highlight(u32::MAX);

    pub fn is_default(self) -> bool {
        self == Self::DEFAULT
    }
}

/// One step of a highlighted rendering of the source.
///
/// `CaptureStart`/`CaptureEnd` and `LayerStart`/`LayerEnd` pairs are
/// balanced and properly nested; every byte of the source appears in
/// exactly one `Source` event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A run of source code to render with the currently open highlights.
    Source { start: usize, end: usize },
    /// A language layer opens. Everything up to the matching `LayerEnd`
    /// was parsed as `language`.
    LayerStart { language: String, range: Range },
    LayerEnd,
    /// A highlight region opens.
    CaptureStart { highlight: Highlight },
    CaptureEnd,
}

/// Drives highlighting: owns the parser and a pool of query cursors that
/// layers borrow and return.
///
/// Reuse one `Highlighter` across files to amortize parser and cursor
/// setup. It is single-consumer; give each thread its own.
pub struct Highlighter {
    parser: Parser,
    cursors: Vec<QueryCursor>,
}

#[derive(Debug)]
struct LocalDef<'a> {
    name: &'a str,
    value_range: ops::Range<usize>,
    highlight: Option<Highlight>,
}

#[derive(Debug)]
struct LocalScope<'a> {
    inherits: bool,
    range: ops::Range<usize>,
    local_defs: Vec<LocalDef<'a>>,
}

/// One event region that has been opened but not yet closed.
#[derive(Debug, Clone)]
enum OpenEvent<'a> {
    Capture(Highlight),
    Layer { language: &'a str, range: Range },
}

impl<'a> OpenEvent<'a> {
    fn start(&self) -> Event {
        match self {
            OpenEvent::Capture(highlight) => Event::CaptureStart {
                highlight: *highlight,
            },
            OpenEvent::Layer { language, range } => Event::LayerStart {
                language: (*language).to_string(),
                range: *range,
            },
        }
    }

    fn end(&self) -> Event {
        match self {
            OpenEvent::Capture(_) => Event::CaptureEnd,
            OpenEvent::Layer { .. } => Event::LayerEnd,
        }
    }
}

struct HighlightIter<'a, F>
where
    F: FnMut(&str) -> Option<&'a HighlightConfiguration> + 'a,
{
    source: &'a [u8],
    byte_offset: usize,
    highlighter: &'a mut Highlighter,
    injection_callback: F,
    cancellation_flag: Option<&'a AtomicUsize>,
    layers: Vec<HighlightIterLayer<'a>>,
    next_events: VecDeque<Event>,
    open_events: Vec<(u32, OpenEvent<'a>)>,
    last_highlight_range: Option<(usize, usize, u32)>,
    next_layer_id: u32,
    done: bool,
}

struct HighlightIterLayer<'a> {
    _tree: Tree,
    cursor: QueryCursor,
    captures: peek::Captures<'a>,
    config: &'a HighlightConfiguration,
    highlight_end_stack: Vec<usize>,
    scope_stack: Vec<LocalScope<'a>>,
    ranges: Vec<Range>,
    depth: u32,
    id: u32,
    parent_name: Option<&'a str>,
    /// Cover of `ranges`; delimits the layer's `LayerStart`/`LayerEnd`.
    span: Range,
    pending_start: bool,
    end_pending: bool,
    /// End byte of the most recently spawned injection, used to skip the
    /// remaining captures of an already-processed injection match.
    last_injection_end: usize,
}

impl Default for Highlighter {
    fn default() -> Self {
        Self::new()
    }
}

impl Highlighter {
    pub fn new() -> Self {
        Highlighter {
            parser: Parser::new(),
            cursors: Vec::new(),
        }
    }

    pub fn parser(&mut self) -> &mut Parser {
        &mut self.parser
    }

    /// Iterate over the highlighted regions for a given slice of source
    /// code.
    ///
    /// `injection_callback` is invoked whenever an injection pattern
    /// resolves to a language name; returning `None` leaves the injected
    /// region highlighted by the surrounding layer.
    pub fn highlight<'a>(
        &'a mut self,
        config: &'a HighlightConfiguration,
        source: &'a [u8],
        cancellation_flag: Option<&'a AtomicUsize>,
        mut injection_callback: impl FnMut(&str) -> Option<&'a HighlightConfiguration> + 'a,
    ) -> Result<impl Iterator<Item = Result<Event, Error>> + 'a, Error> {
        let end_point = match source.iter().rposition(|&b| b == b'\n') {
            Some(i) => Point::new(
                source.iter().filter(|&&b| b == b'\n').count(),
                source.len() - (i + 1),
            ),
            None => Point::new(0, source.len()),
        };
        let mut next_layer_id = 0;
        let layers = HighlightIterLayer::new(
            source,
            self,
            cancellation_flag,
            &mut injection_callback,
            config,
            0,
            None,
            vec![Range {
                start_byte: 0,
                end_byte: source.len(),
                start_point: Point::new(0, 0),
                end_point,
            }],
            &mut next_layer_id,
        )?;
        assert_ne!(layers.len(), 0);
        let mut result = HighlightIter {
            source,
            byte_offset: 0,
            highlighter: self,
            injection_callback,
            cancellation_flag,
            layers,
            next_events: VecDeque::new(),
            open_events: Vec::new(),
            last_highlight_range: None,
            next_layer_id,
            done: false,
        };
        result.sort_layers();
        Ok(result)
    }
}

impl<'a> HighlightIterLayer<'a> {
    /// Parse one language over `ranges` and wrap the result as a layer.
    ///
    /// Combined-injection patterns are resolved here, up front: every layer
    /// they give rise to is built immediately and returned alongside the
    /// requested one, which is why this returns a vector.
    #[allow(clippy::too_many_arguments)]
    fn new<F: FnMut(&str) -> Option<&'a HighlightConfiguration> + 'a>(
        source: &'a [u8],
        highlighter: &mut Highlighter,
        cancellation_flag: Option<&'a AtomicUsize>,
        injection_callback: &mut F,
        mut config: &'a HighlightConfiguration,
        mut depth: u32,
        mut parent_name: Option<&'a str>,
        mut ranges: Vec<Range>,
        next_layer_id: &mut u32,
    ) -> Result<Vec<Self>, Error> {
        let mut result = Vec::with_capacity(1);
        let mut queue = Vec::new();
        loop {
            if let Some(cancellation_flag) = cancellation_flag {
                if cancellation_flag.load(Ordering::Relaxed) != 0 {
                    return Err(Error::Cancelled);
                }
            }

            if highlighter.parser.set_included_ranges(&ranges).is_ok() {
                highlighter
                    .parser
                    .set_language(&config.language)
                    .map_err(|_| Error::InvalidLanguage)?;
                let tree = highlighter
                    .parser
                    .parse(source, None)
                    .ok_or(Error::Cancelled)?;
                let mut cursor = highlighter.cursors.pop().unwrap_or_else(QueryCursor::new);
                cursor.set_match_limit(TREE_SITTER_MATCH_LIMIT);

                // Combined-injection patterns merge every one of their
                // matches into a single nested document; group the content
                // nodes per pattern before spawning anything.
                if let Some(combined_injections_query) = &config.combined_injections_query {
                    let mut injections_by_pattern_index =
                        vec![
                            (None, Vec::new(), false);
                            combined_injections_query.pattern_count()
                        ];
                    {
                        let mut matches =
                            cursor.matches(combined_injections_query, tree.root_node(), source);
                        while let Some(mat) = matches.next() {
                            let entry = &mut injections_by_pattern_index[mat.pattern_index];
                            let (language_name, content_node, include_children) = config
                                .injection_for_match(
                                    combined_injections_query,
                                    mat.pattern_index,
                                    mat.captures,
                                    parent_name,
                                    source,
                                );
                            if language_name.is_some() {
                                entry.0 = language_name;
                            }
                            if let Some(content_node) = content_node {
                                entry.1.push(content_node);
                            }
                            entry.2 = include_children;
                        }
                    }
                    for (language_name, content_nodes, includes_children) in
                        injections_by_pattern_index
                    {
                        if let (Some(language_name), false) =
                            (language_name, content_nodes.is_empty())
                        {
                            if depth < MAX_INJECTION_DEPTH {
                                if let Some(next_config) = (injection_callback)(language_name) {
                                    let next_ranges = intersect_ranges(
                                        &ranges,
                                        &content_nodes,
                                        includes_children,
                                    );
                                    if !next_ranges.is_empty() {
                                        queue.push((
                                            next_config,
                                            depth + 1,
                                            Some(config.language_name.as_str()),
                                            next_ranges,
                                        ));
                                    }
                                }
                            }
                        }
                    }
                }

                // `captures` keeps borrows of the tree and the cursor, and
                // the layer has to own all three. Both borrowed values are
                // thin wrappers around heap pointers that stay valid when
                // the owners move into the struct, so the lifetimes are
                // erased here.
                let tree_ref = unsafe { mem::transmute::<&Tree, &'static Tree>(&tree) };
                let cursor_ref = unsafe {
                    mem::transmute::<&mut QueryCursor, &'static mut QueryCursor>(&mut cursor)
                };
                let captures = peek::Captures::new(cursor_ref.captures(
                    &config.query,
                    tree_ref.root_node(),
                    source,
                ));

                let span = span_over(&ranges);
                *next_layer_id += 1;
                log::trace!(
                    "layer {} ({}) over {}..{} at depth {}",
                    *next_layer_id,
                    config.language_name,
                    span.start_byte,
                    span.end_byte,
                    depth
                );
                result.push(HighlightIterLayer {
                    _tree: tree,
                    cursor,
                    captures,
                    config,
                    highlight_end_stack: Vec::new(),
                    scope_stack: vec![LocalScope {
                        inherits: false,
                        range: 0..usize::MAX,
                        local_defs: Vec::new(),
                    }],
                    ranges,
                    depth,
                    id: *next_layer_id,
                    parent_name,
                    span,
                    pending_start: true,
                    end_pending: false,
                    last_injection_end: 0,
                });
            } else {
                log::trace!(
                    "skipping injection for {}: ranges not accepted by the parser",
                    config.language_name
                );
            }

            if queue.is_empty() {
                break;
            }
            let (next_config, next_depth, next_parent_name, next_ranges) = queue.remove(0);
            config = next_config;
            depth = next_depth;
            parent_name = next_parent_name;
            ranges = next_ranges;
        }

        Ok(result)
    }

    /// The position and kind of this layer's next event, or `None` once the
    /// layer has nothing left to emit.
    ///
    /// Keys order the merged stream: by byte first, then closing events
    /// before opening ones. At equal positions a `LayerStart` prefers the
    /// shallower layer (outer brackets open first), while everything else
    /// prefers the deeper layer (an injection wins over its host).
    fn sort_key(&mut self) -> Option<(usize, u8, isize)> {
        const END: u8 = 0;
        const LAYER_START: u8 = 1;
        const CAPTURE_START: u8 = 2;

        if self.pending_start {
            return Some((self.span.start_byte, LAYER_START, self.depth as isize));
        }

        let tie_break = -(self.depth as isize);
        let opening = self
            .captures
            .peek()
            .map(|(mat, index)| mat.captures[*index].node.start_byte());
        // A closing boundary is due either for the innermost open capture
        // or, once the captures are exhausted, for the layer itself.
        let closing = match self.highlight_end_stack.last() {
            Some(&end) => Some(end),
            None if opening.is_none() && self.end_pending => Some(self.span.end_byte),
            None => None,
        };

        match (opening, closing) {
            (Some(open), Some(close)) if open < close => Some((open, CAPTURE_START, tie_break)),
            (_, Some(close)) => Some((close, END, tie_break)),
            (Some(open), None) => Some((open, CAPTURE_START, tie_break)),
            (None, None) => None,
        }
    }
}

impl<'a, F> HighlightIter<'a, F>
where
    F: FnMut(&str) -> Option<&'a HighlightConfiguration> + 'a,
{
    fn emit_events(
        &mut self,
        offset: usize,
        events: Vec<Event>,
    ) -> Option<Result<Event, Error>> {
        let mut events = events.into_iter();
        let result;
        if self.byte_offset < offset {
            result = Some(Ok(Event::Source {
                start: self.byte_offset,
                end: offset,
            }));
            self.byte_offset = offset;
            self.next_events.extend(events);
        } else {
            result = events.next().map(Ok);
            self.next_events.extend(events);
        }
        self.sort_layers();
        result
    }

    fn open_event(&mut self, layer_id: u32, event: OpenEvent<'a>) -> Event {
        let start = event.start();
        self.open_events.push((layer_id, event));
        start
    }

    /// Close the most recent open event belonging to `layer_id`. Events
    /// from other layers that were opened later and are still open get
    /// closed first and reopened afterwards, so the stream stays properly
    /// nested even when captures from different parse trees overlap.
    fn close_event(&mut self, layer_id: u32) -> Vec<Event> {
        let i = self
            .open_events
            .iter()
            .rposition(|(id, _)| *id == layer_id)
            .expect("every end event has a matching open event");
        let crossed = self.open_events.split_off(i + 1);
        let (_, closed) = self.open_events.pop().unwrap();

        let mut events = Vec::with_capacity(crossed.len() * 2 + 1);
        for (_, event) in crossed.iter().rev() {
            events.push(event.end());
        }
        events.push(closed.end());
        for (id, event) in crossed {
            events.push(event.start());
            self.open_events.push((id, event));
        }
        events
    }

    /// Bring the layer with the earliest pending event to the front,
    /// releasing any front layers that are fully drained.
    fn sort_layers(&mut self) {
        loop {
            if self.layers.is_empty() {
                return;
            }
            let Some(key) = self.layers[0].sort_key() else {
                // Nothing left in this layer; recycle its cursor and look
                // at the next one.
                let drained = self.layers.remove(0);
                self.highlighter.cursors.push(drained.cursor);
                continue;
            };

            // The rest of the vector stays sorted between calls, so the
            // front layer only needs to slide past the neighbours that now
            // come before it.
            let mut slide_to = 0;
            for i in 1..self.layers.len() {
                match self.layers[i].sort_key() {
                    Some(other) if other < key => slide_to = i,
                    _ => break,
                }
            }
            if slide_to > 0 {
                self.layers[..=slide_to].rotate_left(1);
            }
            return;
        }
    }

    /// Slot a freshly spawned layer into the sorted tail, behind the active
    /// front layer. Dead layers encountered on the way are dropped and
    /// their cursors recycled.
    fn insert_layer(&mut self, mut layer: HighlightIterLayer<'a>) {
        let Some(key) = layer.sort_key() else {
            self.highlighter.cursors.push(layer.cursor);
            return;
        };
        let mut i = 1;
        while i < self.layers.len() {
            match self.layers[i].sort_key() {
                None => {
                    let drained = self.layers.remove(i);
                    self.highlighter.cursors.push(drained.cursor);
                }
                Some(existing) if existing > key => break,
                Some(_) => i += 1,
            }
        }
        self.layers.insert(i, layer);
    }
}

impl<'a, F> Iterator for HighlightIter<'a, F>
where
    F: FnMut(&str) -> Option<&'a HighlightConfiguration> + 'a,
{
    type Item = Result<Event, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        'main: loop {
            if self.done {
                return None;
            }

            // Flush anything an earlier step left queued.
            if let Some(event) = self.next_events.pop_front() {
                return Some(Ok(event));
            }

            // Check for cancellation before touching the cursors again.
            if let Some(cancellation_flag) = self.cancellation_flag {
                if cancellation_flag.load(Ordering::Relaxed) != 0 {
                    self.done = true;
                    return Some(Err(Error::Cancelled));
                }
            }

            // No live layers left: cover whatever tail of the buffer is
            // still unreported, then finish.
            if self.layers.is_empty() {
                let len = self.source.len();
                return if self.byte_offset < len {
                    let result = Some(Ok(Event::Source {
                        start: self.byte_offset,
                        end: len,
                    }));
                    self.byte_offset = len;
                    result
                } else {
                    None
                };
            }

            let layer = &mut self.layers[0];

            // A layer opens with a `LayerStart` at the entry of its span,
            // before any of its captures.
            if layer.pending_start {
                layer.pending_start = false;
                layer.end_pending = true;
                let layer_id = layer.id;
                let offset = layer.span.start_byte;
                let language = layer.config.language_name.as_str();
                let range = layer.span;
                let start = self.open_event(layer_id, OpenEvent::Layer { language, range });
                return self.emit_events(offset, vec![start]);
            }

            // `sort_layers` keeps the layer with the earliest boundary at
            // the front, so only its lookahead matters here.
            let range;
            if let Some((next_match, capture_index)) = layer.captures.peek() {
                let next_capture = next_match.captures[*capture_index];
                range = next_capture.node.byte_range();

                // An already-open capture that finishes before this node
                // begins has to close first: report the bytes up to its end
                // and the close itself.
                if let Some(end_byte) = layer.highlight_end_stack.last().copied() {
                    if end_byte <= range.start {
                        layer.highlight_end_stack.pop();
                        let layer_id = layer.id;
                        let events = self.close_event(layer_id);
                        return self.emit_events(end_byte, events);
                    }
                }
            }
            // Out of captures: unwind the remaining open captures, then
            // close the layer itself.
            else if let Some(end_byte) = layer.highlight_end_stack.last().copied() {
                layer.highlight_end_stack.pop();
                let layer_id = layer.id;
                let events = self.close_event(layer_id);
                return self.emit_events(end_byte, events);
            } else if layer.end_pending {
                layer.end_pending = false;
                let layer_id = layer.id;
                let end_byte = layer.span.end_byte;
                let events = self.close_event(layer_id);
                return self.emit_events(end_byte, events);
            } else {
                // Fully drained; sort_layers will release it.
                self.sort_layers();
                continue 'main;
            }

            let (mut match_, capture_index) = layer.captures.next().unwrap();
            let mut capture = match_.captures[capture_index];

            // Injection patterns never highlight anything themselves; their
            // only effect is possibly spawning a child layer.
            if match_.pattern_index < layer.config.locals_pattern_index {
                let (language_name, content_node, include_children) =
                    layer.config.injection_for_match(
                        &layer.config.query,
                        match_.pattern_index,
                        &match_.captures,
                        layer.parent_name,
                        self.source,
                    );
                let depth = layer.depth;
                let last_injection_end = layer.last_injection_end;

                // A resolved name plus a content node makes a candidate
                // child layer. The cursor yields the same match once per
                // capture, so a content node starting before the previous
                // injection's end is the same injection seen again.
                if let (Some(language_name), Some(content_node)) = (language_name, content_node) {
                    if depth < MAX_INJECTION_DEPTH
                        && content_node.start_byte() >= last_injection_end
                    {
                        if let Some(config) = (self.injection_callback)(language_name) {
                            let ranges = intersect_ranges(
                                &self.layers[0].ranges,
                                &[content_node],
                                include_children,
                            );
                            if !ranges.is_empty() {
                                self.layers[0].last_injection_end = content_node.end_byte();
                                let parent_name =
                                    Some(self.layers[0].config.language_name.as_str());
                                match HighlightIterLayer::new(
                                    self.source,
                                    self.highlighter,
                                    self.cancellation_flag,
                                    &mut self.injection_callback,
                                    config,
                                    depth + 1,
                                    parent_name,
                                    ranges,
                                    &mut self.next_layer_id,
                                ) {
                                    Ok(layers) => {
                                        for layer in layers {
                                            self.insert_layer(layer);
                                        }
                                    }
                                    Err(e) => {
                                        self.done = true;
                                        return Some(Err(e));
                                    }
                                }
                            }
                        } else {
                            log::trace!("no configuration for injected language {language_name:?}");
                        }
                    }
                }

                self.sort_layers();
                continue 'main;
            }

            // Scopes the cursor has moved past are done; drop them.
            while range.start > layer.scope_stack.last().unwrap().range.end {
                layer.scope_stack.pop();
            }

            // Anything before the highlights section is locals bookkeeping
            // for this node.
            let mut reference_highlight = None;
            let mut definition_highlight = None;
            while match_.pattern_index < layer.config.highlights_pattern_index {
                // A scope capture opens a fresh entry on the scope stack.
                if Some(capture.index) == layer.config.local_scope_capture_index {
                    definition_highlight = None;
                    let mut scope = LocalScope {
                        inherits: true,
                        range: range.clone(),
                        local_defs: Vec::new(),
                    };
                    for prop in layer.config.query.property_settings(match_.pattern_index) {
                        if prop.key.as_ref() == "local.scope-inherits" {
                            scope.inherits =
                                prop.value.as_ref().map_or(true, |r| r.as_ref() == "true");
                        }
                    }
                    layer.scope_stack.push(scope);
                }
                // A definition capture registers the identifier with the
                // innermost scope.
                else if Some(capture.index) == layer.config.local_def_capture_index {
                    reference_highlight = None;
                    definition_highlight = None;
                    let scope = layer.scope_stack.last_mut().unwrap();

                    let mut value_range = 0..0;
                    for capture in &match_.captures {
                        if Some(capture.index) == layer.config.local_def_value_capture_index {
                            value_range = capture.node.byte_range();
                        }
                    }

                    if let Ok(name) = str::from_utf8(&self.source[range.clone()]) {
                        scope.local_defs.push(LocalDef {
                            name,
                            value_range,
                            highlight: None,
                        });
                        definition_highlight =
                            scope.local_defs.last_mut().map(|def| &mut def.highlight);
                    }
                }
                // A reference capture resolves against the visible
                // definitions, walking outward through inheriting scopes.
                else if Some(capture.index) == layer.config.local_ref_capture_index
                    && definition_highlight.is_none()
                {
                    definition_highlight = None;
                    if let Ok(name) = str::from_utf8(&self.source[range.clone()]) {
                        for scope in layer.scope_stack.iter().rev() {
                            if let Some(highlight) =
                                scope.local_defs.iter().rev().find_map(|def| {
                                    (def.name == name && range.start >= def.value_range.end)
                                        .then_some(def.highlight)
                                })
                            {
                                reference_highlight = highlight;
                                break;
                            }
                            if !scope.inherits {
                                break;
                            }
                        }
                    }
                }

                // The same node may carry further captures; fold them in
                // before leaving the locals section.
                if let Some((next_match, next_capture_index)) = layer.captures.peek() {
                    let next_capture = next_match.captures[*next_capture_index];
                    if next_capture.node == capture.node {
                        capture = next_capture;
                        match_ = layer.captures.next().unwrap().0;
                        continue;
                    }
                }

                self.sort_layers();
                continue 'main;
            }

            // From here on the capture is a highlight. A range that some
            // earlier pattern, or a deeper layer, already claimed is not
            // highlighted twice.
            if let Some((last_start, last_end, last_depth)) = self.last_highlight_range {
                if range.start == last_start && range.end == last_end && layer.depth < last_depth {
                    self.sort_layers();
                    continue 'main;
                }
            }

            // Patterns flagged `#is-not? local` do not apply to a node the
            // locals pass just identified as a local variable; step past
            // them.
            if definition_highlight.is_some() || reference_highlight.is_some() {
                while layer.config.non_local_variable_patterns[match_.pattern_index] {
                    if let Some((next_match, next_capture_index)) = layer.captures.peek() {
                        let next_capture = next_match.captures[*next_capture_index];
                        if next_capture.node == capture.node {
                            capture = next_capture;
                            match_ = layer.captures.next().unwrap().0;
                            continue;
                        }
                    }

                    self.sort_layers();
                    continue 'main;
                }
            }

            // The first applicable pattern wins the node. Whatever other
            // captures still target it come from later patterns (per-node
            // capture order follows pattern order, and the injection and
            // locals sections were handled above), so they are discarded.
            while let Some((next_match, next_capture_index)) = layer.captures.peek() {
                let next_capture = next_match.captures[*next_capture_index];
                if next_capture.node == capture.node {
                    layer.captures.next();
                } else {
                    break;
                }
            }

            let current_highlight = layer.config.highlight_indices.load()[capture.index as usize];

            // When the node doubles as a local definition, remember its
            // highlight so later references to the name can reuse it.
            if let Some(definition_highlight) = definition_highlight {
                *definition_highlight =
                    (current_highlight != Highlight::DEFAULT).then_some(current_highlight);
            }

            // Open the capture, remembering where it has to close. A local
            // reference resolved against a definition takes over the
            // definition's highlight.
            let highlight = reference_highlight.unwrap_or(current_highlight);
            self.last_highlight_range = Some((range.start, range.end, layer.depth));
            layer.highlight_end_stack.push(range.end);
            let layer_id = layer.id;
            let start = self.open_event(layer_id, OpenEvent::Capture(highlight));
            return self.emit_events(range.start, vec![start]);
        }
    }
}

/// The source ranges an injected document is parsed over.
///
/// The contract is deliberately simple: the injection covers the first
/// content node's full range, regardless of how the parent layer's own
/// ranges are carved up and regardless of `includes_children`.
// TODO: intersect with `parent_ranges` and exclude the content node's child
// ranges when `includes_children` is false, so that combined injections
// cover every content node.
fn intersect_ranges(
    _parent_ranges: &[Range],
    nodes: &[Node],
    _includes_children: bool,
) -> Vec<Range> {
    vec![nodes[0].range()]
}

fn span_over(ranges: &[Range]) -> Range {
    let first = ranges
        .first()
        .expect("layers are constructed with at least one range");
    let last = ranges.last().unwrap();
    Range {
        start_byte: first.start_byte,
        start_point: first.start_point,
        end_byte: last.end_byte,
        end_point: last.end_point,
    }
}
