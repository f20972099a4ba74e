use std::sync::atomic::{AtomicUsize, Ordering};

use arbolight::{Error, Event, Highlight, HighlightConfiguration, Highlighter};
use tree_sitter::Language;

const RUST_HIGHLIGHTS: &str = r#"
"fn" @keyword
(function_item name: (identifier) @function)
(string_literal) @string
(integer_literal) @number
(line_comment) @comment
"#;

const JSON_HIGHLIGHTS: &str = r#"
(number) @number
(string) @string
"#;

const RUST_INJECTIONS: &str = r#"
(macro_invocation
  macro: (identifier) @injection.language
  (token_tree (string_literal (string_content) @injection.content)))
((string_literal (string_content) @injection.content) (#set! injection.language "json"))
"#;

fn recognized_names() -> Vec<String> {
    ["keyword", "function", "string", "number", "comment"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn rust_config(injections: &str) -> HighlightConfiguration {
    let language = Language::new(tree_sitter_rust::LANGUAGE);
    let config =
        HighlightConfiguration::new(language, "rust", RUST_HIGHLIGHTS, injections, "").unwrap();
    config.configure(&recognized_names());
    config
}

fn json_config() -> HighlightConfiguration {
    let language = Language::new(tree_sitter_json::LANGUAGE);
    let config = HighlightConfiguration::new(language, "json", JSON_HIGHLIGHTS, "", "").unwrap();
    config.configure(&recognized_names());
    config
}

fn collect(iter: impl Iterator<Item = Result<Event, Error>>) -> Vec<Event> {
    iter.map(|event| event.unwrap()).collect()
}

/// Source spans tile the buffer; capture and layer events are balanced and
/// properly nested.
fn check_invariants(source: &[u8], events: &[Event]) {
    let mut pos = 0;
    for event in events {
        if let Event::Source { start, end } = event {
            assert_eq!(*start, pos, "source spans must be contiguous");
            assert!(*end > *start, "source spans must be non-empty");
            pos = *end;
        }
    }
    assert_eq!(pos, source.len(), "source spans must cover the whole buffer");

    #[derive(Debug, PartialEq)]
    enum Open {
        Capture,
        Layer,
    }
    let mut stack = Vec::new();
    for event in events {
        match event {
            Event::CaptureStart { .. } => stack.push(Open::Capture),
            Event::LayerStart { .. } => stack.push(Open::Layer),
            Event::CaptureEnd => assert_eq!(stack.pop(), Some(Open::Capture)),
            Event::LayerEnd => assert_eq!(stack.pop(), Some(Open::Layer)),
            Event::Source { .. } => {
                assert!(!stack.is_empty(), "source bytes outside the root layer")
            }
        }
    }
    assert!(stack.is_empty(), "unbalanced events: {events:?}");
}

fn capture_starts(events: &[Event]) -> Vec<Highlight> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::CaptureStart { highlight } => Some(*highlight),
            _ => None,
        })
        .collect()
}

fn layer_starts(events: &[Event]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::LayerStart { language, .. } => Some(language.as_str()),
            _ => None,
        })
        .collect()
}

#[test]
fn the_root_layer_brackets_the_whole_stream() {
    let config = rust_config("");
    let source = b"fn main() {}";
    let mut highlighter = Highlighter::new();
    let events = collect(
        highlighter
            .highlight(&config, source, None, |_| None)
            .unwrap(),
    );

    check_invariants(source, &events);
    match events.first() {
        Some(Event::LayerStart { language, range }) => {
            assert_eq!(*language, "rust");
            assert_eq!(range.start_byte, 0);
            assert_eq!(range.end_byte, source.len());
        }
        other => panic!("expected a root LayerStart, got {other:?}"),
    }
    assert_eq!(events.last(), Some(&Event::LayerEnd));
}

#[test]
fn empty_sources_produce_an_empty_layer() {
    let config = rust_config("");
    let mut highlighter = Highlighter::new();
    let events = collect(highlighter.highlight(&config, b"", None, |_| None).unwrap());
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], Event::LayerStart { language, .. } if language == "rust"));
    assert_eq!(events[1], Event::LayerEnd);
}

#[test]
fn injections_create_nested_layers() {
    let rust = rust_config(RUST_INJECTIONS);
    let json = json_config();
    let source = br#"fn main() { let j = "[1, 2]"; }"#;
    let mut highlighter = Highlighter::new();
    let events = collect(
        highlighter
            .highlight(&rust, source, None, |name| match name {
                "json" => Some(&json),
                _ => None,
            })
            .unwrap(),
    );

    check_invariants(source, &events);

    // The json layer covers the string contents.
    let (i, range) = events
        .iter()
        .enumerate()
        .find_map(|(i, event)| match event {
            Event::LayerStart { language, range } if language == "json" => Some((i, *range)),
            _ => None,
        })
        .expect("a json layer should have been created");
    assert_eq!(&source[range.start_byte..range.end_byte], b"[1, 2]");

    // The string capture from the host layer opens before the nested layer.
    let string_highlight = Highlight(2);
    assert!(events[..i]
        .iter()
        .any(|event| *event == Event::CaptureStart { highlight: string_highlight }));

    // The json layer highlights its numbers before closing.
    let number_highlight = Highlight(3);
    let layer_end = events[i..]
        .iter()
        .position(|event| *event == Event::LayerEnd)
        .unwrap()
        + i;
    let nested_numbers = events[i..layer_end]
        .iter()
        .filter(|event| **event == Event::CaptureStart { highlight: number_highlight })
        .count();
    assert_eq!(nested_numbers, 2);
}

#[test]
fn injection_language_comes_from_the_capture_text() {
    let rust = rust_config(RUST_INJECTIONS);
    let json = json_config();
    let source = br#"fn main() { json!("[1]"); }"#;
    let mut highlighter = Highlighter::new();
    let mut callback_names = Vec::new();
    let events = collect(
        highlighter
            .highlight(&rust, source, None, |name| {
                callback_names.push(name.to_string());
                match name {
                    "json" => Some(&json),
                    _ => None,
                }
            })
            .unwrap(),
    );

    check_invariants(source, &events);
    assert_eq!(layer_starts(&events), vec!["rust", "json"]);
    // The callback is invoked once per spawned injection, with the name
    // taken from the `@injection.language` capture's text.
    assert_eq!(callback_names, vec!["json"]);
}

#[test]
fn skipped_injections_leave_the_host_layer_in_charge() {
    let rust = rust_config(RUST_INJECTIONS);
    let source = br#"fn main() { let j = "[1, 2]"; }"#;
    let mut highlighter = Highlighter::new();
    // The callback knows no languages at all.
    let events = collect(
        highlighter
            .highlight(&rust, source, None, |_| None)
            .unwrap(),
    );
    check_invariants(source, &events);
    assert_eq!(layer_starts(&events), vec!["rust"]);
}

#[test]
fn injection_self_reuses_the_layer_configuration() {
    let language = Language::new(tree_sitter_rust::LANGUAGE);
    let injections = r#"
((macro_invocation (token_tree (string_literal (string_content) @injection.content)))
 (#set! injection.self))
"#;
    let config =
        HighlightConfiguration::new(language, "rust", RUST_HIGHLIGHTS, injections, "").unwrap();
    config.configure(&recognized_names());

    let source = br#"fn main() { m!("fn g() {}"); }"#;
    let mut highlighter = Highlighter::new();
    let events = collect(
        highlighter
            .highlight(&config, source, None, |name| {
                (name == "rust").then_some(&config)
            })
            .unwrap(),
    );

    check_invariants(source, &events);
    assert_eq!(layer_starts(&events), vec!["rust", "rust"]);
    // The nested layer highlights the inner function name.
    let function_highlight = Highlight(1);
    assert!(capture_starts(&events).contains(&function_highlight));
}

#[test]
fn combined_injections_merge_into_one_layer() {
    let language = Language::new(tree_sitter_rust::LANGUAGE);
    let injections = r#"
((string_literal (string_content) @injection.content)
 (#set! injection.language "json")
 (#set! injection.combined))
"#;
    let config =
        HighlightConfiguration::new(language, "rust", RUST_HIGHLIGHTS, injections, "").unwrap();
    config.configure(&recognized_names());
    let json = json_config();

    let source = br#"fn main() { let a = "[1,"; let b = " 2]"; }"#;
    let mut highlighter = Highlighter::new();
    let events = collect(
        highlighter
            .highlight(&config, source, None, |name| match name {
                "json" => Some(&json),
                _ => None,
            })
            .unwrap(),
    );

    check_invariants(source, &events);
    // One virtual document for all matches of the combined pattern. The
    // parsed span covers the first content node.
    let json_layers: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::LayerStart { language, range } if language == "json" => Some(*range),
            _ => None,
        })
        .collect();
    assert_eq!(json_layers.len(), 1);
    assert_eq!(&source[json_layers[0].start_byte..json_layers[0].end_byte], b"[1,");
}

#[test]
fn same_node_captures_collapse_to_one_event() {
    let language = Language::new(tree_sitter_rust::LANGUAGE);
    let highlights = r#"
(integer_literal) @constant.builtin
(integer_literal) @constant
"#;
    let config = HighlightConfiguration::new(language, "rust", highlights, "", "").unwrap();
    let source = b"fn f() -> u8 { 42 }";
    let mut highlighter = Highlighter::new();

    // With only `constant` recognized, both capture names collapse to it.
    config.configure(&["constant".to_string()]);
    let events = collect(
        highlighter
            .highlight(&config, source, None, |_| None)
            .unwrap(),
    );
    check_invariants(source, &events);
    assert_eq!(capture_starts(&events), vec![Highlight(0)]);

    // With the specific name recognized too, the more specific capture wins.
    config.configure(&["constant.builtin".to_string(), "constant".to_string()]);
    let events = collect(
        highlighter
            .highlight(&config, source, None, |_| None)
            .unwrap(),
    );
    assert_eq!(capture_starts(&events), vec![Highlight(0)]);
}

#[test]
fn unrecognized_captures_carry_the_default_highlight() {
    let language = Language::new(tree_sitter_rust::LANGUAGE);
    let config =
        HighlightConfiguration::new(language, "rust", "(integer_literal) @number", "", "")
            .unwrap();
    // No names are recognized.
    config.configure(&[]);

    let source = b"fn f() -> u8 { 42 }";
    let mut highlighter = Highlighter::new();
    let events = collect(
        highlighter
            .highlight(&config, source, None, |_| None)
            .unwrap(),
    );
    check_invariants(source, &events);
    assert_eq!(capture_starts(&events), vec![Highlight::DEFAULT]);
}

#[test]
fn local_references_take_their_definitions_highlight() {
    let language = Language::new(tree_sitter_go::LANGUAGE);
    let highlights = r#"
(parameter_declaration name: (identifier) @variable.parameter)
(identifier) @variable
"#;
    let locals = r#"
(function_declaration) @local.scope
(parameter_declaration name: (identifier) @local.definition)
(identifier) @local.reference
"#;
    let config = HighlightConfiguration::new(language, "go", highlights, "", locals).unwrap();
    config.configure(&["variable.parameter".to_string(), "variable".to_string()]);

    let source = b"package main\n\nfunc f(a int) {\n\tg(a)\n}\n";
    let mut highlighter = Highlighter::new();
    let events = collect(
        highlighter
            .highlight(&config, source, None, |_| None)
            .unwrap(),
    );

    check_invariants(source, &events);
    // f, the parameter a, g, and the reference to a. The reference takes
    // over the parameter highlight recorded on its definition.
    assert_eq!(
        capture_starts(&events),
        vec![Highlight(1), Highlight(0), Highlight(1), Highlight(0)]
    );
}

#[test]
fn iteration_is_idempotent() {
    let rust = rust_config(RUST_INJECTIONS);
    let json = json_config();
    let source = br#"
fn greet() -> u8 {
    // answer
    let j = "[40, 2]";
    42
}
"#;
    let mut highlighter = Highlighter::new();
    let mut runs = Vec::new();
    for _ in 0..2 {
        let events = collect(
            highlighter
                .highlight(&rust, source, None, |name| match name {
                    "json" => Some(&json),
                    _ => None,
                })
                .unwrap(),
        );
        check_invariants(source, &events);
        runs.push(events);
    }
    assert_eq!(runs[0], runs[1]);
}

#[test]
fn cancellation_ends_the_stream_with_an_error() {
    let config = rust_config("");
    let source = br#"
fn a() -> u8 { 1 }
fn b() -> u8 { 2 }
fn c() -> u8 { 3 }
"#;
    let flag = AtomicUsize::new(0);
    let mut highlighter = Highlighter::new();
    let mut iter = highlighter
        .highlight(&config, source, Some(&flag), |_| None)
        .unwrap();

    assert!(iter.next().unwrap().is_ok());
    flag.store(1, Ordering::Relaxed);

    let rest: Vec<_> = iter.by_ref().collect();
    let errors = rest.iter().filter(|event| event.is_err()).count();
    assert_eq!(errors, 1, "exactly one cancellation error: {rest:?}");
    assert!(matches!(rest.last(), Some(Err(Error::Cancelled))));
    assert!(iter.next().is_none());
}
