use arbolight::{Fold, FoldConfiguration, Folder};
use tree_sitter::Language;

fn go_config(folds_query: &str) -> FoldConfiguration {
    let language = Language::new(tree_sitter_go::LANGUAGE);
    FoldConfiguration::new(language, folds_query).unwrap()
}

fn collect(folder: &mut Folder, config: &FoldConfiguration, source: &[u8]) -> Vec<Fold> {
    folder
        .folds(config, source, None)
        .unwrap()
        .map(|fold| fold.unwrap())
        .collect()
}

#[test]
fn a_braced_block_folds_over_its_lines() {
    let config = go_config("(function_declaration body: (block) @fold)");
    let source = b"func f() int {\n\treturn 1\n}\n";
    let mut folder = Folder::new();
    let folds = collect(&mut folder, &config, source);

    assert_eq!(folds.len(), 1);
    let fold = &folds[0];
    // The fold covers the braces; a fold starting on row 0 is emitted.
    assert_eq!(&source[fold.range.start_byte..fold.range.end_byte], b"{\n\treturn 1\n}");
    assert_eq!(fold.range.start_point.row, 0);
    assert_eq!(fold.range.end_point.row, 2);
    // The line range spans all three lines from column 0.
    assert_eq!(fold.line_range.start_byte, 0);
    assert_eq!(
        &source[fold.line_range.start_byte..fold.line_range.end_byte],
        b"func f() int {\n\treturn 1\n}"
    );
}

#[test]
fn single_line_captures_produce_no_folds() {
    let config = go_config("(block) @fold");
    let source = b"func f() { g() }\n";
    let mut folder = Folder::new();
    assert!(collect(&mut folder, &config, source).is_empty());
}

#[test]
fn folds_starting_on_the_same_line_are_deduplicated() {
    let config = go_config("(function_declaration) @fold (block) @fold");
    let source = b"func f() int {\n\treturn 1\n}\n";
    let mut folder = Folder::new();
    let folds = collect(&mut folder, &config, source);

    // Both captures start on row 0; the first one wins.
    assert_eq!(folds.len(), 1);
    assert_eq!(folds[0].range.start_byte, 0);
}

#[test]
fn single_line_captures_do_not_suppress_later_folds_on_the_row() {
    let config = go_config("[(block) (literal_value)] @fold");
    let source = b"func f() {\n\ta := []int{}; if a != nil {\n\t\tg(a)\n\t}\n}\n";
    let mut folder = Folder::new();
    let folds = collect(&mut folder, &config, source);

    // The function body folds from row 0; the empty literal on row 1 is
    // single-line and must not swallow the `if` block starting on row 1.
    assert_eq!(folds.len(), 2);
    assert_eq!(folds[0].range.start_point.row, 0);
    assert_eq!(folds[1].range.start_point.row, 1);
    assert_eq!(folds[1].range.end_point.row, 3);
}

#[test]
fn no_two_folds_share_a_start_row() {
    let config = go_config("[(function_declaration) (block) (literal_value)] @fold");
    let source =
        b"func a() {\n\tx()\n}\n\nfunc b() {\n\ty := []int{\n\t\t1,\n\t}\n\t_ = y\n}\n";
    let mut folder = Folder::new();
    let folds = collect(&mut folder, &config, source);

    assert!(!folds.is_empty());
    let mut rows: Vec<_> = folds.iter().map(|fold| fold.range.start_point.row).collect();
    let original = rows.clone();
    rows.sort_unstable();
    rows.dedup();
    assert_eq!(rows.len(), original.len(), "duplicate start rows in {original:?}");
    // Every fold spans multiple lines.
    for fold in &folds {
        assert!(fold.range.start_point.row < fold.range.end_point.row);
    }
}

#[test]
fn queries_without_a_fold_capture_yield_nothing() {
    let config = go_config("(block) @body");
    let source = b"func f() int {\n\treturn 1\n}\n";
    let mut folder = Folder::new();
    assert!(collect(&mut folder, &config, source).is_empty());
}
