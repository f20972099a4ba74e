use crate::tags::Tag;
use crate::Error;

/// Reference kinds that may resolve against definitions of another kind.
const SIMILAR_SYNTAX_TYPE_NAMES: &[(&str, &[&str])] = &[
    ("call", &["function", "method", "variable"]),
    ("type", &["class", "interface", "struct"]),
];

/// A tag linked to its counterpart: definitions collect their references,
/// references point at their definition. Links are indices into the vector
/// returned by [`resolve_refs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTag {
    pub tag: Tag,
    /// Indices of the references to this tag, populated on definitions.
    pub refs: Vec<usize>,
    /// Index of the definition this tag refers to, populated on references.
    pub def: Option<usize>,
    /// A stable identifier, unique per definition: `{syntax_type}-{name}`,
    /// disambiguated with a `~N` suffix. References share their
    /// definition's id.
    pub id: String,
}

/// Resolve references to definitions by name.
///
/// A reference links to the first definition with an equal name whose kind
/// is acceptable: the reference's syntax type is 0, the kinds are equal, or
/// the definition's kind is listed under the reference's kind in the
/// similar-kinds table (`call` resolves to functions, methods and
/// variables; `type` to classes, interfaces and structs).
///
/// Ignored sentinel tags are dropped.
pub fn resolve_refs(
    tags: impl IntoIterator<Item = Result<Tag, Error>>,
    source: &[u8],
    syntax_type_names: &[String],
) -> Result<Vec<ResolvedTag>, Error> {
    let mut resolved: Vec<ResolvedTag> = Vec::new();
    let mut definition_ids: Vec<String> = Vec::new();

    for tag in tags {
        let tag = tag?;
        if tag.is_ignored() {
            continue;
        }

        let mut id = tag_id(&tag, source, syntax_type_names);
        if tag.is_definition {
            let mut n = 0;
            let mut def_id = id.clone();
            while definition_ids.iter().any(|existing| *existing == def_id) {
                n += 1;
                def_id = format!("{id}~{n}");
            }
            definition_ids.push(def_id.clone());
            id = def_id;
        }

        resolved.push(ResolvedTag {
            tag,
            refs: Vec::new(),
            def: None,
            id,
        });
    }

    for i in 0..resolved.len() {
        if resolved[i].tag.is_definition {
            continue;
        }

        let Some(def_index) = find_def_for_ref(&resolved[i].tag, &resolved, source, syntax_type_names)
        else {
            continue;
        };
        resolved[def_index].refs.push(i);
        resolved[i].id = resolved[def_index].id.clone();
        resolved[i].def = Some(def_index);
    }

    Ok(resolved)
}

fn tag_id(tag: &Tag, source: &[u8], syntax_type_names: &[String]) -> String {
    format!(
        "{}-{}",
        syntax_type_names[tag.syntax_type_id as usize],
        tag.full_name(source)
    )
}

fn find_def_for_ref(
    reference: &Tag,
    all_tags: &[ResolvedTag],
    source: &[u8],
    syntax_type_names: &[String],
) -> Option<usize> {
    let similar_names = SIMILAR_SYNTAX_TYPE_NAMES
        .iter()
        .find(|(name, _)| *name == syntax_type_names[reference.syntax_type_id as usize])
        .map(|(_, names)| *names);

    for (i, tag) in all_tags.iter().enumerate() {
        if !tag.tag.is_definition {
            continue;
        }
        if tag.tag.name(source) != reference.name(source) {
            continue;
        }

        if reference.syntax_type_id == 0 || tag.tag.syntax_type_id == reference.syntax_type_id {
            return Some(i);
        }
        if let Some(names) = similar_names {
            if names.contains(&&*syntax_type_names[tag.tag.syntax_type_id as usize]) {
                return Some(i);
            }
        }
    }

    None
}
