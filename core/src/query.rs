//! Structured query model produced by the parser and executed by the search engine.

use serde::Serialize;
use std::path::{Component, Path};

use crate::index::{Document, Field};

/// Which fields a term is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TermTarget {
    Filename,
    Content,
    Directory,
    /// Free text: a hit in either the filename or the content counts.
    FilenameOrContent,
    All,
}

impl TermTarget {
    pub fn fields(self) -> &'static [Field] {
        match self {
            TermTarget::Filename => &[Field::Filename],
            TermTarget::Content => &[Field::Content],
            TermTarget::Directory => &[Field::Directory],
            TermTarget::FilenameOrContent => &[Field::Filename, Field::Content],
            TermTarget::All => &Field::ALL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    /// `*` and `?` glob over the field's term dictionary.
    Wildcard,
    /// Quoted text; all words at contiguous positions.
    Phrase,
    /// Exact plus dictionary terms within the given edit distance.
    Fuzzy(u8),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TermNode {
    /// The text as the user typed it (used for snippets and highlighting).
    pub text: String,
    pub target: TermTarget,
    pub mode: MatchMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum QueryNode {
    Term(TermNode),
    And(Vec<QueryNode>),
    Or(Vec<QueryNode>),
    Not(Box<QueryNode>),
}

impl QueryNode {
    pub fn term(text: impl Into<String>, target: TermTarget, mode: MatchMode) -> Self {
        QueryNode::Term(TermNode { text: text.into(), target, mode })
    }

    /// Points every free-text leaf at `target`. Leaves that already name a
    /// field keep it.
    pub fn restrict_to(&mut self, target: TermTarget) {
        match self {
            QueryNode::Term(t) if t.target == TermTarget::FilenameOrContent => t.target = target,
            QueryNode::Term(_) => {}
            QueryNode::And(children) | QueryNode::Or(children) => {
                for child in children {
                    child.restrict_to(target);
                }
            }
            QueryNode::Not(inner) => inner.restrict_to(target),
        }
    }

    /// Leaves that contribute positively (not under a NOT).
    pub fn positive_terms(&self) -> Vec<&TermNode> {
        let mut out = Vec::new();
        collect_positive(self, &mut out);
        out
    }
}

fn collect_positive<'a>(node: &'a QueryNode, out: &mut Vec<&'a TermNode>) {
    match node {
        QueryNode::Term(t) => out.push(t),
        QueryNode::And(children) | QueryNode::Or(children) => {
            for child in children {
                collect_positive(child, out);
            }
        }
        QueryNode::Not(_) => {}
    }
}

/// Cheap exact predicates applied before scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Filters {
    /// Lower-cased extensions without the dot; any of them matches.
    pub extensions: Vec<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    /// Inclusive bounds, unix seconds.
    pub modified_after: Option<i64>,
    pub modified_before: Option<i64>,
    pub directory: Option<String>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
            && self.min_size.is_none()
            && self.max_size.is_none()
            && self.modified_after.is_none()
            && self.modified_before.is_none()
            && self.directory.is_none()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if !self.extensions.is_empty() && !self.extensions.iter().any(|e| *e == doc.extension) {
            return false;
        }
        if self.min_size.is_some_and(|min| doc.size < min) {
            return false;
        }
        if self.max_size.is_some_and(|max| doc.size > max) {
            return false;
        }
        if self.modified_after.is_some_and(|t| doc.modified < t) {
            return false;
        }
        if self.modified_before.is_some_and(|t| doc.modified > t) {
            return false;
        }
        match &self.directory {
            Some(dir) => directory_matches(&doc.directory, dir),
            None => true,
        }
    }
}

/// Absolute filters are path prefixes; relative ones match a run of path
/// components anywhere in the directory, case-insensitively.
fn directory_matches(directory: &str, filter: &str) -> bool {
    let filter_path = Path::new(filter);
    if filter_path.is_absolute() {
        return Path::new(directory).starts_with(filter_path);
    }
    let wanted: Vec<String> = filter_path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_lowercase()),
            _ => None,
        })
        .collect();
    if wanted.is_empty() {
        return true;
    }
    let have: Vec<String> = Path::new(directory)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_lowercase()),
            _ => None,
        })
        .collect();
    have.windows(wanted.len()).any(|w| w == wanted.as_slice())
}

/// A token the parser could not interpret and kept as a literal term.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseNote {
    pub token: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Query {
    pub root: Option<QueryNode>,
    pub filters: Filters,
    pub notes: Vec<ParseNote>,
}

impl Query {
    pub fn has_terms(&self) -> bool {
        self.root.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(directory: &str, extension: &str, size: u64, modified: i64) -> Document {
        Document {
            path: format!("{directory}/f.{extension}"),
            filename: format!("f.{extension}"),
            directory: directory.to_string(),
            size,
            modified,
            extension: extension.to_string(),
            fingerprint: 0,
            text: None,
            terms: Vec::new(),
        }
    }

    #[test]
    fn restricting_keeps_explicit_targets() {
        let mut node = QueryNode::And(vec![
            QueryNode::term("budget", TermTarget::FilenameOrContent, MatchMode::Exact),
            QueryNode::Not(Box::new(QueryNode::term("old", TermTarget::FilenameOrContent, MatchMode::Exact))),
            QueryNode::term("finance", TermTarget::Directory, MatchMode::Exact),
        ]);
        node.restrict_to(TermTarget::Filename);
        let targets: Vec<TermTarget> = match &node {
            QueryNode::And(children) => children
                .iter()
                .map(|c| match c {
                    QueryNode::Term(t) => t.target,
                    QueryNode::Not(inner) => match inner.as_ref() {
                        QueryNode::Term(t) => t.target,
                        other => panic!("unexpected {other:?}"),
                    },
                    other => panic!("unexpected {other:?}"),
                })
                .collect(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(targets, vec![TermTarget::Filename, TermTarget::Filename, TermTarget::Directory]);
    }

    #[test]
    fn extension_and_size_filters() {
        let filters = Filters {
            extensions: vec!["pdf".into()],
            min_size: Some(10),
            ..Default::default()
        };
        assert!(filters.matches(&doc("/a", "pdf", 10, 0)));
        assert!(!filters.matches(&doc("/a", "txt", 10, 0)));
        assert!(!filters.matches(&doc("/a", "pdf", 9, 0)));
    }

    #[test]
    fn directory_filters() {
        let abs = Filters { directory: Some("/home/user".into()), ..Default::default() };
        assert!(abs.matches(&doc("/home/user/docs", "txt", 0, 0)));
        assert!(!abs.matches(&doc("/home/username", "txt", 0, 0)));

        let rel = Filters { directory: Some("Projects/seekr".into()), ..Default::default() };
        assert!(rel.matches(&doc("/home/u/projects/seekr/src", "rs", 0, 0)));
        assert!(!rel.matches(&doc("/home/u/projects/other", "rs", 0, 0)));
    }

    #[test]
    fn time_range_is_inclusive() {
        let filters = Filters {
            modified_after: Some(100),
            modified_before: Some(200),
            ..Default::default()
        };
        assert!(filters.matches(&doc("/a", "txt", 0, 100)));
        assert!(filters.matches(&doc("/a", "txt", 0, 200)));
        assert!(!filters.matches(&doc("/a", "txt", 0, 201)));
    }
}
