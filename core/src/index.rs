use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub type DocId = u32;

/// Position assigned to the whole lower-cased file name term in the filename field.
/// Kept far away from word positions so it never takes part in a phrase.
pub const NAME_POSITION: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Filename,
    Directory,
    Content,
}

impl Field {
    pub const ALL: [Field; 3] = [Field::Filename, Field::Directory, Field::Content];

    pub fn as_str(self) -> &'static str {
        match self {
            Field::Filename => "filename",
            Field::Directory => "directory",
            Field::Content => "content",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub path: String,
    pub filename: String,
    pub directory: String,
    pub size: u64,
    /// Unix seconds.
    pub modified: i64,
    /// Lower-cased, without the leading dot; empty when the file has none.
    pub extension: String,
    pub fingerprint: u64,
    /// Extracted text, only for small text files.
    pub text: Option<String>,
    /// Every (field, term) this document added to the postings.
    pub terms: Vec<(Field, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: DocId,
    pub positions: Vec<u32>, // ascending
}

impl Posting {
    pub fn tf(&self) -> u32 {
        self.positions.len() as u32
    }
}

/// Term postings for one field; each postings list is sorted by doc_id.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FieldIndex {
    pub terms: HashMap<String, Arc<Vec<Posting>>>,
}

impl FieldIndex {
    pub fn postings(&self, term: &str) -> Option<&[Posting]> {
        self.terms.get(term).map(|p| p.as_slice())
    }

    pub fn df(&self, term: &str) -> usize {
        self.terms.get(term).map_or(0, |p| p.len())
    }

    fn insert(&mut self, term: &str, posting: Posting) {
        let list = Arc::make_mut(self.terms.entry(term.to_string()).or_default());
        match list.binary_search_by_key(&posting.doc_id, |p| p.doc_id) {
            Ok(i) => list[i] = posting,
            Err(i) => list.insert(i, posting),
        }
    }

    fn remove(&mut self, term: &str, doc_id: DocId) {
        let Some(entry) = self.terms.get_mut(term) else { return };
        if let Ok(i) = entry.binary_search_by_key(&doc_id, |p| p.doc_id) {
            Arc::make_mut(entry).remove(i);
        }
        if entry.is_empty() {
            self.terms.remove(term);
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct InvertedIndex {
    pub filename: FieldIndex,
    pub directory: FieldIndex,
    pub content: FieldIndex,
}

impl InvertedIndex {
    pub fn new() -> Self { Self::default() }

    pub fn field(&self, field: Field) -> &FieldIndex {
        match field {
            Field::Filename => &self.filename,
            Field::Directory => &self.directory,
            Field::Content => &self.content,
        }
    }

    fn field_mut(&mut self, field: Field) -> &mut FieldIndex {
        match field {
            Field::Filename => &mut self.filename,
            Field::Directory => &mut self.directory,
            Field::Content => &mut self.content,
        }
    }
}

/// Postings produced for one term of one field of a staged document.
#[derive(Debug, Clone, PartialEq)]
pub struct TermPositions {
    pub field: Field,
    pub term: String,
    pub positions: Vec<u32>,
}

/// A fully analysed document ready to be written by a commit.
#[derive(Debug, Clone)]
pub struct Upsert {
    pub document: Document,
    pub postings: Vec<TermPositions>,
}

/// Everything one indexing pass wants to change, applied as a unit.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    pub upserts: Vec<Upsert>,
    pub deletes: Vec<String>,
    /// Roots to remember for later full rescans.
    pub roots: Vec<String>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty() && self.roots.is_empty()
    }
}

/// One immutable, fully committed version of the index.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub id: u64,
    /// Unix seconds of the commit that produced this generation.
    pub committed_at: i64,
    pub next_doc_id: DocId,
    pub docs: HashMap<DocId, Arc<Document>>,
    pub paths: HashMap<String, DocId>,
    pub index: InvertedIndex,
    pub roots: Vec<String>,
}

impl Generation {
    pub fn num_docs(&self) -> usize {
        self.docs.len()
    }

    pub fn document(&self, path: &str) -> Option<&Arc<Document>> {
        self.paths.get(path).and_then(|id| self.docs.get(id))
    }

    pub fn fingerprint(&self, path: &str) -> Option<u64> {
        self.document(path).map(|d| d.fingerprint)
    }

    /// Copy-on-write: postings lists untouched by `changes` stay shared with `self`.
    pub fn apply(&self, changes: &Changeset, id: u64, committed_at: i64) -> Generation {
        let mut next = self.clone();
        next.id = id;
        next.committed_at = committed_at;

        for path in &changes.deletes {
            next.remove_path(path);
        }
        for upsert in &changes.upserts {
            let doc_id = match next.paths.get(&upsert.document.path) {
                Some(&existing) => {
                    next.remove_postings(existing);
                    existing
                }
                None => {
                    let id = next.next_doc_id;
                    next.next_doc_id += 1;
                    id
                }
            };
            let mut document = upsert.document.clone();
            document.terms = upsert
                .postings
                .iter()
                .map(|tp| (tp.field, tp.term.clone()))
                .collect();
            for tp in &upsert.postings {
                next.index.field_mut(tp.field).insert(
                    &tp.term,
                    Posting { doc_id, positions: tp.positions.clone() },
                );
            }
            next.paths.insert(document.path.clone(), doc_id);
            next.docs.insert(doc_id, Arc::new(document));
        }
        for root in &changes.roots {
            if !next.roots.contains(root) {
                next.roots.push(root.clone());
            }
        }
        next
    }

    fn remove_path(&mut self, path: &str) {
        if let Some(doc_id) = self.paths.remove(path) {
            self.remove_postings(doc_id);
            self.docs.remove(&doc_id);
        }
    }

    fn remove_postings(&mut self, doc_id: DocId) {
        let Some(doc) = self.docs.get(&doc_id).cloned() else { return };
        let unique: HashSet<&(Field, String)> = doc.terms.iter().collect();
        for (field, term) in unique {
            self.index.field_mut(*field).remove(term, doc_id);
        }
    }

    /// Every posting points at a live document and every document's terms have
    /// postings for it.
    pub fn is_consistent(&self) -> bool {
        for field in Field::ALL {
            for list in self.index.field(field).terms.values() {
                if list.iter().any(|p| !self.docs.contains_key(&p.doc_id)) {
                    return false;
                }
            }
        }
        self.docs.iter().all(|(id, doc)| {
            self.paths.get(&doc.path) == Some(id)
                && doc.terms.iter().all(|(field, term)| {
                    self.index
                        .field(*field)
                        .postings(term)
                        .is_some_and(|list| list.binary_search_by_key(id, |p| p.doc_id).is_ok())
                })
        }) && self.paths.len() == self.docs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(path: &str, terms: &[(Field, &str)]) -> Upsert {
        Upsert {
            document: Document {
                path: path.to_string(),
                filename: path.rsplit('/').next().unwrap_or(path).to_string(),
                directory: "/d".to_string(),
                size: 1,
                modified: 0,
                extension: String::new(),
                fingerprint: 7,
                text: None,
                terms: Vec::new(),
            },
            postings: terms
                .iter()
                .enumerate()
                .map(|(i, (field, term))| TermPositions {
                    field: *field,
                    term: term.to_string(),
                    positions: vec![i as u32],
                })
                .collect(),
        }
    }

    #[test]
    fn apply_upsert_and_delete() {
        let base = Generation::default();
        let changes = Changeset {
            upserts: vec![
                upsert("/d/a", &[(Field::Filename, "alpha"), (Field::Content, "shared")]),
                upsert("/d/b", &[(Field::Filename, "beta"), (Field::Content, "shared")]),
            ],
            ..Default::default()
        };
        let g1 = base.apply(&changes, 1, 0);
        assert_eq!(g1.num_docs(), 2);
        assert_eq!(g1.index.content.df("shared"), 2);
        assert!(g1.is_consistent());

        let g2 = g1.apply(
            &Changeset { deletes: vec!["/d/a".into()], ..Default::default() },
            2,
            0,
        );
        assert_eq!(g2.num_docs(), 1);
        assert_eq!(g2.index.content.df("shared"), 1);
        assert!(g2.index.filename.postings("alpha").is_none());
        assert!(g2.is_consistent());
        // the older generation is untouched
        assert_eq!(g1.index.content.df("shared"), 2);
    }

    #[test]
    fn reupsert_replaces_postings() {
        let g1 = Generation::default().apply(
            &Changeset { upserts: vec![upsert("/d/a", &[(Field::Content, "old")])], ..Default::default() },
            1,
            0,
        );
        let g2 = g1.apply(
            &Changeset { upserts: vec![upsert("/d/a", &[(Field::Content, "new")])], ..Default::default() },
            2,
            0,
        );
        assert_eq!(g2.num_docs(), 1);
        assert!(g2.index.content.postings("old").is_none());
        assert_eq!(g2.index.content.df("new"), 1);
        assert_eq!(g2.paths["/d/a"], g1.paths["/d/a"]);
    }
}
