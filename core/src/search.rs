//! Ranked retrieval over one generation.
//!
//! Filters narrow the candidate set before any scoring happens. Each leaf
//! contributes `boost × (1 + ln tf) × ln(1 + N/df) × mode weight` per field it
//! matched in; boolean nodes combine leaf results as set operations.

use globset::GlobBuilder;
use rapidfuzz::distance::levenshtein;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{Config, FieldBoosts};
use crate::index::{DocId, Document, Field, FieldIndex, Generation, Posting, NAME_POSITION};
use crate::query::{Filters, MatchMode, Query, QueryNode, TermNode, TermTarget};
use crate::tokenizer;

const WILDCARD_WEIGHT: f32 = 0.6;
const FUZZY_WEIGHT: f32 = 0.5;
/// Dictionary scans check the deadline this often.
const DEADLINE_STRIDE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOptions {
    pub boosts: FieldBoosts,
    pub snippet_size: usize,
    pub timeout: Option<Duration>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            boosts: FieldBoosts::default(),
            snippet_size: 200,
            timeout: None,
        }
    }
}

impl From<&Config> for SearchOptions {
    fn from(config: &Config) -> Self {
        Self {
            boosts: config.field_boosts,
            snippet_size: config.snippet_size,
            timeout: (config.search_timeout_ms > 0).then(|| Duration::from_millis(config.search_timeout_ms)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snippet {
    pub text: String,
    /// Byte ranges of matched words within `text`.
    pub highlights: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub doc_id: DocId,
    pub path: String,
    pub filename: String,
    pub directory: String,
    pub size: u64,
    pub modified: i64,
    pub extension: String,
    pub score: f32,
    pub matched_fields: Vec<Field>,
    pub snippet: Option<Snippet>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    /// Matches before truncation to `max_results`.
    pub total_hits: usize,
    /// Set when the deadline expired and the results are partial.
    pub truncated: bool,
    pub took_ms: u64,
    pub generation: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchEngine {
    options: SearchOptions,
}

impl SearchEngine {
    pub fn new(options: SearchOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SearchOptions {
        &self.options
    }

    /// Runs `query` without a deadline.
    pub fn search(&self, generation: &Generation, query: &Query, max_results: usize) -> Vec<SearchResult> {
        self.search_until(generation, query, max_results, None).results
    }

    /// Runs `query` with the configured timeout.
    pub fn execute(&self, generation: &Generation, query: &Query, max_results: usize) -> SearchResponse {
        let deadline = self.options.timeout.map(|t| Instant::now() + t);
        self.search_until(generation, query, max_results, deadline)
    }

    /// Runs `query`, returning whatever has been ranked when `deadline` passes.
    pub fn search_until(
        &self,
        generation: &Generation,
        query: &Query,
        max_results: usize,
        deadline: Option<Instant>,
    ) -> SearchResponse {
        let started = Instant::now();
        let mut eval = Evaluator {
            generation,
            filters: &query.filters,
            boosts: self.options.boosts,
            total_docs: generation.num_docs() as f32,
            deadline,
            expired: false,
            strict: 0,
        };

        let matches = match &query.root {
            Some(root) => eval.eval(root),
            None if !query.filters.is_empty() => eval.universe(),
            None => Matches::new(),
        };
        let truncated = eval.expired;

        let mut ranked: Vec<(DocId, Hit, &Arc<Document>)> = matches
            .into_iter()
            .filter_map(|(id, hit)| generation.docs.get(&id).map(|doc| (id, hit, doc)))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.score
                .total_cmp(&a.1.score)
                .then_with(|| b.2.modified.cmp(&a.2.modified))
                .then_with(|| a.2.path.cmp(&b.2.path))
        });
        let total_hits = ranked.len();
        ranked.truncate(max_results);

        let patterns = HighlightPatterns::new(query);
        let results = ranked
            .into_iter()
            .map(|(doc_id, hit, doc)| SearchResult {
                doc_id,
                path: doc.path.clone(),
                filename: doc.filename.clone(),
                directory: doc.directory.clone(),
                size: doc.size,
                modified: doc.modified,
                extension: doc.extension.clone(),
                score: hit.score,
                matched_fields: Field::ALL.into_iter().filter(|f| hit.fields & field_bit(*f) != 0).collect(),
                snippet: doc
                    .text
                    .as_deref()
                    .map(|text| patterns.snippet(text, self.options.snippet_size)),
            })
            .collect();

        let took_ms = started.elapsed().as_millis() as u64;
        if truncated {
            tracing::warn!(took_ms, total_hits, "search deadline expired, returning partial results");
        } else {
            tracing::debug!(took_ms, total_hits, generation = generation.id, "search finished");
        }
        SearchResponse { results, total_hits, truncated, took_ms, generation: generation.id }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Hit {
    score: f32,
    fields: u8,
}

type Matches = HashMap<DocId, Hit>;

fn field_bit(field: Field) -> u8 {
    1 << (field as u8)
}

fn merge_sum(into: &mut Matches, from: Matches) {
    for (id, hit) in from {
        let slot = into.entry(id).or_default();
        slot.score += hit.score;
        slot.fields |= hit.fields;
    }
}

fn intersect(a: Matches, b: Matches) -> Matches {
    let (small, mut large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .into_iter()
        .filter_map(|(id, hit)| {
            large.remove(&id).map(|other| {
                (id, Hit { score: hit.score + other.score, fields: hit.fields | other.fields })
            })
        })
        .collect()
}

fn keep_max(hits: &mut HashMap<DocId, f32>, doc_id: DocId, score: f32) {
    let slot = hits.entry(doc_id).or_insert(score);
    if score > *slot {
        *slot = score;
    }
}

/// Terms of length 3 or less match exactly; up to 5 allow a single edit.
fn fuzzy_cap(len: usize, requested: u8) -> usize {
    match len {
        0..=3 => 0,
        4..=5 => usize::from(requested.min(1)),
        _ => usize::from(requested),
    }
}

/// In-text pattern for one wildcard word, bounded to word characters.
fn wildcard_word_regex(word: &str) -> String {
    let mut out = String::from(r"\b");
    for ch in word.chars() {
        match ch {
            '*' => out.push_str(r"\w*"),
            '?' => out.push_str(r"\w"),
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push_str(r"\b");
    out
}

struct Evaluator<'a> {
    generation: &'a Generation,
    filters: &'a Filters,
    boosts: FieldBoosts,
    total_docs: f32,
    deadline: Option<Instant>,
    expired: bool,
    /// Depth of negations being evaluated; those always run to completion.
    strict: usize,
}

impl<'a> Evaluator<'a> {
    /// Whether work may be skipped. `expired` is only set when something is.
    fn out_of_time(&mut self) -> bool {
        if self.strict > 0 {
            return false;
        }
        if !self.expired && self.deadline.is_some_and(|d| Instant::now() >= d) {
            self.expired = true;
        }
        self.expired
    }

    /// Everything `node` matches, ignoring the deadline. A partial exclusion
    /// set would let excluded documents through.
    fn excluded(&mut self, node: &QueryNode) -> Matches {
        self.strict += 1;
        let found = self.eval(node);
        self.strict -= 1;
        found
    }

    fn allowed(&self, doc_id: DocId) -> bool {
        self.filters.is_empty()
            || self.generation.docs.get(&doc_id).is_some_and(|doc| self.filters.matches(doc))
    }

    /// Every document that passes the filters, unscored.
    fn universe(&self) -> Matches {
        self.generation
            .docs
            .iter()
            .filter(|(_, doc)| self.filters.matches(doc))
            .map(|(id, _)| (*id, Hit::default()))
            .collect()
    }

    fn eval(&mut self, node: &QueryNode) -> Matches {
        match node {
            QueryNode::Term(term) => self.leaf(term),
            QueryNode::Or(children) => {
                let mut acc = Matches::new();
                for child in children {
                    if self.out_of_time() {
                        break;
                    }
                    let found = self.eval(child);
                    merge_sum(&mut acc, found);
                }
                acc
            }
            QueryNode::Not(inner) => {
                let excluded = self.excluded(inner);
                let mut all = self.universe();
                all.retain(|id, _| !excluded.contains_key(id));
                all
            }
            QueryNode::And(children) => {
                let (negative, positive): (Vec<&QueryNode>, Vec<&QueryNode>) =
                    children.iter().partition(|c| matches!(c, QueryNode::Not(_)));
                let mut acc: Option<Matches> = None;
                for child in positive {
                    // Past the deadline every constraint still applies; only
                    // dictionary scans shrink, which can only drop candidates.
                    if acc.as_ref().is_some_and(Matches::is_empty) {
                        break;
                    }
                    let found = self.eval(child);
                    acc = Some(match acc {
                        None => found,
                        Some(prev) => intersect(prev, found),
                    });
                }
                let mut acc = acc.unwrap_or_else(|| self.universe());
                for child in negative {
                    if let QueryNode::Not(inner) = child {
                        let excluded = self.excluded(inner);
                        acc.retain(|id, _| !excluded.contains_key(id));
                    }
                }
                acc
            }
        }
    }

    fn leaf(&mut self, node: &TermNode) -> Matches {
        let mut out = Matches::new();
        let tokens = tokenizer::tokenize(&node.text);
        for &field in node.target.fields() {
            let mut hits: HashMap<DocId, f32> = HashMap::new();
            match node.mode {
                MatchMode::Wildcard => self.wildcard(field, &node.text, &mut hits),
                _ if tokens.is_empty() => {}
                _ if tokens.len() > 1 => self.phrase(field, &tokens, &mut hits),
                MatchMode::Fuzzy(distance) => self.fuzzy(field, &tokens[0].0, distance, &mut hits),
                MatchMode::Exact | MatchMode::Phrase => self.exact(field, &tokens[0].0, &mut hits),
            }
            let bit = field_bit(field);
            for (id, score) in hits {
                let slot = out.entry(id).or_default();
                slot.score += score;
                slot.fields |= bit;
            }
        }
        out
    }

    fn score(&self, field: Field, tf: u32, df: usize, weight: f32) -> f32 {
        self.boosts.get(field) * (1.0 + (tf.max(1) as f32).ln()) * self.idf(df) * weight
    }

    fn idf(&self, df: usize) -> f32 {
        (1.0 + self.total_docs / df.max(1) as f32).ln()
    }

    fn add_postings(&self, field: Field, postings: &[Posting], weight: f32, hits: &mut HashMap<DocId, f32>) {
        let df = postings.len();
        for posting in postings {
            if self.allowed(posting.doc_id) {
                keep_max(hits, posting.doc_id, self.score(field, posting.tf(), df, weight));
            }
        }
    }

    fn field_index(&self, field: Field) -> &'a FieldIndex {
        self.generation.index.field(field)
    }

    fn exact(&self, field: Field, term: &str, hits: &mut HashMap<DocId, f32>) {
        if let Some(postings) = self.field_index(field).postings(term) {
            self.add_postings(field, postings, 1.0, hits);
        }
    }

    fn wildcard(&mut self, field: Field, glob: &str, hits: &mut HashMap<DocId, f32>) {
        let Ok(glob) = GlobBuilder::new(&tokenizer::normalize(glob))
            .case_insensitive(true)
            .literal_separator(false)
            .build()
        else {
            return;
        };
        let matcher = glob.compile_matcher();
        let index = self.field_index(field);
        for (i, (term, postings)) in index.terms.iter().enumerate() {
            if i % DEADLINE_STRIDE == 0 && self.out_of_time() {
                break;
            }
            if matcher.is_match(term.as_str()) {
                self.add_postings(field, postings, WILDCARD_WEIGHT, hits);
            }
        }
    }

    fn fuzzy(&mut self, field: Field, term: &str, requested: u8, hits: &mut HashMap<DocId, f32>) {
        self.exact(field, term, hits);
        let len = term.chars().count();
        let cap = fuzzy_cap(len, requested);
        if cap == 0 {
            return;
        }
        let index = self.field_index(field);
        for (i, (candidate, postings)) in index.terms.iter().enumerate() {
            if i % DEADLINE_STRIDE == 0 && self.out_of_time() {
                break;
            }
            if candidate == term || candidate.chars().count().abs_diff(len) > cap {
                continue;
            }
            let distance = levenshtein::distance(term.chars(), candidate.chars());
            if distance == 0 || distance > cap {
                continue;
            }
            let weight = FUZZY_WEIGHT * (1.0 - distance as f32 / (len as f32 + 1.0));
            self.add_postings(field, postings, weight, hits);
        }
    }

    /// All tokens at their relative positions. Scored on the phrase frequency
    /// with the idf of every word summed.
    fn phrase(&self, field: Field, tokens: &[(String, usize)], hits: &mut HashMap<DocId, f32>) {
        let index = self.field_index(field);
        let Some(lists) = tokens
            .iter()
            .map(|(term, _)| index.postings(term))
            .collect::<Option<Vec<&[Posting]>>>()
        else {
            return;
        };
        let base = tokens[0].1;
        let idf: f32 = lists.iter().map(|l| self.idf(l.len())).sum();
        let boost = self.boosts.get(field);

        for posting in lists[0] {
            if !self.allowed(posting.doc_id) {
                continue;
            }
            let Some(others) = lists[1..]
                .iter()
                .map(|list| {
                    list.binary_search_by_key(&posting.doc_id, |p| p.doc_id)
                        .ok()
                        .map(|i| &list[i])
                })
                .collect::<Option<Vec<&Posting>>>()
            else {
                continue;
            };
            let occurrences = posting
                .positions
                .iter()
                .filter(|&&p| p != NAME_POSITION)
                .filter(|&&p| {
                    tokens[1..].iter().zip(&others).all(|((_, offset), other)| {
                        let wanted = u64::from(p) + (offset - base) as u64;
                        u32::try_from(wanted).is_ok_and(|w| other.positions.binary_search(&w).is_ok())
                    })
                })
                .count();
            if occurrences > 0 {
                let score = boost * (1.0 + (occurrences as f32).ln()) * idf;
                keep_max(hits, posting.doc_id, score);
            }
        }
    }
}

/// Case-insensitive patterns for the content words of a query. Phrases come
/// first so the snippet centres on the strongest match.
struct HighlightPatterns {
    patterns: Vec<Regex>,
}

impl HighlightPatterns {
    fn new(query: &Query) -> Self {
        let Some(root) = &query.root else {
            return Self { patterns: Vec::new() };
        };
        let mut terms: Vec<&TermNode> = root
            .positive_terms()
            .into_iter()
            .filter(|t| t.target.fields().contains(&Field::Content))
            .collect();
        terms.sort_by_key(|t| t.mode != MatchMode::Phrase);

        let mut sources = Vec::new();
        for term in terms {
            let words: Vec<&str> = term
                .text
                .split(|c: char| !(c.is_alphanumeric() || c == '*' || c == '?' || c == '\''))
                .filter(|w| !w.is_empty())
                .collect();
            match term.mode {
                MatchMode::Phrase if words.len() > 1 => {
                    let escaped: Vec<String> = words.iter().map(|w| regex::escape(w)).collect();
                    sources.push(format!(r"\b{}", escaped.join(r"\W+")));
                }
                MatchMode::Wildcard => {
                    for word in words {
                        sources.push(wildcard_word_regex(word));
                    }
                }
                _ => {
                    for word in words {
                        let word = word.trim_matches(|c| c == '*' || c == '?');
                        if !word.is_empty() {
                            sources.push(format!(r"\b{}\w*", regex::escape(word)));
                        }
                    }
                }
            }
        }
        let patterns = sources
            .iter()
            .filter_map(|source| RegexBuilder::new(source).case_insensitive(true).build().ok())
            .collect();
        Self { patterns }
    }

    fn snippet(&self, text: &str, size: usize) -> Snippet {
        let anchor = self
            .patterns
            .iter()
            .find_map(|re| re.find(text))
            .map_or(0, |m| m.start());
        let start = back_chars(text, anchor, size / 4);
        let end = forward_chars(text, start, size);
        let window = &text[start..end];

        let mut highlights: Vec<(usize, usize)> = self
            .patterns
            .iter()
            .flat_map(|re| re.find_iter(window).map(|m| (m.start(), m.end())))
            .collect();
        highlights.sort_unstable();
        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(highlights.len());
        for (s, e) in highlights {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        // Same byte length, so the offsets stay valid.
        let text = window.replace(['\n', '\r', '\t'], " ");
        Snippet { text, highlights: merged }
    }
}

fn back_chars(text: &str, from: usize, n: usize) -> usize {
    if n == 0 {
        return from;
    }
    text[..from].char_indices().rev().take(n).last().map_or(from, |(i, _)| i)
}

fn forward_chars(text: &str, from: usize, n: usize) -> usize {
    text[from..].char_indices().nth(n).map_or(text.len(), |(i, _)| from + i)
}
