//! Turns raw query text into a [`Query`].
//!
//! The fixed lexicon always runs first: quoted phrases, field filters
//! (`ext:`, `in:`, `size:`, `after:` ...), size and time expressions,
//! wildcards, `term~N` and the boolean operators. Whatever free words remain
//! are offered to the optional [`EntityRecognizer`]; what it does not claim
//! becomes filename-or-content terms. Parsing never fails: anything malformed
//! is kept as a literal term and reported in [`Query::notes`].

use std::sync::Arc;
use time::OffsetDateTime;

use crate::config::Config;
use crate::entities::{CategoryLexicon, EntityKind, EntityRecognizer};
use crate::lexicon::{self, SizeRange, TimeRange};
use crate::query::{Filters, MatchMode, ParseNote, Query, QueryNode, TermTarget};
use crate::tokenizer;

const MAX_FUZZY_DISTANCE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserOptions {
    pub enable_fuzzy: bool,
    pub fuzzy_distance: u8,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self { enable_fuzzy: true, fuzzy_distance: 2 }
    }
}

impl From<&Config> for ParserOptions {
    fn from(config: &Config) -> Self {
        Self {
            enable_fuzzy: config.enable_fuzzy,
            fuzzy_distance: config.fuzzy_distance,
        }
    }
}

#[derive(Clone, Default)]
pub struct QueryParser {
    options: ParserOptions,
    recognizer: Option<Arc<dyn EntityRecognizer>>,
}

impl std::fmt::Debug for QueryParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryParser")
            .field("options", &self.options)
            .field("recognizer", &self.recognizer.is_some())
            .finish()
    }
}

impl QueryParser {
    pub fn new(options: ParserOptions) -> Self {
        Self { options, recognizer: None }
    }

    /// Parser configured from `config`, with the [`CategoryLexicon`] unless
    /// entity recognition is disabled.
    pub fn from_config(config: &Config) -> Self {
        let parser = Self::new(config.into());
        if config.enable_entity_recognition {
            parser.with_recognizer(Arc::new(CategoryLexicon))
        } else {
            parser
        }
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn EntityRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn parse(&self, raw: &str) -> Query {
        self.parse_at(raw, local_now())
    }

    /// Like [`QueryParser::parse`] with relative time words resolved against `now`.
    pub fn parse_at(&self, raw: &str, now: OffsetDateTime) -> Query {
        let mut state = ParseState {
            now,
            options: self.options,
            filters: Filters::default(),
            notes: Vec::new(),
            items: Vec::new(),
            explicit_ext: false,
            explicit_time: false,
        };
        let lexemes = lex(raw, &mut state.notes);
        state.classify(&lexemes);
        if let Some(recognizer) = &self.recognizer {
            state.apply_entities(recognizer.as_ref());
        }
        let root = state.build_tree();
        Query { root, filters: state.filters, notes: state.notes }
    }
}

pub fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

#[derive(Debug, Clone, PartialEq)]
enum Lexeme {
    Word(String),
    Phrase(String),
}

fn lex(raw: &str, notes: &mut Vec<ParseNote>) -> Vec<Lexeme> {
    let mut out = Vec::new();
    let mut rest = raw;
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if let Some(after) = rest.strip_prefix('"') {
            match after.find('"') {
                Some(end) => {
                    let phrase = after[..end].trim();
                    if !phrase.is_empty() {
                        out.push(Lexeme::Phrase(phrase.to_string()));
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // The words after the stray quote are read as plain words.
                    note(notes, rest, "unbalanced quote");
                    rest = after;
                }
            }
            continue;
        }
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '"')
            .unwrap_or(rest.len());
        out.push(Lexeme::Word(rest[..end].to_string()));
        rest = &rest[end..];
    }
    out
}

fn note(notes: &mut Vec<ParseNote>, token: &str, reason: &str) {
    tracing::debug!(token, reason, "query parse ambiguity");
    notes.push(ParseNote { token: token.to_string(), reason: reason.to_string() });
}

fn word_at(lexemes: &[Lexeme], i: usize) -> Option<&str> {
    match lexemes.get(i) {
        Some(Lexeme::Word(w)) => Some(w.as_str()),
        _ => None,
    }
}

fn lower_at(lexemes: &[Lexeme], i: usize) -> Option<String> {
    word_at(lexemes, i).map(str::to_lowercase)
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || c == '.') && s.chars().any(|c| c.is_ascii_digit())
}

fn bare_extension(lower: &str) -> Option<&str> {
    let ext = lower.strip_prefix('.')?;
    let valid = (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some(ext)
}

/// `*` anywhere, or `?` anywhere except as a lone trailing question mark.
fn is_wildcard(word: &str) -> bool {
    if word.contains('*') {
        return true;
    }
    let marks = word.matches('?').count();
    marks > 1 || (marks == 1 && !word.ends_with('?'))
}

#[derive(Debug)]
enum Item {
    /// Free word, still open to entity recognition.
    Word(String),
    Node(QueryNode),
    Or,
    Not,
}

struct ParseState {
    now: OffsetDateTime,
    options: ParserOptions,
    filters: Filters,
    notes: Vec<ParseNote>,
    items: Vec<Item>,
    explicit_ext: bool,
    explicit_time: bool,
}

impl ParseState {
    fn classify(&mut self, lexemes: &[Lexeme]) {
        let mut i = 0;
        while i < lexemes.len() {
            let before = self.items.len();
            let consumed = match &lexemes[i] {
                Lexeme::Phrase(text) => {
                    self.push_phrase(text);
                    1
                }
                Lexeme::Word(word) => self.classify_word(word, &lexemes[i + 1..]),
            };
            // `NOT ext:pdf`: filters cannot be negated.
            if self.items.len() == before && matches!(self.items.last(), Some(Item::Not)) {
                self.items.pop();
                if let Lexeme::Word(word) = &lexemes[i] {
                    note(&mut self.notes, word, "filters cannot be negated");
                }
            }
            i += consumed.max(1);
        }
    }

    /// Returns how many lexemes were consumed, `word` included.
    fn classify_word(&mut self, word: &str, next: &[Lexeme]) -> usize {
        match word {
            "OR" | "|" | "||" => {
                self.items.push(Item::Or);
                return 1;
            }
            "AND" | "&" | "&&" => return 1,
            "NOT" => {
                self.items.push(Item::Not);
                return 1;
            }
            _ => {}
        }
        if let Some(rest) = word.strip_prefix('-') {
            if rest.chars().next().is_some_and(|c| c.is_alphabetic() || c == '"' || c == '.') {
                self.items.push(Item::Not);
                let consumed = self.classify_word(rest, next);
                if matches!(self.items.last(), Some(Item::Not)) {
                    self.items.pop();
                    note(&mut self.notes, word, "filters cannot be negated");
                }
                return consumed;
            }
        }

        let lower = word.to_lowercase();
        if let Some((key, _)) = lower.split_once(':') {
            if let Some(target) = field_target(key) {
                return self.targeted_term(word, target, next);
            }
            if let Some(consumed) = self.field_filter(word, key, next) {
                return consumed;
            }
        }
        if let Some(consumed) = self.size_expression(word, &lower, next) {
            return consumed;
        }
        if let Some(consumed) = self.time_expression(&lower, next) {
            return consumed;
        }
        if let Some(ext) = bare_extension(&lower) {
            self.add_extension(ext);
            return 1;
        }
        if is_wildcard(word) {
            self.items.push(Item::Node(QueryNode::term(
                word,
                TermTarget::FilenameOrContent,
                MatchMode::Wildcard,
            )));
            return 1;
        }
        if let Some((base, distance)) = self.fuzzy_suffix(word) {
            if !tokenizer::terms(base).is_empty() {
                let mode = if distance == 0 { MatchMode::Exact } else { MatchMode::Fuzzy(distance) };
                self.items.push(Item::Node(QueryNode::term(base, TermTarget::FilenameOrContent, mode)));
            }
            return 1;
        }
        self.items.push(Item::Word(word.to_string()));
        1
    }

    /// `key:value` filters. `None` when `key` is not a filter name.
    fn field_filter(&mut self, word: &str, key: &str, next: &[Lexeme]) -> Option<usize> {
        let inline = word.split_once(':').map_or("", |(_, v)| v);
        let (value, consumed) = if inline.is_empty() {
            match word_at(next, 0) {
                Some(w) if !w.contains(':') => (w.to_string(), 2),
                _ => (String::new(), 1),
            }
        } else {
            (inline.to_string(), 1)
        };
        let lower_value = value.to_lowercase();

        let applied = match key {
            "ext" | "extension" | "type" | "kind" | "filetype" => {
                let mut added = false;
                for part in lower_value.split(',') {
                    let part = part.trim().trim_start_matches('.');
                    if part.is_empty() {
                        continue;
                    }
                    let category = matches!(key, "type" | "kind").then(|| lexicon::category(part)).flatten();
                    match category {
                        Some(category) => {
                            for ext in category.extensions {
                                self.add_extension(ext);
                            }
                            added = true;
                        }
                        None if part.chars().all(|c| c.is_alphanumeric()) => {
                            self.add_extension(part);
                            added = true;
                        }
                        None => {}
                    }
                }
                added
            }
            "in" | "dir" | "directory" | "path" | "folder" => {
                let dir = value.trim().trim_matches('/');
                if dir.is_empty() && !value.starts_with('/') {
                    false
                } else {
                    let dir = if value.starts_with('/') { value.trim_end_matches('/') } else { dir };
                    self.filters.directory = Some(if dir.is_empty() { "/".to_string() } else { dir.to_string() });
                    true
                }
            }
            "size" => match self.size_value(&lower_value) {
                Some(range) => {
                    self.set_size(range);
                    true
                }
                None => false,
            },
            "after" | "since" => match lexicon::parse_time_value(&lower_value, self.now) {
                Some(range) => {
                    self.set_time(TimeRange { after: range.after, before: None });
                    true
                }
                None => false,
            },
            "before" | "until" => match lexicon::parse_time_value(&lower_value, self.now) {
                Some(range) => {
                    let before = range.after.map(|t| t - 1);
                    self.set_time(TimeRange { after: None, before });
                    true
                }
                None => false,
            },
            "modified" | "created" | "changed" | "date" => match lexicon::parse_time_value(&lower_value, self.now) {
                Some(range) => {
                    self.set_time(range);
                    true
                }
                None => false,
            },
            _ => return None,
        };

        if !applied {
            let reason = if value.is_empty() {
                format!("missing value for {key}:")
            } else {
                format!("cannot interpret {key}:{value}")
            };
            note(&mut self.notes, word, &reason);
            self.items.push(Item::Word(word.to_string()));
            // The peeked value stays available as ordinary text.
            return Some(1);
        }
        Some(consumed)
    }

    /// `large`, `>5mb`, `10mb`.
    fn size_value(&self, value: &str) -> Option<SizeRange> {
        if let Some(range) = lexicon::size_category(value) {
            return Some(range);
        }
        match lexicon::split_comparison(value) {
            Some((op, rest)) => lexicon::parse_size_literal(rest).map(|b| op.to_range(b)),
            None => lexicon::parse_size_literal(value).map(|b| lexicon::Comparison::Eq.to_range(b)),
        }
    }

    fn size_expression(&mut self, word: &str, lower: &str, next: &[Lexeme]) -> Option<usize> {
        let mut operator_text = lower;
        if let Some(rest) = lower.strip_prefix("size") {
            if rest.is_empty() {
                let (range, used) = self.size_after_keyword(next)?;
                self.set_size(range);
                return Some(1 + used);
            }
            operator_text = rest;
        }
        if let Some((op, rest)) = lexicon::split_comparison(operator_text) {
            return match self.size_operand(rest, next) {
                Some((bytes, used)) => {
                    self.set_size(op.to_range(bytes));
                    Some(1 + used)
                }
                None => {
                    note(&mut self.notes, word, "invalid size literal");
                    self.items.push(Item::Word(word.to_string()));
                    Some(1)
                }
            };
        }
        if operator_text != lower {
            return None;
        }

        let comparison = match lower {
            "larger" | "bigger" | "greater" | "over" | "above" => Some(lexicon::Comparison::Gt),
            "smaller" | "less" | "under" | "below" => Some(lexicon::Comparison::Lt),
            _ => None,
        };
        if let Some(op) = comparison {
            let skip = usize::from(lower_at(next, 0).as_deref() == Some("than"));
            let (bytes, used) = self.size_operand("", &next[skip.min(next.len())..])?;
            self.set_size(op.to_range(bytes));
            return Some(1 + skip + used);
        }

        if let Some(range) = lexicon::size_category(lower) {
            if lower_at(next, 0).is_some_and(|w| lexicon::is_file_word(&w)) {
                self.set_size(range);
                return Some(2);
            }
        }
        None
    }

    /// What follows a bare `size` keyword: `> 5MB`, `>5mb`, `large`, `5 mb`.
    fn size_after_keyword(&self, next: &[Lexeme]) -> Option<(SizeRange, usize)> {
        let first = lower_at(next, 0)?;
        if let Some(range) = lexicon::size_category(&first) {
            return Some((range, 1));
        }
        let (op, rest) = lexicon::split_comparison(&first).unwrap_or((lexicon::Comparison::Eq, first.as_str()));
        let (bytes, used) = self.size_operand(rest, &next[1..])?;
        Some((op.to_range(bytes), 1 + used))
    }

    /// A size literal starting in `rest` (the tail of the current word) or in
    /// the following words. Returns the bytes and how many following words it used.
    fn size_operand(&self, rest: &str, next: &[Lexeme]) -> Option<(u64, usize)> {
        if !rest.is_empty() {
            if is_number(rest) {
                if let Some(unit) = lower_at(next, 0).filter(|u| lexicon::is_size_unit(u)) {
                    return lexicon::parse_size_literal(&format!("{rest}{unit}")).map(|b| (b, 1));
                }
            }
            return lexicon::parse_size_literal(rest).map(|b| (b, 0));
        }
        let first = lower_at(next, 0)?;
        if is_number(&first) {
            if let Some(unit) = lower_at(next, 1).filter(|u| lexicon::is_size_unit(u)) {
                return lexicon::parse_size_literal(&format!("{first}{unit}")).map(|b| (b, 2));
            }
        }
        lexicon::parse_size_literal(&first).map(|b| (b, 1))
    }

    fn time_expression(&mut self, lower: &str, next: &[Lexeme]) -> Option<usize> {
        if lexicon::is_time_verb(lower) {
            let first = lower_at(next, 0)?;
            let (range, used) = self
                .time_phrase(&first, &next[1..])
                .or_else(|| lexicon::parse_date(&first, self.now).map(|r| (r, 1)))?;
            let range = if matches!(lower, "since" | "from") {
                TimeRange { after: range.after, before: None }
            } else {
                range
            };
            self.set_time(range);
            return Some(1 + used);
        }
        let (range, used) = self.time_phrase(lower, next)?;
        self.set_time(range);
        Some(used)
    }

    fn time_phrase(&self, first: &str, next: &[Lexeme]) -> Option<(TimeRange, usize)> {
        if let Some(range) = lexicon::time_word(first, self.now) {
            return Some((range, 1));
        }
        if lexicon::is_time_qualifier(first) {
            let period = lower_at(next, 0)?;
            return lexicon::time_period(&period, self.now).map(|r| (r, 2));
        }
        None
    }

    fn fuzzy_suffix<'w>(&self, word: &'w str) -> Option<(&'w str, u8)> {
        let (base, suffix) = word.rsplit_once('~')?;
        if base.is_empty() {
            return None;
        }
        let distance = if suffix.is_empty() {
            self.options.fuzzy_distance.max(1)
        } else {
            suffix.parse::<u8>().ok()?
        };
        Some((base, distance.min(MAX_FUZZY_DISTANCE)))
    }

    fn push_phrase(&mut self, text: &str) {
        if tokenizer::terms(text).is_empty() {
            return;
        }
        self.items.push(Item::Node(QueryNode::term(
            text,
            TermTarget::FilenameOrContent,
            MatchMode::Phrase,
        )));
    }

    /// `name:report*`, `content:"draft notes"`, `dirname: projects`. The value
    /// is the rest of the word, or the next phrase or word when that is empty.
    fn targeted_term(&mut self, word: &str, target: TermTarget, next: &[Lexeme]) -> usize {
        let inline = word.split_once(':').map_or("", |(_, v)| v);
        let (node, consumed) = if !inline.is_empty() {
            (self.targeted_node(inline, target), 1)
        } else {
            match next.first() {
                Some(Lexeme::Phrase(text)) if !tokenizer::terms(text).is_empty() => {
                    (Some(QueryNode::term(text.as_str(), target, MatchMode::Phrase)), 2)
                }
                Some(Lexeme::Word(w)) if !w.contains(':') => (self.targeted_node(w, target), 2),
                _ => (None, 1),
            }
        };
        match node {
            Some(node) => self.items.push(Item::Node(node)),
            None => note(&mut self.notes, word, "field prefix without a searchable term"),
        }
        consumed
    }

    fn targeted_node(&self, value: &str, target: TermTarget) -> Option<QueryNode> {
        if is_wildcard(value) {
            return Some(QueryNode::term(value, target, MatchMode::Wildcard));
        }
        if let Some((base, distance)) = self.fuzzy_suffix(value) {
            if tokenizer::terms(base).is_empty() {
                return None;
            }
            let mode = if distance == 0 { MatchMode::Exact } else { MatchMode::Fuzzy(distance) };
            return Some(QueryNode::term(base, target, mode));
        }
        self.word_node(value, target)
    }

    fn add_extension(&mut self, ext: &str) {
        let ext = ext.trim_start_matches('.').to_lowercase();
        if !self.filters.extensions.contains(&ext) {
            self.filters.extensions.push(ext);
        }
        self.explicit_ext = true;
    }

    fn set_size(&mut self, range: SizeRange) {
        if range.min.is_some() {
            self.filters.min_size = range.min;
        }
        if range.max.is_some() {
            self.filters.max_size = range.max;
        }
    }

    fn set_time(&mut self, range: TimeRange) {
        if range.after.is_some() {
            self.filters.modified_after = range.after;
        }
        if range.before.is_some() {
            self.filters.modified_before = range.before;
        }
        self.explicit_time = true;
    }

    /// Offers the free words to `recognizer`. Accepted entities turn into
    /// filters and their words leave the query; rejected ones stay as terms.
    fn apply_entities(&mut self, recognizer: &dyn EntityRecognizer) {
        let positions: Vec<usize> = self
            .items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| matches!(item, Item::Word(_)).then_some(i))
            .collect();
        if positions.is_empty() {
            return;
        }
        let lowered: Vec<String> = positions
            .iter()
            .map(|&i| match &self.items[i] {
                Item::Word(w) => w.to_lowercase(),
                _ => String::new(),
            })
            .collect();
        let words: Vec<&str> = lowered.iter().map(String::as_str).collect();

        let mut claimed = vec![false; words.len()];
        let mut inferred_ext = Vec::new();
        for entity in recognizer.recognize(&words, self.now) {
            let span = entity.span.clone();
            if span.is_empty() || span.end > words.len() || claimed[span.clone()].iter().any(|c| *c) {
                continue;
            }
            let accepted = match entity.kind {
                EntityKind::FileCategory { name, extensions } => {
                    if self.explicit_ext {
                        tracing::debug!(category = %name, "explicit extension filter wins over category");
                        false
                    } else {
                        inferred_ext.extend(extensions);
                        true
                    }
                }
                EntityKind::Time(range) => {
                    if self.explicit_time {
                        false
                    } else {
                        if range.after.is_some() {
                            self.filters.modified_after = range.after;
                        }
                        if range.before.is_some() {
                            self.filters.modified_before = range.before;
                        }
                        true
                    }
                }
            };
            if accepted {
                claimed[span].iter_mut().for_each(|c| *c = true);
            }
        }
        for ext in inferred_ext {
            if !self.filters.extensions.contains(&ext) {
                self.filters.extensions.push(ext);
            }
        }
        for (slot, &item_index) in positions.iter().enumerate().rev() {
            if claimed[slot] {
                self.items.remove(item_index);
            }
        }
    }

    fn build_tree(&mut self) -> Option<QueryNode> {
        let mut clauses: Vec<QueryNode> = Vec::new();
        let mut negate = false;
        let mut join_or = false;
        for item in std::mem::take(&mut self.items) {
            let node = match item {
                Item::Or => {
                    join_or = !clauses.is_empty();
                    continue;
                }
                Item::Not => {
                    negate = true;
                    continue;
                }
                Item::Node(node) => node,
                Item::Word(word) => match self.word_node(&word, TermTarget::FilenameOrContent) {
                    Some(node) => node,
                    None => continue,
                },
            };
            let node = if std::mem::take(&mut negate) {
                QueryNode::Not(Box::new(node))
            } else {
                node
            };
            if std::mem::take(&mut join_or) {
                match clauses.pop() {
                    Some(QueryNode::Or(mut alternatives)) => {
                        alternatives.push(node);
                        clauses.push(QueryNode::Or(alternatives));
                    }
                    Some(previous) => clauses.push(QueryNode::Or(vec![previous, node])),
                    None => clauses.push(node),
                }
            } else {
                clauses.push(node);
            }
        }
        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(QueryNode::And(clauses)),
        }
    }

    fn word_node(&self, word: &str, target: TermTarget) -> Option<QueryNode> {
        if lexicon::is_noise_word(&tokenizer::normalize(word)) {
            return None;
        }
        let terms = tokenizer::terms(word);
        let mode = match terms.len() {
            0 => return None,
            // `report_final` must keep its words together.
            1 if self.options.enable_fuzzy && self.options.fuzzy_distance > 0 => {
                MatchMode::Fuzzy(self.options.fuzzy_distance.min(MAX_FUZZY_DISTANCE))
            }
            1 => MatchMode::Exact,
            _ => MatchMode::Phrase,
        };
        Some(QueryNode::term(word, target, mode))
    }
}

/// Term prefixes that restrict a word to one field. Directory terms use
/// `dirname:` since `dir:` and `in:` are the directory filter.
fn field_target(key: &str) -> Option<TermTarget> {
    match key {
        "name" | "filename" | "title" => Some(TermTarget::Filename),
        "content" | "text" | "body" => Some(TermTarget::Content),
        "dirname" | "foldername" => Some(TermTarget::Directory),
        "any" | "all" => Some(TermTarget::All),
        _ => None,
    }
}
