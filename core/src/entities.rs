//! Optional entity recognition over the free words of a query.
//!
//! A recognizer only proposes; the parser decides. Filters the user typed
//! explicitly (`ext:`, `after:`, ...) always take precedence over proposals.

use std::ops::Range;
use time::OffsetDateTime;

use crate::lexicon::{self, TimeRange};

#[derive(Debug, Clone, PartialEq)]
pub enum EntityKind {
    FileCategory { name: String, extensions: Vec<String> },
    Time(TimeRange),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// Indices into the word slice handed to the recognizer.
    pub span: Range<usize>,
    pub kind: EntityKind,
}

pub trait EntityRecognizer: Send + Sync {
    /// `words` are the lower-cased free words of the query, in order.
    fn recognize(&self, words: &[&str], now: OffsetDateTime) -> Vec<Entity>;
}

/// Rule-based recognizer backed by the category tables in [`crate::lexicon`].
///
/// Plural category words (`images`, `videos`) always count; singular ones only
/// when followed by `file`/`files`, so `image processing` stays free text.
/// Also understands `last N days|weeks|months`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CategoryLexicon;

impl EntityRecognizer for CategoryLexicon {
    fn recognize(&self, words: &[&str], now: OffsetDateTime) -> Vec<Entity> {
        let mut entities = Vec::new();
        let mut i = 0;
        while i < words.len() {
            if let Some(entity) = relative_days(words, i, now) {
                i = entity.span.end;
                entities.push(entity);
                continue;
            }
            let word = words[i];
            let followed_by_file = words.get(i + 1).is_some_and(|w| lexicon::is_file_word(w));
            let hit = lexicon::CATEGORIES.iter().find(|c| {
                c.plural_words.contains(&word) || (followed_by_file && c.singular_words.contains(&word))
            });
            match hit {
                Some(category) => {
                    let end = if followed_by_file { i + 2 } else { i + 1 };
                    entities.push(Entity {
                        span: i..end,
                        kind: EntityKind::FileCategory {
                            name: category.name.to_string(),
                            extensions: category.extensions.iter().map(|e| e.to_string()).collect(),
                        },
                    });
                    i = end;
                }
                None => i += 1,
            }
        }
        entities
    }
}

fn relative_days(words: &[&str], i: usize, now: OffsetDateTime) -> Option<Entity> {
    if !matches!(words[i], "last" | "past") {
        return None;
    }
    let count: i64 = words.get(i + 1)?.parse().ok()?;
    let unit_days = match *words.get(i + 2)? {
        "day" | "days" => 1,
        "week" | "weeks" => 7,
        "month" | "months" => 30,
        _ => return None,
    };
    let days = count.checked_mul(unit_days).filter(|d| (1..=36_500).contains(d))?;
    Some(Entity {
        span: i..i + 3,
        kind: EntityKind::Time(TimeRange {
            after: Some(lexicon::days_before(now, days)?),
            before: None,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn recognize(words: &[&str]) -> Vec<Entity> {
        CategoryLexicon.recognize(words, datetime!(2024-05-10 12:00 UTC))
    }

    #[test]
    fn plural_words_always_match() {
        let entities = recognize(&["vacation", "photos"]);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].span, 1..2);
        match &entities[0].kind {
            EntityKind::FileCategory { name, extensions } => {
                assert_eq!(name, "image");
                assert!(extensions.contains(&"png".to_string()));
            }
            other => panic!("unexpected entity {other:?}"),
        }
    }

    #[test]
    fn singular_words_need_file() {
        assert!(recognize(&["image", "processing"]).is_empty());
        let entities = recognize(&["video", "files"]);
        assert_eq!(entities[0].span, 0..2);
    }

    #[test]
    fn last_n_days() {
        let entities = recognize(&["report", "last", "3", "days"]);
        assert_eq!(
            entities,
            vec![Entity {
                span: 1..4,
                kind: EntityKind::Time(TimeRange {
                    after: Some(datetime!(2024-05-07 12:00 UTC).unix_timestamp()),
                    before: None,
                }),
            }]
        );
    }
}
