//! Fixed keyword tables used by the query parser: size categories and
//! literals, relative-time words, file-type categories and noise words.

use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, Time};

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * 1024;
pub const GB: u64 = 1024 * 1024 * 1024;

/// Inclusive byte bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeRange {
    pub min: Option<u64>,
    pub max: Option<u64>,
}

/// Inclusive unix-second bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub after: Option<i64>,
    pub before: Option<i64>,
}

pub fn size_category(word: &str) -> Option<SizeRange> {
    let (min, max) = match word.to_ascii_lowercase().as_str() {
        "empty" => (Some(0), Some(0)),
        "tiny" => (None, Some(10 * KB)),
        "small" => (None, Some(MB)),
        "medium" => (Some(MB), Some(10 * MB)),
        "large" | "big" => (Some(10 * MB), Some(100 * MB)),
        "huge" => (Some(100 * MB), None),
        _ => return None,
    };
    Some(SizeRange { min, max })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl Comparison {
    pub fn to_range(self, value: u64) -> SizeRange {
        match self {
            Comparison::Lt => SizeRange { min: None, max: Some(value.saturating_sub(1)) },
            Comparison::Lte => SizeRange { min: None, max: Some(value) },
            Comparison::Gt => SizeRange { min: Some(value.saturating_add(1)), max: None },
            Comparison::Gte => SizeRange { min: Some(value), max: None },
            Comparison::Eq => SizeRange { min: Some(value), max: Some(value) },
        }
    }
}

/// Splits a leading comparison operator off `raw`. The remainder may be empty.
pub fn split_comparison(raw: &str) -> Option<(Comparison, &str)> {
    for (operator, kind) in [
        ("<=", Comparison::Lte),
        (">=", Comparison::Gte),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
        ("=", Comparison::Eq),
    ] {
        if let Some(rest) = raw.strip_prefix(operator) {
            return Some((kind, rest.trim()));
        }
    }
    None
}

/// `5MB`, `1.5 gb`, `300k`, `42` (bytes).
pub fn parse_size_literal(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    let split = trimmed
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map_or(trimmed.len(), |(i, _)| i);
    let (number, unit) = trimmed.split_at(split);
    if number.is_empty() {
        return None;
    }
    let value: f64 = number.parse().ok()?;
    let multiplier = size_unit(unit)?;
    let bytes = (value * multiplier as f64).round();
    if !bytes.is_finite() || bytes < 0.0 {
        return None;
    }
    Some(if bytes > u64::MAX as f64 { u64::MAX } else { bytes as u64 })
}

pub fn size_unit(unit: &str) -> Option<u64> {
    match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "byte" | "bytes" => Some(1),
        "k" | "kb" | "kib" | "kilobyte" | "kilobytes" => Some(KB),
        "m" | "mb" | "mib" | "megabyte" | "megabytes" => Some(MB),
        "g" | "gb" | "gib" | "gigabyte" | "gigabytes" => Some(GB),
        "t" | "tb" | "tib" | "terabyte" | "terabytes" => Some(1024 * GB),
        _ => None,
    }
}

pub fn is_size_unit(word: &str) -> bool {
    !word.is_empty() && size_unit(word).is_some_and(|m| m > 1 || word.starts_with('b'))
}

/// Words that introduce a time expression: `modified today`, `created this week`.
pub fn is_time_verb(word: &str) -> bool {
    matches!(
        word,
        "modified" | "created" | "changed" | "edited" | "updated" | "from" | "within" | "since"
    )
}

pub fn is_time_qualifier(word: &str) -> bool {
    matches!(word, "this" | "last" | "past")
}

pub fn start_of_day(now: OffsetDateTime) -> OffsetDateTime {
    now.replace_time(Time::MIDNIGHT)
}

/// `now` minus `days`, or `None` when that falls outside the supported calendar.
pub fn days_before(now: OffsetDateTime, days: i64) -> Option<i64> {
    now.checked_sub(Duration::days(days)).map(|t| t.unix_timestamp())
}

/// Single-word time expressions.
pub fn time_word(word: &str, now: OffsetDateTime) -> Option<TimeRange> {
    let midnight = start_of_day(now);
    let range = match word {
        "today" => TimeRange { after: Some(midnight.unix_timestamp()), before: None },
        "yesterday" => TimeRange {
            after: Some(days_before(midnight, 1)?),
            before: Some(midnight.unix_timestamp() - 1),
        },
        "recent" | "recently" => TimeRange { after: Some(days_before(now, 7)?), before: None },
        _ => return None,
    };
    Some(range)
}

/// `week`, `month`, `year` after `this`/`last`/`past`: everything since that long ago.
pub fn time_period(word: &str, now: OffsetDateTime) -> Option<TimeRange> {
    let days = match word {
        "week" => 7,
        "month" => 30,
        "year" => 365,
        _ => return None,
    };
    Some(TimeRange { after: Some(days_before(now, days)?), before: None })
}

const SECONDS_PER_DAY: i64 = 86_400;

/// `YYYY-MM-DD` interpreted in the offset of `now`; returns the day's bounds.
/// The bound is plain second arithmetic so the last representable date still works.
pub fn parse_date(raw: &str, now: OffsetDateTime) -> Option<TimeRange> {
    let format = format_description!("[year]-[month]-[day]");
    let date = Date::parse(raw.trim(), &format).ok()?;
    let start = date.with_time(Time::MIDNIGHT).assume_offset(now.offset()).unix_timestamp();
    Some(TimeRange {
        after: Some(start),
        before: Some(start + SECONDS_PER_DAY - 1),
    })
}

/// Date or single time word, as used after `after:`, `before:` and `modified:`.
pub fn parse_time_value(raw: &str, now: OffsetDateTime) -> Option<TimeRange> {
    let lower = raw.to_ascii_lowercase();
    parse_date(&lower, now)
        .or_else(|| time_word(&lower, now))
        .or_else(|| {
            ["this", "last", "past"]
                .iter()
                .find_map(|q| lower.strip_prefix(q))
                .and_then(|rest| time_period(rest.trim_start_matches(['-', '_']), now))
        })
}

pub struct Category {
    pub name: &'static str,
    /// Words that always name the category.
    pub plural_words: &'static [&'static str],
    /// Words that name the category only when followed by `file`/`files`.
    pub singular_words: &'static [&'static str],
    pub extensions: &'static [&'static str],
}

pub const CATEGORIES: &[Category] = &[
    Category {
        name: "document",
        plural_words: &["documents", "docs"],
        singular_words: &["document", "doc", "text"],
        extensions: &["pdf", "doc", "docx", "txt", "md", "rtf", "odt"],
    },
    Category {
        name: "image",
        plural_words: &["images", "pictures", "photos", "pics"],
        singular_words: &["image", "picture", "photo"],
        extensions: &["jpg", "jpeg", "png", "gif", "bmp", "svg", "webp", "tiff", "heic"],
    },
    Category {
        name: "video",
        plural_words: &["videos", "movies", "clips"],
        singular_words: &["video", "movie"],
        extensions: &["mp4", "avi", "mkv", "mov", "webm", "wmv"],
    },
    Category {
        name: "audio",
        plural_words: &["music", "songs", "sounds", "audio"],
        singular_words: &["song", "sound"],
        extensions: &["mp3", "wav", "flac", "aac", "ogg", "m4a"],
    },
    Category {
        name: "code",
        plural_words: &["scripts", "programs"],
        singular_words: &["code", "script", "source"],
        extensions: &["py", "js", "ts", "rs", "java", "cpp", "c", "h", "go", "rb", "sh"],
    },
    Category {
        name: "spreadsheet",
        plural_words: &["spreadsheets"],
        singular_words: &["spreadsheet", "excel"],
        extensions: &["csv", "xls", "xlsx", "ods"],
    },
    Category {
        name: "archive",
        plural_words: &["archives"],
        singular_words: &["archive", "compressed"],
        extensions: &["zip", "tar", "gz", "7z", "rar"],
    },
];

pub fn category(name: &str) -> Option<&'static Category> {
    let lower = name.to_ascii_lowercase();
    CATEGORIES.iter().find(|c| {
        c.name == lower || c.plural_words.contains(&lower.as_str()) || c.singular_words.contains(&lower.as_str())
    })
}

pub fn is_file_word(word: &str) -> bool {
    matches!(word, "file" | "files")
}

/// Dropped from free text; they carry no search meaning.
pub fn is_noise_word(word: &str) -> bool {
    matches!(
        word,
        "find" | "show" | "search" | "list" | "locate" | "file" | "files" | "named" | "called"
    )
}
