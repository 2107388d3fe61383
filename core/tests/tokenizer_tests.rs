use seekr_core::tokenizer::{normalize, terms, tokenize};

#[test]
fn it_normalizes_and_stems() {
    let words = terms("Running Runners RUN! The café's menu.");
    assert!(words.contains(&"run".to_string()));
    // NFKC keeps the accent; only compatibility forms fold.
    assert!(words.iter().any(|w| w.starts_with("café")));
}

#[test]
fn it_filters_stopwords() {
    let words = terms("The quick brown fox and the lazy dog");
    assert!(!words.contains(&"the".to_string()));
    assert!(!words.contains(&"and".to_string()));
    assert!(words.contains(&"quick".to_string()));
}

#[test]
fn compatibility_forms_fold() {
    assert_eq!(normalize("ﬁle Ｒｅｐｏｒｔ"), "file report");
}

#[test]
fn file_names_split_on_punctuation() {
    let toks = tokenize("Q3_budget.final.xlsx");
    let words: Vec<&str> = toks.iter().map(|(w, _)| w.as_str()).collect();
    assert_eq!(words, vec!["q3", "budget", "final", "xlsx"]);
    let positions: Vec<usize> = toks.iter().map(|(_, p)| *p).collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);
}
