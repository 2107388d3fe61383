use criterion::{criterion_group, criterion_main, Criterion};
use seekr_core::tokenizer::tokenize;

const TEXT: &str = "Quarterly report draft for the finance team. Revenue grew in every \
region except the north, where the rollout of the new billing system slipped \
by two months. Action items: reconcile the ledger exports, archive last year's \
invoices, and prepare the summary slides before the board meeting on Friday.";

fn bench_tokenize(c: &mut Criterion) {
    let text = TEXT.repeat(64);
    c.bench_function("tokenize_report", |b| b.iter(|| tokenize(&text)));
}

criterion_group!(benches, bench_tokenize);
criterion_main!(benches);
