use criterion::{black_box, criterion_group, criterion_main, Criterion};

use pagemigrate::format::reformat;
use pagemigrate::model::ConversionReport;
use pagemigrate::platform::{MemoryContentStore, PollStability};
use pagemigrate::{Incoming, MergePlanner, MergePolicy, MigrationConfig, PageExtractor, PageRecord, TargetDocument};

fn record(id: String, key: String) -> PageRecord {
    PageRecord {
        content: format!("<p>{}</p>", id),
        title: id.clone(),
        id,
        boundary_key: key,
        key_message: None,
        sub_message: None,
        ordinal_hint: 0,
        section_id: None,
        extracted_at: None,
        conversion: ConversionReport::default(),
    }
}

fn sample_document(pages: usize) -> String {
    (0..pages)
        .map(|n| {
            format!(
                "<div data-page-container=\"{n}\"><h2>Page {n}</h2><div class=\"key-message-container\">\
                 <p class=\"key-message-title\">Message {n}</p></div><p>Body <b>{n}</b></p>\
                 <ul><li>a</li><li>b</li></ul><table><tr><td>1</td><td>2</td></tr></table>\
                 <span class=\"container-page-number\">{n}</span></div>"
            )
        })
        .collect()
}

fn bench_reformat(c: &mut Criterion) {
    let markup = sample_document(50);
    c.bench_function("reformat_50_pages", |b| b.iter(|| reformat(black_box(&markup))));
}

fn bench_plan_append(c: &mut Criterion) {
    let mut existing = TargetDocument::new("t", "Bench");
    existing.set_section(
        "s",
        (0..200).map(|n| record(format!("e{}", n), n.to_string())).collect(),
    );
    let incoming: Vec<PageRecord> = (0..200).map(|n| record(format!("i{}", n), n.to_string())).collect();
    let planner = MergePlanner::new();

    c.bench_function("plan_append_200_into_200", |b| {
        b.iter(|| {
            let input = Incoming::Single { section: "s".to_string(), pages: incoming.clone() };
            planner.plan(Some(black_box(&existing)), input, MergePolicy::Append, None)
        })
    });
}

fn bench_extract(c: &mut Criterion) {
    let markup = sample_document(20);
    let config = MigrationConfig::default();
    let store = MemoryContentStore::new();
    let stability = PollStability::from_config(&config);
    let extractor = PageExtractor::new(&config, &store, &stability).expect("extractor");
    let runtime = tokio::runtime::Runtime::new().expect("runtime");

    c.bench_function("extract_20_static_pages", |b| {
        b.iter(|| runtime.block_on(extractor.extract_markup(black_box(&markup), "bench")))
    });
}

criterion_group!(benches, bench_reformat, bench_plan_append, bench_extract);
criterion_main!(benches);
