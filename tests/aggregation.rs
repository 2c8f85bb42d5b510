//! Section aggregation through isolated contexts

mod common;

use std::sync::atomic::Ordering;
use std::sync::Once;
use std::time::Duration;

use common::{ScriptedProvider, SectionScript};
use pagemigrate::platform::{HttpContextProvider, MemoryContentStore, PollStability};
use pagemigrate::{MigrationConfig, PageExtractor, SectionAggregator, SectionDescriptor};
use tiny_http::{Response, Server};
use url::Url;

const MARKET: &str = r#"<div data-page-container="1"><h2>Market size</h2><p>Large</p></div>"#;
const PRODUCT: &str = r#"<div data-page-container="2"><h2>Roadmap</h2></div><div data-page-container="0"><h1>Product</h1></div>"#;

fn sections() -> Vec<SectionDescriptor> {
    vec![
        SectionDescriptor::new("market", "market"),
        SectionDescriptor::new("risk", "risk").with_label("Risk analysis"),
        SectionDescriptor::new("product", "product"),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_section_is_omitted() {
    let provider = ScriptedProvider::new()
        .section("/plan/market", SectionScript::Loads(MARKET.into()))
        .section("/plan/risk", SectionScript::Hangs)
        .section("/plan/product", SectionScript::Loads(PRODUCT.into()));

    let config = MigrationConfig::default();
    let store = MemoryContentStore::new();
    let stability = PollStability::from_config(&config);
    let extractor = PageExtractor::new(&config, &store, &stability).unwrap();
    let aggregator = SectionAggregator::new(&config, &provider, &stability);
    let base = Url::parse("http://plans.test/plan/").unwrap();

    let start = tokio::time::Instant::now();
    let mut seen = Vec::new();
    let aggregation = aggregator
        .aggregate_with_progress(&extractor, &sections(), &base, "ns", |done, section| {
            seen.push((done, section.id.clone()));
        })
        .await;
    assert!(start.elapsed() >= Duration::from_millis(config.section_load_timeout_ms));

    let keys: Vec<&str> = aggregation.pages.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["market", "product"]);
    assert!(!aggregation.pages.contains_key("risk"));
    assert_eq!(aggregation.failures.len(), 1);
    assert_eq!(aggregation.failures[0].section, "risk");
    assert!(aggregation.failures[0].timed_out);

    assert_eq!(aggregation.pages["product"][0].boundary_key, "0");
    assert!(aggregation.pages["product"]
        .iter()
        .all(|p| p.section_id.as_deref() == Some("product")));

    assert_eq!(
        seen,
        vec![(1, "market".to_string()), (2, "risk".to_string()), (3, "product".to_string())]
    );
    assert_eq!(provider.created.load(Ordering::SeqCst), 3);
    assert_eq!(provider.destroyed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_failed_load_is_recorded_and_destroyed() {
    let provider = ScriptedProvider::new()
        .section("/plan/market", SectionScript::Fails)
        .section("/plan/risk", SectionScript::Loads("<p>no containers</p>".into()))
        .section("/plan/product", SectionScript::Loads(PRODUCT.into()));

    let config = MigrationConfig::default();
    let store = MemoryContentStore::new();
    let stability = PollStability::from_config(&config);
    let extractor = PageExtractor::new(&config, &store, &stability).unwrap();
    let aggregator = SectionAggregator::new(&config, &provider, &stability);
    let base = Url::parse("http://plans.test/plan/").unwrap();

    let aggregation = aggregator.aggregate_all(&extractor, &sections(), &base, "ns").await;
    assert_eq!(aggregation.pages.len(), 1);
    assert_eq!(aggregation.page_count(), 2);
    assert_eq!(aggregation.failures.len(), 1);
    assert!(!aggregation.failures[0].timed_out);
    assert!(aggregation.failures[0].message.contains("refused"));
    assert_eq!(provider.destroyed.load(Ordering::SeqCst), 3);
    assert_eq!(
        *provider.opened.lock().unwrap(),
        vec!["/plan/market", "/plan/risk", "/plan/product"]
    );
}

static INIT: Once = Once::new();

/// Serve rendered section markup on a local port
fn start_test_server() -> String {
    INIT.call_once(|| {
        std::thread::spawn(|| {
            let server = Server::http("127.0.0.1:18090").unwrap();
            for request in server.incoming_requests() {
                let html = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..]).unwrap();
                let response = match request.url() {
                    "/plan/market" => Response::from_string(format!("<html><body>{}</body></html>", MARKET)).with_header(html),
                    "/plan/product" => Response::from_string(format!("<html><body>{}</body></html>", PRODUCT)).with_header(html),
                    _ => Response::from_string("Not Found").with_status_code(404),
                };
                let _ = request.respond(response);
            }
        });
        std::thread::sleep(Duration::from_millis(100));
    });

    "http://127.0.0.1:18090/plan/".to_string()
}

#[tokio::test]
async fn test_http_sections() {
    if std::env::var("CI").is_ok() {
        eprintln!("Skipping HTTP section test in CI");
        return;
    }
    let base = Url::parse(&start_test_server()).unwrap();

    let config = MigrationConfig::default();
    let provider = HttpContextProvider::new(&config).unwrap();
    let store = MemoryContentStore::new();
    let stability = PollStability::from_config(&config);
    let extractor = PageExtractor::new(&config, &store, &stability).unwrap();
    let aggregator = SectionAggregator::new(&config, &provider, &stability);

    let aggregation = aggregator.aggregate_all(&extractor, &sections(), &base, "ns").await;
    assert_eq!(aggregation.pages["market"][0].title, "Market size");
    assert_eq!(aggregation.pages["product"].len(), 2);
    assert_eq!(aggregation.failures.len(), 1);
    assert_eq!(aggregation.failures[0].section, "risk");
    assert!(aggregation.failures[0].message.contains("404"));
}
