use std::path::{Path, PathBuf};
use std::time::Duration;

use dealwatch_adapters::{
    adapter_for_source, AdapterContext, AdapterVariant, SourceConfig, SourceMode,
};
use dealwatch_core::{CandidateDeal, ScanErrorKind};
use dealwatch_storage::{BatchFetcher, Fetcher, FixtureRetriever, HttpClientConfig, HttpFetcher};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixtures(site: &str) -> FixtureRetriever {
    let manifest = workspace_root().join("fixtures").join(site).join("manifest.json");
    FixtureRetriever::from_manifest(manifest).expect("fixture manifest")
}

fn config(source_id: &str, listing_url: &str, page_size: Option<usize>) -> SourceConfig {
    SourceConfig {
        source_id: source_id.into(),
        display_name: source_id.into(),
        enabled: true,
        profile: None,
        mode: SourceMode::Fixture,
        listing_url: listing_url.into(),
        filter: None,
        page_size,
        fixture_manifest: None,
        notes: None,
    }
}

fn details() -> BatchFetcher {
    BatchFetcher::new(Duration::from_secs(2)).with_inter_batch_delay(Duration::ZERO)
}

#[tokio::test]
async fn golden_snapshot_snapbuy_listing() {
    let retriever = fixtures("snapbuy");
    let adapter =
        adapter_for_source(&config("snapbuy", "https://snapbuy.test/deals", None)).unwrap();
    let ctx = AdapterContext::new(&retriever, CancellationToken::new(), details());

    let batch = adapter.list_candidates(&ctx, 40, None).await.unwrap();

    let snapshot = workspace_root().join("fixtures/snapbuy/snapshot.json");
    let text = std::fs::read_to_string(snapshot).expect("read snapshot");
    let expected: Vec<CandidateDeal> = serde_json::from_str(&text).expect("parse snapshot");
    assert_eq!(batch.candidates, expected);
    // the linkless card is the only soft error
    assert_eq!(batch.errors.len(), 1);
    assert_eq!(batch.errors[0].kind, ScanErrorKind::Parse);
    assert!(batch.next_cursor.is_none());
}

#[tokio::test]
async fn localfeast_details_fill_description_and_hires_image() {
    let retriever = fixtures("localfeast");
    let adapter =
        adapter_for_source(&config("localfeast", "https://localfeast.test/offers", None)).unwrap();
    assert_eq!(adapter.variant(), AdapterVariant::RenderedListWithDetail);
    let ctx = AdapterContext::new(&retriever, CancellationToken::new(), details());

    let batch = adapter.list_candidates(&ctx, 40, None).await.unwrap();
    assert_eq!(batch.candidates.len(), 3);

    let sushi = &batch.candidates[0];
    assert_eq!(sushi.source_url, "https://localfeast.test/offer/sushi-tei-omakase");
    assert_eq!(sushi.merchant_name, "Sushi Tei");
    assert_eq!(sushi.offer_price, Some(44.0));
    assert_eq!(sushi.original_price, Some(88.0));
    assert_eq!(sushi.discount_percent, Some(50.0));
    assert_eq!(sushi.units_sold, Some(1100));
    assert_eq!(sushi.image_url.as_deref(), Some("https://cdn.localfeast.test/sushi/hero-1600.jpg"));
    assert_eq!(
        sushi.description.as_deref(),
        Some("Omakase platter for two, including chawanmushi and green tea.")
    );

    let pad_thai = &batch.candidates[1];
    assert_eq!(pad_thai.title, "Pad Thai Set");
    assert_eq!(pad_thai.merchant_name, "Bangkok Jam (Plaza Singapura)");
    assert_eq!(pad_thai.units_sold, Some(86));
    assert_eq!(
        pad_thai.image_url.as_deref(),
        Some("https://localfeast.test/img/padthai-large.jpg")
    );
    assert_eq!(pad_thai.description.as_deref(), Some("Classic pad thai with iced lemon tea."));

    // no detail page captured for the third offer: listing fields survive
    let koi = &batch.candidates[2];
    assert_eq!(koi.merchant_name, "Koi Cafe");
    assert_eq!(koi.badge.as_deref(), Some("Limited"));
    assert_eq!(koi.description, None);
    assert_eq!(batch.errors.len(), 1);
    assert_eq!(batch.errors[0].kind, ScanErrorKind::HttpStatus);
    assert_eq!(batch.errors[0].reference.as_deref(), Some("https://localfeast.test/offer/koi"));
}

#[tokio::test]
async fn citydeals_fixture_pages_dedupe_and_filter_inactive() {
    let retriever = fixtures("citydeals");
    let endpoint = "https://api.citydeals.test/v1/deals";
    let adapter = adapter_for_source(&config("citydeals", endpoint, Some(4))).unwrap();
    let ctx = AdapterContext::new(&retriever, CancellationToken::new(), details());

    let batch = adapter.list_candidates(&ctx, 40, None).await.unwrap();
    let urls: Vec<&str> = batch.candidates.iter().map(|c| c.source_url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "https://citydeals.test/deals/101-marina-buffet",
            "https://citydeals.test/deals/103-sushi",
            "https://api.citydeals.test/deals/104-koi",
            "https://citydeals.test/deals/105-pad-thai",
        ]
    );
    let buffet = &batch.candidates[0];
    assert_eq!(buffet.merchant_name, "Marina Hotel");
    assert_eq!(buffet.discount_percent, Some(44.12));
    assert_eq!(buffet.units_sold, Some(1200));
    assert_eq!(buffet.description.as_deref(), Some("International buffet, weekdays 12pm to 3pm."));
    assert_eq!(batch.candidates[1].offer_price, Some(19.9));
    assert_eq!(batch.candidates[1].units_sold, Some(350));
    assert!(batch.errors.is_empty());
    assert!(batch.next_cursor.is_none());
}

#[tokio::test]
async fn structured_listing_over_http_pages_until_the_limit() {
    let server = MockServer::start().await;
    let root = workspace_root().join("fixtures/citydeals");
    for page in ["1", "2"] {
        let body = std::fs::read_to_string(root.join(format!("page-{page}.json"))).unwrap();
        Mock::given(method("GET"))
            .and(path("/v1/deals"))
            .and(query_param("page", page))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
    }

    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    let fetcher = Fetcher::new(http, Duration::from_secs(5), Duration::from_secs(5));
    let endpoint = format!("{}/v1/deals", server.uri());
    let adapter = adapter_for_source(&config("citydeals", &endpoint, Some(4))).unwrap();
    let ctx = AdapterContext::new(&fetcher, CancellationToken::new(), details());

    let first = adapter.list_candidates(&ctx, 2, None).await.unwrap();
    assert_eq!(first.candidates.len(), 2);
    let cursor = first.next_cursor.expect("limit reached before the end");
    assert_eq!(cursor.offset, 3);

    let rest = adapter.list_candidates(&ctx, 40, Some(&cursor)).await.unwrap();
    assert_eq!(rest.candidates.len(), 3);
    assert!(rest.next_cursor.is_none());
    // 101 reappears on page 2 but this chunk never saw it on page 1
    assert!(rest
        .candidates
        .iter()
        .any(|c| c.source_url == "https://citydeals.test/deals/101-marina-buffet"));
}

#[tokio::test]
async fn server_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/deals"))
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&server)
        .await;

    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    let fetcher = Fetcher::new(http, Duration::from_secs(5), Duration::from_secs(5));
    let endpoint = format!("{}/v1/deals", server.uri());
    let adapter = adapter_for_source(&config("citydeals", &endpoint, Some(4))).unwrap();
    let ctx = AdapterContext::new(&fetcher, CancellationToken::new(), details());

    let err = adapter.list_candidates(&ctx, 10, None).await.unwrap_err();
    assert_eq!(err.to_scan_error().kind, ScanErrorKind::HttpStatus);
}
