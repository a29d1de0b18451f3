use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use vrt_adapters::{AmenityRules, FeatureExtractor, FetchedPage, ListingSource, WillhabenAdapter};

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fixture_page() -> FetchedPage {
    let html = std::fs::read_to_string(workspace_root().join("fixtures/willhaben/sample/listing.html"))
        .expect("fixture html");
    FetchedPage {
        page: 1,
        url: WillhabenAdapter::DEFAULT_BASE_URL.to_string(),
        html,
        fetched_at: Utc.with_ymd_and_hms(2026, 1, 13, 7, 30, 0).single().unwrap(),
    }
}

#[test]
fn fixture_page_yields_priced_listings_once() {
    let adapter = WillhabenAdapter::default();
    let listings = adapter.parse_page(&fixture_page()).expect("parse fixture");

    assert_eq!(listings.len(), 3);
    assert!(listings
        .iter()
        .all(|l| l.link.starts_with("https://www.willhaben.at/iad/immobilien/d/")));
    assert!(listings.iter().all(|l| l.raw_text.contains('€')));
}

#[test]
fn fixture_listings_clean_into_features() {
    let adapter = WillhabenAdapter::default();
    let listings = adapter.parse_page(&fixture_page()).expect("parse fixture");
    let rules = AmenityRules::load_or_default(&workspace_root().join("rules/amenities.yaml"))
        .expect("rules");
    let extractor = FeatureExtractor::new(rules).expect("extractor");
    let clean = extractor.clean_all(&listings);

    assert_eq!(clean[0].district, Some(1010));
    assert_eq!(clean[0].size, Some(60.0));
    assert_eq!(clean[0].rooms, Some(2));
    assert_eq!(clean[0].price, Some(1200.0));
    assert!(clean[0].has_outdoor);

    assert_eq!(clean[1].district, Some(1100));
    assert_eq!(clean[1].size, Some(48.5));
    assert_eq!(clean[1].price, Some(895.5));
    assert!(clean[1].is_neubau);

    assert_eq!(clean[2].district, Some(1190));
    assert!(clean[2].is_furnished);
    assert_eq!(clean[2].rooms, Some(1));
}
