//! Listing source adapters, regex feature extraction and Vienna geodata.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;
use vrt_core::{CleanListing, RawListing};
use vrt_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "vrt-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Regex(#[from] regex::Error),
    #[error("invalid page url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub page: u32,
    pub url: String,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
}

/// A classifieds site that yields raw listing records page by page.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn page_url(&self, page: u32) -> String;

    async fn fetch_page(&self, http: &HttpFetcher, page: u32) -> Result<FetchedPage, AdapterError>;

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<RawListing>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct WillhabenAdapter {
    base_url: String,
}

impl WillhabenAdapter {
    pub const SOURCE_ID: &'static str = "willhaben";
    pub const DEFAULT_BASE_URL: &'static str =
        "https://www.willhaben.at/iad/immobilien/mietwohnungen/wien";

    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }
}

impl Default for WillhabenAdapter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE_URL)
    }
}

#[async_trait]
impl ListingSource for WillhabenAdapter {
    fn source_id(&self) -> &'static str {
        Self::SOURCE_ID
    }

    fn page_url(&self, page: u32) -> String {
        if page <= 1 {
            self.base_url.clone()
        } else {
            format!("{}?page={page}", self.base_url)
        }
    }

    async fn fetch_page(&self, http: &HttpFetcher, page: u32) -> Result<FetchedPage, AdapterError> {
        let url = self.page_url(page);
        let response = http.fetch_bytes(&url).await?;
        Ok(FetchedPage {
            page,
            url: response.final_url,
            html: String::from_utf8_lossy(&response.body).into_owned(),
            fetched_at: Utc::now(),
        })
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<RawListing>, AdapterError> {
        // Hrefs resolve against the page they were found on.
        let page_url = Url::parse(&page.url)?;
        let document = Html::parse_document(&page.html);
        let selector =
            Selector::parse("a[href*='/d/']").map_err(|e| AdapterError::Message(e.to_string()))?;

        let mut seen_links = HashSet::new();
        let mut listings = Vec::new();
        for anchor in document.select(&selector) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let link = match page_url.join(href.trim()) {
                Ok(url) => url.to_string(),
                Err(err) => {
                    debug!(href, error = %err, "skipping unresolvable link");
                    continue;
                }
            };
            if seen_links.contains(&link) {
                continue;
            }

            let raw_text = anchor
                .text()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" | ");
            // Ads without a price are navigation tiles, not listings.
            if !raw_text.contains('€') {
                continue;
            }

            seen_links.insert(link.clone());
            listings.push(RawListing {
                raw_text,
                link,
                page_found: page.page,
                scrape_timestamp: page.fetched_at,
            });
        }

        debug!(page = page.page, listings = listings.len(), "parsed listing page");
        Ok(listings)
    }
}

pub fn adapter_for_source(source_id: &str, base_url: &str) -> Option<Box<dyn ListingSource>> {
    match source_id {
        WillhabenAdapter::SOURCE_ID => Some(Box::new(WillhabenAdapter::new(base_url))),
        _ => None,
    }
}

/// Keyword lists for the boolean amenity flags, matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmenityRules {
    #[serde(default = "default_rules_version")]
    pub version: u32,
    #[serde(default)]
    pub outdoor: Vec<String>,
    #[serde(default)]
    pub neubau: Vec<String>,
    #[serde(default)]
    pub furnished: Vec<String>,
}

fn default_rules_version() -> u32 {
    1
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

impl Default for AmenityRules {
    fn default() -> Self {
        Self {
            version: 1,
            outdoor: words(&["balkon", "terrasse", "loggia", "garten"]),
            neubau: words(&["neubau", "erstbezug"]),
            furnished: words(&["möbliert", "moebliert", "furnished"]),
        }
    }
}

impl AmenityRules {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing amenity rules")
    }

    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no amenity rules file; using built-in keywords");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn lowercased(self) -> Self {
        let lower = |list: Vec<String>| list.into_iter().map(|w| w.to_lowercase()).collect();
        Self {
            version: self.version,
            outdoor: lower(self.outdoor),
            neubau: lower(self.neubau),
            furnished: lower(self.furnished),
        }
    }
}

fn mentions_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|n| !n.is_empty() && haystack.contains(n.as_str()))
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// `1.500,00` -> 1500.0; dots are thousands separators, the comma is decimal.
pub fn parse_german_amount(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_end_matches(['.', ',', '-']);
    let normalized = trimmed.replace('.', "").replace(',', ".");
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn is_vienna_district(code: u32) -> bool {
    (1010..=1230).contains(&code) && code % 10 == 0
}

/// Turns raw listing text into the structured clean-snapshot row.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    rules: AmenityRules,
    price_re: Regex,
    size_re: Regex,
    rooms_re: Regex,
    district_wien_re: Regex,
    district_any_re: Regex,
}

impl FeatureExtractor {
    pub fn new(rules: AmenityRules) -> Result<Self, AdapterError> {
        Ok(Self {
            rules: rules.lowercased(),
            price_re: Regex::new(r"€\s*([\d.,]+)")?,
            size_re: Regex::new(r"(\d+(?:[.,]\d+)?)\s*(?:m²|m2|qm)")?,
            rooms_re: Regex::new(r"(?i)(\d+)\s*-?\s*zimmer")?,
            district_wien_re: Regex::new(r"(?i)\b(1\d{2}0)\s*,?\s*wien")?,
            district_any_re: Regex::new(r"\b(1\d{2}0)\b")?,
        })
    }

    pub fn extract_price(&self, text: &str) -> Option<f64> {
        let caps = self.price_re.captures(text)?;
        parse_german_amount(&caps[1]).filter(|p| *p > 0.0)
    }

    pub fn extract_size(&self, text: &str) -> Option<f64> {
        let caps = self.size_re.captures(text)?;
        caps[1]
            .replace(',', ".")
            .parse::<f64>()
            .ok()
            .filter(|s| s.is_finite() && *s > 0.0)
    }

    pub fn extract_rooms(&self, text: &str) -> Option<u32> {
        let caps = self.rooms_re.captures(text)?;
        caps[1].parse().ok()
    }

    pub fn extract_district(&self, text: &str) -> Option<u32> {
        if let Some(code) = self
            .district_wien_re
            .captures_iter(text)
            .filter_map(|c| c[1].parse::<u32>().ok())
            .find(|code| is_vienna_district(*code))
        {
            return Some(code);
        }

        self.district_any_re
            .captures_iter(text)
            .filter_map(|caps| {
                let m = caps.get(1)?;
                // A bare four-digit number right after the euro sign is a price.
                if text[..m.start()].trim_end().ends_with('€') {
                    return None;
                }
                m.as_str().parse::<u32>().ok()
            })
            .find(|code| is_vienna_district(*code))
    }

    pub fn extract(&self, raw: &RawListing) -> CleanListing {
        let text = raw.raw_text.as_str();
        let lower = text.to_lowercase();
        let price = self.extract_price(text);
        let size = self.extract_size(text);
        let district = self.extract_district(text);

        CleanListing {
            link: raw.link.clone(),
            price,
            size,
            rooms: self.extract_rooms(text),
            district,
            has_outdoor: mentions_any(&lower, &self.rules.outdoor),
            is_neubau: mentions_any(&lower, &self.rules.neubau),
            is_furnished: mentions_any(&lower, &self.rules.furnished),
            price_per_m2: match (price, size) {
                (Some(p), Some(s)) if s > 0.0 => Some(round_to(p / s, 2)),
                _ => None,
            },
            dist_center: district
                .and_then(geo::distance_to_center_km)
                .map(|d| round_to(d, 3)),
            dist_ubahn: district
                .and_then(geo::nearest_ubahn)
                .map(|(_, d)| round_to(d, 3)),
            raw_text: raw.raw_text.clone(),
        }
    }

    pub fn clean_all(&self, raws: &[RawListing]) -> Vec<CleanListing> {
        raws.iter().map(|raw| self.extract(raw)).collect()
    }
}

/// District centroids, transit stations and great-circle distances for Vienna.
pub mod geo {
    pub const EARTH_RADIUS_KM: f64 = 6371.0;

    pub const STEPHANSPLATZ: (f64, f64) = (48.208_493, 16.373_118);

    pub const DISTRICT_CENTERS: &[(u32, f64, f64)] = &[
        (1010, 48.208174, 16.373819),
        (1020, 48.216667, 16.416667),
        (1030, 48.198611, 16.395833),
        (1040, 48.191667, 16.366667),
        (1050, 48.188889, 16.355556),
        (1060, 48.195000, 16.350000),
        (1070, 48.201389, 16.348611),
        (1080, 48.211111, 16.347222),
        (1090, 48.223611, 16.358333),
        (1100, 48.156111, 16.381389),
        (1110, 48.169167, 16.438333),
        (1120, 48.170000, 16.326389),
        (1130, 48.179167, 16.275278),
        (1140, 48.208611, 16.262500),
        (1150, 48.196667, 16.325556),
        (1160, 48.213333, 16.305556),
        (1170, 48.228889, 16.305556),
        (1180, 48.231944, 16.331667),
        (1190, 48.256111, 16.336111),
        (1200, 48.238889, 16.375556),
        (1210, 48.272778, 16.416944),
        (1220, 48.233333, 16.466667),
        (1230, 48.140278, 16.291111),
    ];

    pub const UBAHN_STATIONS: &[(&str, f64, f64)] = &[
        ("Stephansplatz", 48.208_493, 16.373_118),
        ("Karlsplatz", 48.200_600, 16.369_600),
        ("Schwedenplatz", 48.211_800, 16.377_900),
        ("Praterstern", 48.218_500, 16.392_400),
        ("Landstraße", 48.206_400, 16.384_800),
        ("Schottentor", 48.214_900, 16.362_300),
        ("Volkstheater", 48.205_600, 16.358_700),
        ("Westbahnhof", 48.196_600, 16.338_000),
        ("Längenfeldgasse", 48.184_700, 16.335_400),
        ("Meidling Hauptstraße", 48.183_600, 16.327_900),
        ("Hütteldorf", 48.197_300, 16.261_200),
        ("Ottakring", 48.211_500, 16.311_000),
        ("Alser Straße", 48.216_900, 16.341_600),
        ("Spittelau", 48.235_200, 16.358_500),
        ("Heiligenstadt", 48.249_000, 16.365_700),
        ("Floridsdorf", 48.256_600, 16.400_200),
        ("Kagran", 48.243_100, 16.433_000),
        ("Stadion", 48.210_100, 16.420_600),
        ("Simmering", 48.170_000, 16.420_000),
        ("Reumannplatz", 48.175_000, 16.377_800),
        ("Oberlaa", 48.142_700, 16.400_100),
        ("Siebenhirten", 48.130_200, 16.310_400),
        ("Seestadt", 48.225_900, 16.506_800),
    ];

    pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
        let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
        let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
        let dlat = lat2 - lat1;
        let dlon = lon2 - lon1;
        let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
    }

    pub fn district_center(district: u32) -> Option<(f64, f64)> {
        DISTRICT_CENTERS
            .iter()
            .find(|(code, _, _)| *code == district)
            .map(|(_, lat, lon)| (*lat, *lon))
    }

    pub fn distance_to_center_km(district: u32) -> Option<f64> {
        district_center(district).map(|c| haversine_km(c, STEPHANSPLATZ))
    }

    pub fn nearest_ubahn(district: u32) -> Option<(&'static str, f64)> {
        let center = district_center(district)?;
        UBAHN_STATIONS
            .iter()
            .map(|(name, lat, lon)| (*name, haversine_km(center, (*lat, *lon))))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(AmenityRules::default()).expect("regexes compile")
    }

    fn raw(text: &str) -> RawListing {
        RawListing {
            raw_text: text.to_string(),
            link: "https://www.willhaben.at/iad/immobilien/d/mietwohnungen/wien/1-1/123456".into(),
            page_found: 1,
            scrape_timestamp: Utc.with_ymd_and_hms(2026, 1, 13, 8, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn extracts_structured_fields_from_listing_text() {
        let clean = extractor().extract(&raw(
            "Helle Altbauwohnung mit Balkon | 1070 Wien, Neubau | 65,5 m² | 2 Zimmer | € 1.310,00",
        ));

        assert_eq!(clean.price, Some(1310.0));
        assert_eq!(clean.size, Some(65.5));
        assert_eq!(clean.rooms, Some(2));
        assert_eq!(clean.district, Some(1070));
        assert!(clean.has_outdoor);
        assert!(clean.is_neubau);
        assert!(!clean.is_furnished);
        assert_eq!(clean.price_per_m2, Some(20.0));
        assert!(clean.dist_center.unwrap() > 1.0 && clean.dist_center.unwrap() < 3.0);
        assert!(clean.dist_ubahn.unwrap() < 1.5);
    }

    #[test]
    fn missing_fields_stay_empty() {
        let clean = extractor().extract(&raw("Schöne Wohnung, Preis auf Anfrage"));
        assert_eq!(clean.price, None);
        assert_eq!(clean.size, None);
        assert_eq!(clean.rooms, None);
        assert_eq!(clean.district, None);
        assert_eq!(clean.price_per_m2, None);
        assert_eq!(clean.dist_center, None);
    }

    #[test]
    fn german_amounts_parse() {
        assert_eq!(parse_german_amount("1.500,00"), Some(1500.0));
        assert_eq!(parse_german_amount("850"), Some(850.0));
        assert_eq!(parse_german_amount("1.200,-"), Some(1200.0));
        assert_eq!(parse_german_amount("2.345,67"), Some(2345.67));
        assert_eq!(parse_german_amount(",,"), None);
    }

    #[test]
    fn district_fallback_skips_prices() {
        let ex = extractor();
        assert_eq!(ex.extract_district("Wohnung | € 1200 | 1100 Favoriten"), Some(1100));
        assert_eq!(ex.extract_district("€ 1100 inkl. BK"), None);
        assert_eq!(ex.extract_district("Top 1250 Lage"), None);
    }

    #[test]
    fn furnished_keyword_is_case_insensitive() {
        let clean = extractor().extract(&raw("MÖBLIERT | 1020 Wien | 40 m² | 1 Zimmer | € 900"));
        assert!(clean.is_furnished);
        assert_eq!(clean.rooms, Some(1));
    }

    #[test]
    fn rules_load_from_yaml() {
        let rules = AmenityRules::from_yaml_str(
            "version: 2\noutdoor: [Dachterrasse]\nneubau: []\nfurnished: [teilmöbliert]\n",
        )
        .expect("yaml");
        assert_eq!(rules.version, 2);
        let ex = FeatureExtractor::new(rules).unwrap();
        let clean = ex.extract(&raw("Dachterrasse, Neubau, teilmöbliert | 1030 Wien | € 1.000"));
        assert!(clean.has_outdoor);
        assert!(!clean.is_neubau);
        assert!(clean.is_furnished);
    }

    #[test]
    fn rules_fall_back_to_defaults_when_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let missing = AmenityRules::load_or_default(&dir.path().join("amenities.yaml")).unwrap();
        assert_eq!(missing, AmenityRules::default());

        let path = dir.path().join("custom.yaml");
        std::fs::write(&path, "outdoor: [wintergarten]\n").unwrap();
        let custom = AmenityRules::load_or_default(&path).unwrap();
        assert_eq!(custom.outdoor, vec!["wintergarten".to_string()]);
        assert!(custom.neubau.is_empty());
    }

    #[test]
    fn parse_page_keeps_priced_unique_listings() {
        let adapter = WillhabenAdapter::default();
        let page = FetchedPage {
            page: 3,
            url: adapter.page_url(3),
            html: r#"<html><body>
                <a href="/iad/immobilien/d/mietwohnungen/wien/wien-1030-landstrasse/altbau-1001/">
                  <h3>Altbau</h3><span>1030 Wien</span><span>70 m²</span><span>€ 1.250</span>
                </a>
                <a href="/iad/immobilien/d/mietwohnungen/wien/wien-1030-landstrasse/altbau-1001/">€ 1.250</a>
                <a href="/iad/immobilien/d/mietwohnungen/merkliste/">Merkliste</a>
                <a href="/iad/kaufen">€ Kaufen</a>
            </body></html>"#
                .to_string(),
            fetched_at: Utc.with_ymd_and_hms(2026, 1, 13, 8, 0, 0).single().unwrap(),
        };

        let listings = adapter.parse_page(&page).expect("parse");
        assert_eq!(listings.len(), 1);
        assert_eq!(
            listings[0].link,
            "https://www.willhaben.at/iad/immobilien/d/mietwohnungen/wien/wien-1030-landstrasse/altbau-1001/"
        );
        assert_eq!(listings[0].raw_text, "Altbau | 1030 Wien | 70 m² | € 1.250");
        assert_eq!(listings[0].page_found, 3);
    }

    #[test]
    fn links_resolve_against_the_page_url() {
        let adapter = WillhabenAdapter::default();
        let page = FetchedPage {
            page: 1,
            url: "http://www.willhaben.at/iad/immobilien/mietwohnungen/wien".to_string(),
            html: r#"<html><body>
                <a href="./d/relative-1/">€ 900</a>
                <a href="//cdn.willhaben.at/iad/d/proto-relative-2/">€ 950</a>
                <a href="https://www.willhaben.at/iad/immobilien/d/absolute-3/">€ 990</a>
            </body></html>"#
                .to_string(),
            fetched_at: Utc.with_ymd_and_hms(2026, 1, 13, 8, 0, 0).single().unwrap(),
        };

        let links: Vec<String> = adapter
            .parse_page(&page)
            .expect("parse")
            .into_iter()
            .map(|l| l.link)
            .collect();
        assert_eq!(
            links,
            vec![
                "http://www.willhaben.at/iad/immobilien/mietwohnungen/d/relative-1/",
                "http://cdn.willhaben.at/iad/d/proto-relative-2/",
                "https://www.willhaben.at/iad/immobilien/d/absolute-3/",
            ]
        );
    }

    #[test]
    fn unparseable_page_url_is_an_error() {
        let page = FetchedPage {
            page: 1,
            url: "not a url".to_string(),
            html: String::new(),
            fetched_at: Utc.with_ymd_and_hms(2026, 1, 13, 8, 0, 0).single().unwrap(),
        };
        assert!(matches!(
            WillhabenAdapter::default().parse_page(&page),
            Err(AdapterError::Url(_))
        ));
    }

    #[test]
    fn page_urls_follow_pagination() {
        let adapter = WillhabenAdapter::new("https://example.test/rent/wien/");
        assert_eq!(adapter.page_url(1), "https://example.test/rent/wien");
        assert_eq!(adapter.page_url(4), "https://example.test/rent/wien?page=4");
        assert!(adapter_for_source("willhaben", WillhabenAdapter::DEFAULT_BASE_URL).is_some());
        assert!(adapter_for_source("immoscout", "https://example.test").is_none());
    }

    #[test]
    fn geo_distances_are_plausible() {
        assert!(geo::haversine_km(geo::STEPHANSPLATZ, geo::STEPHANSPLATZ) < 1e-9);
        assert!(geo::distance_to_center_km(1010).unwrap() < 0.2);
        assert!(geo::distance_to_center_km(1220).unwrap() > 5.0);
        let (station, km) = geo::nearest_ubahn(1010).unwrap();
        assert_eq!(station, "Stephansplatz");
        assert!(km < 0.2);
        assert!(geo::district_center(1240).is_none());
    }
}
