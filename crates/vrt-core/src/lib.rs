//! Core listing model, history table and fingerprinting for the Vienna rent tracker.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "vrt-core";

/// Hex characters kept from the SHA-256 digest (64 bits).
pub const FINGERPRINT_LEN: usize = 16;

const FINGERPRINT_VERSION: &str = "v1";
const SENTINEL: &str = "NA";

pub const RAW_COLUMNS: &[&str] = &["raw_text", "link", "page_found", "scrape_timestamp"];

pub const CLEAN_COLUMNS: &[&str] = &[
    "link",
    "price",
    "size",
    "rooms",
    "district",
    "has_outdoor",
    "is_neubau",
    "is_furnished",
    "price_per_m2",
    "dist_center",
    "dist_ubahn",
    "raw_text",
];

/// Columns a daily clean snapshot must carry before it may touch the history.
pub const REQUIRED_SNAPSHOT_COLUMNS: &[&str] = &[
    "link",
    "price",
    "size",
    "rooms",
    "district",
    "has_outdoor",
    "is_neubau",
    "is_furnished",
    "dist_center",
    "dist_ubahn",
];

pub const HISTORY_COLUMNS: &[&str] = &[
    "fingerprint",
    "low_confidence",
    "snapshot_date",
    "status",
    "price_delta",
    "first_seen",
    "days_on_market",
    "link",
    "price",
    "size",
    "rooms",
    "district",
    "has_outdoor",
    "is_neubau",
    "is_furnished",
    "price_per_m2",
    "dist_center",
    "dist_ubahn",
    "raw_text",
];

/// One scraped item exactly as the record source captured it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub raw_text: String,
    pub link: String,
    pub page_found: u32,
    pub scrape_timestamp: DateTime<Utc>,
}

/// Feature-extractor output: one row of the daily clean snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanListing {
    pub link: String,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_positive")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_positive")]
    pub size: Option<f64>,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_count")]
    pub rooms: Option<u32>,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_count")]
    pub district: Option<u32>,
    #[serde(
        default,
        serialize_with = "lenient::serialize_flag",
        deserialize_with = "lenient::deserialize_flag"
    )]
    pub has_outdoor: bool,
    #[serde(
        default,
        serialize_with = "lenient::serialize_flag",
        deserialize_with = "lenient::deserialize_flag"
    )]
    pub is_neubau: bool,
    #[serde(
        default,
        serialize_with = "lenient::serialize_flag",
        deserialize_with = "lenient::deserialize_flag"
    )]
    pub is_furnished: bool,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_number")]
    pub price_per_m2: Option<f64>,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_number")]
    pub dist_center: Option<f64>,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_number")]
    pub dist_ubahn: Option<f64>,
    #[serde(default)]
    pub raw_text: String,
}

impl CleanListing {
    pub fn amenities(&self) -> (bool, bool, bool) {
        (self.has_outdoor, self.is_neubau, self.is_furnished)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    New,
    Recurring,
    Changed,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Recurring => "recurring",
            Self::Changed => "changed",
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation of one property on one snapshot date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub fingerprint: String,
    #[serde(
        serialize_with = "lenient::serialize_flag",
        deserialize_with = "lenient::deserialize_flag"
    )]
    pub low_confidence: bool,
    pub snapshot_date: NaiveDate,
    pub status: ListingStatus,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_number")]
    pub price_delta: Option<f64>,
    pub first_seen: NaiveDate,
    pub days_on_market: i64,
    pub link: String,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_number")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_number")]
    pub size: Option<f64>,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_count")]
    pub rooms: Option<u32>,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_count")]
    pub district: Option<u32>,
    #[serde(
        serialize_with = "lenient::serialize_flag",
        deserialize_with = "lenient::deserialize_flag"
    )]
    pub has_outdoor: bool,
    #[serde(
        serialize_with = "lenient::serialize_flag",
        deserialize_with = "lenient::deserialize_flag"
    )]
    pub is_neubau: bool,
    #[serde(
        serialize_with = "lenient::serialize_flag",
        deserialize_with = "lenient::deserialize_flag"
    )]
    pub is_furnished: bool,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_number")]
    pub price_per_m2: Option<f64>,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_number")]
    pub dist_center: Option<f64>,
    #[serde(default, deserialize_with = "lenient::deserialize_opt_number")]
    pub dist_ubahn: Option<f64>,
    #[serde(default)]
    pub raw_text: String,
}

impl HistoryRow {
    pub fn observe(
        listing: &CleanListing,
        fingerprint: &Fingerprint,
        snapshot_date: NaiveDate,
        status: ListingStatus,
        price_delta: Option<f64>,
        first_seen: NaiveDate,
    ) -> Self {
        Self {
            fingerprint: fingerprint.value.clone(),
            low_confidence: fingerprint.low_confidence,
            snapshot_date,
            status,
            price_delta,
            first_seen,
            days_on_market: (snapshot_date - first_seen).num_days(),
            link: listing.link.clone(),
            price: listing.price,
            size: listing.size,
            rooms: listing.rooms,
            district: listing.district,
            has_outdoor: listing.has_outdoor,
            is_neubau: listing.is_neubau,
            is_furnished: listing.is_furnished,
            price_per_m2: listing.price_per_m2,
            dist_center: listing.dist_center,
            dist_ubahn: listing.dist_ubahn,
            raw_text: listing.raw_text.clone(),
        }
    }

    pub fn amenities(&self) -> (bool, bool, bool) {
        (self.has_outdoor, self.is_neubau, self.is_furnished)
    }
}

/// Append-only collection of every observation ever merged.
///
/// Rows can only be added through [`HistoryTable::replace_snapshot`], which
/// swaps out the rows of exactly one snapshot date and appends the new batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryTable {
    rows: Vec<HistoryRow>,
}

impl HistoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<HistoryRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[HistoryRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn distinct_fingerprints(&self) -> usize {
        self.rows
            .iter()
            .map(|r| r.fingerprint.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn snapshot_dates(&self) -> BTreeSet<NaiveDate> {
        self.rows.iter().map(|r| r.snapshot_date).collect()
    }

    pub fn latest_snapshot_date(&self) -> Option<NaiveDate> {
        self.rows.iter().map(|r| r.snapshot_date).max()
    }

    pub fn rows_on(&self, date: NaiveDate) -> impl Iterator<Item = &HistoryRow> {
        self.rows.iter().filter(move |r| r.snapshot_date == date)
    }

    /// Drop any rows previously recorded for `date`, then append `batch`.
    /// Returns how many rows were replaced.
    pub fn replace_snapshot(&mut self, date: NaiveDate, batch: Vec<HistoryRow>) -> usize {
        let before = self.rows.len();
        self.rows.retain(|r| r.snapshot_date != date);
        let replaced = before - self.rows.len();
        self.rows
            .extend(batch.into_iter().filter(|r| r.snapshot_date == date));
        replaced
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintScheme {
    /// District, size and rooms identify the property; price is tracked.
    #[default]
    Physical,
    /// District, size, rooms and price all identify the property.
    Strict,
}

impl FromStr for FingerprintScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "physical" => Ok(Self::Physical),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown fingerprint scheme {other:?}")),
        }
    }
}

/// The attributes a fingerprint is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ListingKey {
    pub district: Option<u32>,
    pub size: Option<f64>,
    pub rooms: Option<u32>,
    pub price: Option<f64>,
}

impl From<&CleanListing> for ListingKey {
    fn from(listing: &CleanListing) -> Self {
        Self {
            district: listing.district,
            size: listing.size,
            rooms: listing.rooms,
            price: listing.price,
        }
    }
}

impl ListingKey {
    /// Every field the scheme hashes is present. Price only counts under `Strict`.
    pub fn is_complete(&self, scheme: FingerprintScheme) -> bool {
        let physical = self.district.is_some() && finite(self.size).is_some() && self.rooms.is_some();
        match scheme {
            FingerprintScheme::Physical => physical,
            FingerprintScheme::Strict => physical && finite(self.price).is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub value: String,
    pub low_confidence: bool,
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

fn render_or_sentinel<T>(value: Option<T>, render: impl Fn(T) -> String) -> String {
    value.map(render).unwrap_or_else(|| SENTINEL.to_string())
}

/// Canonical text the fingerprint digest is computed over.
pub fn canonical_fingerprint_input(key: &ListingKey, scheme: FingerprintScheme, link: &str) -> String {
    canonical_input(key, scheme, link, !key.is_complete(scheme))
}

fn canonical_input(key: &ListingKey, scheme: FingerprintScheme, link: &str, salted: bool) -> String {
    let mut parts = vec![
        FINGERPRINT_VERSION.to_string(),
        format!("d={}", render_or_sentinel(key.district, |d| d.to_string())),
        format!("s={}", render_or_sentinel(finite(key.size), |s| format!("{s:.1}"))),
        format!("r={}", render_or_sentinel(key.rooms, |r| r.to_string())),
    ];
    if scheme == FingerprintScheme::Strict {
        parts.push(format!(
            "p={}",
            render_or_sentinel(finite(key.price), |p| format!("{p:.2}"))
        ));
    }
    if salted {
        parts.push(format!("link={}", link.trim()));
    }
    parts.join("|")
}

fn digest(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let mut value = hex::encode(hasher.finalize());
    value.truncate(FINGERPRINT_LEN);
    value
}

/// Deterministic, fixed-length identifier for "the same physical property".
///
/// Keys missing a hashed field are pinned to their posting link, so two
/// sparse listings never share an id.
pub fn fingerprint(key: &ListingKey, scheme: FingerprintScheme, link: &str) -> Fingerprint {
    let low_confidence = !key.is_complete(scheme);
    Fingerprint {
        value: digest(&canonical_input(key, scheme, link, low_confidence)),
        low_confidence,
    }
}

/// Link-pinned fingerprint for a listing that shares its key with a
/// different unit seen on the same day.
pub fn salted_fingerprint(key: &ListingKey, scheme: FingerprintScheme, link: &str) -> Fingerprint {
    Fingerprint {
        value: digest(&canonical_input(key, scheme, link, true)),
        low_confidence: true,
    }
}

/// Serde helpers for the loosely typed CSV files pandas-era tooling produced.
pub mod lenient {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    fn blank(raw: &str) -> bool {
        let raw = raw.trim();
        raw.is_empty() || raw.eq_ignore_ascii_case("nan") || raw.eq_ignore_ascii_case("none")
    }

    pub fn deserialize_opt_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        let Some(raw) = raw.filter(|r| !blank(r)) else {
            return Ok(None);
        };
        let value: f64 = raw
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid number {raw:?}")))?;
        if !value.is_finite() {
            return Err(D::Error::custom(format!("non-finite number {raw:?}")));
        }
        Ok(Some(value))
    }

    /// Like [`deserialize_opt_number`], but zero and negative values are rejected.
    pub fn deserialize_opt_positive<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match deserialize_opt_number(deserializer)? {
            Some(value) if value <= 0.0 => Err(D::Error::custom(format!("expected a positive number, got {value}"))),
            other => Ok(other),
        }
    }

    /// Accepts `2`, `2.0` and blanks.
    pub fn deserialize_opt_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(value) = deserialize_opt_number(deserializer)? else {
            return Ok(None);
        };
        if value < 0.0 || value.fract() != 0.0 || value > f64::from(u32::MAX) {
            return Err(D::Error::custom(format!("invalid count {value}")));
        }
        Ok(Some(value as u32))
    }

    pub fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        let raw = raw.unwrap_or_default();
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "0.0" | "false" | "no" => Ok(false),
            "1" | "1.0" | "true" | "yes" => Ok(true),
            other => Err(D::Error::custom(format!("invalid flag {other:?}"))),
        }
    }

    pub fn serialize_flag<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(u8::from(*value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(district: Option<u32>, size: Option<f64>, rooms: Option<u32>, price: Option<f64>) -> ListingKey {
        ListingKey {
            district,
            size,
            rooms,
            price,
        }
    }

    fn listing(link: &str, price: f64) -> CleanListing {
        CleanListing {
            link: link.to_string(),
            price: Some(price),
            size: Some(60.0),
            rooms: Some(2),
            district: Some(1010),
            has_outdoor: false,
            is_neubau: false,
            is_furnished: false,
            price_per_m2: Some(price / 60.0),
            dist_center: Some(0.1),
            dist_ubahn: Some(0.2),
            raw_text: String::new(),
        }
    }

    #[test]
    fn fingerprint_is_pinned_across_runs() {
        let k = key(Some(1010), Some(60.0), Some(2), Some(1200.0));
        let physical = fingerprint(&k, FingerprintScheme::Physical, "https://example.test/d/a/1");
        let strict = fingerprint(&k, FingerprintScheme::Strict, "https://example.test/d/a/1");

        assert_eq!(physical.value, "3e0e0aaf6b3d15d7");
        assert_eq!(strict.value, "4869ad3aff01e7ef");
        assert!(!physical.low_confidence);
        assert_eq!(physical.value.len(), FINGERPRINT_LEN);
    }

    #[test]
    fn fingerprint_ignores_link_when_key_is_complete() {
        let k = key(Some(1010), Some(60.0), Some(2), Some(1200.0));
        let a = fingerprint(&k, FingerprintScheme::Physical, "https://example.test/d/a/1");
        let b = fingerprint(&k, FingerprintScheme::Physical, "https://example.test/d/a/2");
        assert_eq!(a, b);
    }

    #[test]
    fn physical_scheme_tracks_price_strict_scheme_hashes_it() {
        let a = key(Some(1010), Some(60.0), Some(2), Some(1200.0));
        let b = key(Some(1010), Some(60.0), Some(2), Some(1250.0));
        assert_eq!(
            fingerprint(&a, FingerprintScheme::Physical, "x"),
            fingerprint(&b, FingerprintScheme::Physical, "x")
        );
        assert_ne!(
            fingerprint(&a, FingerprintScheme::Strict, "x"),
            fingerprint(&b, FingerprintScheme::Strict, "x")
        );
    }

    #[test]
    fn missing_fields_use_sentinel_and_stay_apart() {
        let k = key(None, Some(60.0), Some(2), None);
        assert_eq!(
            canonical_fingerprint_input(&k, FingerprintScheme::Physical, "https://example.test/d/a/1"),
            "v1|d=NA|s=60.0|r=2|link=https://example.test/d/a/1"
        );

        let a = fingerprint(&k, FingerprintScheme::Physical, "https://example.test/d/a/1");
        let again = fingerprint(&k, FingerprintScheme::Physical, "https://example.test/d/a/1");
        let other = fingerprint(&k, FingerprintScheme::Physical, "https://example.test/d/b/2");

        assert!(a.low_confidence);
        assert_eq!(a.value, "8c322c748860de80");
        assert_eq!(a, again);
        assert_ne!(a.value, other.value);
    }

    #[test]
    fn missing_price_only_salts_the_strict_scheme() {
        let k = key(Some(1010), Some(60.0), Some(2), None);
        let physical = fingerprint(&k, FingerprintScheme::Physical, "https://example.test/d/a/1");
        assert!(!physical.low_confidence);
        assert_eq!(physical.value, "3e0e0aaf6b3d15d7");

        let strict = fingerprint(&k, FingerprintScheme::Strict, "https://example.test/d/a/1");
        assert!(strict.low_confidence);
        assert!(canonical_fingerprint_input(&k, FingerprintScheme::Strict, "https://example.test/d/a/1")
            .ends_with("|p=NA|link=https://example.test/d/a/1"));
    }

    #[test]
    fn salted_fingerprint_separates_complete_keys_by_link() {
        let k = key(Some(1100), Some(60.0), Some(2), Some(900.0));
        let plain = fingerprint(&k, FingerprintScheme::Physical, "https://example.test/d/b/2");
        let a = salted_fingerprint(&k, FingerprintScheme::Physical, "https://example.test/d/b/2");
        let b = salted_fingerprint(&k, FingerprintScheme::Physical, "https://example.test/d/c/3");

        assert!(a.low_confidence);
        assert_ne!(a.value, plain.value);
        assert_ne!(a.value, b.value);
        assert_eq!(a, salted_fingerprint(&k, FingerprintScheme::Physical, "https://example.test/d/b/2"));
    }

    #[test]
    fn nan_is_treated_as_missing() {
        let k = key(Some(1010), Some(f64::NAN), Some(2), Some(1200.0));
        let fp = fingerprint(&k, FingerprintScheme::Physical, "l");
        assert!(fp.low_confidence);
        assert!(canonical_fingerprint_input(&k, FingerprintScheme::Physical, "l").contains("s=NA"));
    }

    #[test]
    fn replace_snapshot_only_touches_one_date() {
        let d1 = NaiveDate::from_ymd_opt(2026, 1, 13).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2026, 1, 14).unwrap();
        let l = listing("https://example.test/d/a/1", 1200.0);
        let fp = fingerprint(&ListingKey::from(&l), FingerprintScheme::Physical, &l.link);

        let mut table = HistoryTable::new();
        table.replace_snapshot(d1, vec![HistoryRow::observe(&l, &fp, d1, ListingStatus::New, None, d1)]);
        let replaced = table.replace_snapshot(
            d2,
            vec![HistoryRow::observe(&l, &fp, d2, ListingStatus::Recurring, None, d1)],
        );
        assert_eq!(replaced, 0);

        let replaced = table.replace_snapshot(
            d2,
            vec![HistoryRow::observe(&l, &fp, d2, ListingStatus::Recurring, None, d1)],
        );
        assert_eq!(replaced, 1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows_on(d1).count(), 1);
        assert_eq!(table.rows()[1].days_on_market, 1);
        assert_eq!(table.distinct_fingerprints(), 1);
        assert_eq!(table.latest_snapshot_date(), Some(d2));
    }

    #[test]
    fn scheme_parses_case_insensitively() {
        assert_eq!("Strict".parse::<FingerprintScheme>(), Ok(FingerprintScheme::Strict));
        assert!("fuzzy".parse::<FingerprintScheme>().is_err());
    }
}
