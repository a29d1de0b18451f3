//! History merge, reporting, Parquet export and the daily
//! scrape → clean → track → report pipeline for the Vienna rent tracker.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow_array::{BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{NaiveDate, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use strsim::jaro_winkler;
use tokio::fs;
use tracing::{info, info_span, warn};
use vrt_adapters::{adapter_for_source, AmenityRules, FeatureExtractor, ListingSource, WillhabenAdapter};
use vrt_core::{
    fingerprint, salted_fingerprint, CleanListing, Fingerprint, FingerprintScheme, HistoryRow, HistoryTable,
    ListingKey, ListingStatus, RawListing,
};
use vrt_storage::{
    read_clean_snapshot, read_raw_snapshot, sha256_hex, write_atomic, write_clean_snapshot, write_raw_snapshot,
    HistoryBackend, HistoryStore, HttpClientConfig, HttpFetcher, SnapshotInput, StoreError,
};

pub const CRATE_NAME: &str = "vrt-sync";

pub const RAW_SNAPSHOT_FILE: &str = "vienna_rent_raw.csv";
pub const CLEAN_SNAPSHOT_FILE: &str = "vienna_rent_clean.csv";
pub const HISTORY_FILE: &str = "vienna_rent_history.csv";

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub data_dir: PathBuf,
    pub history_path: PathBuf,
    pub reports_dir: PathBuf,
    pub rules_path: PathBuf,
    pub source_id: String,
    pub base_url: String,
    pub pages: u32,
    pub page_delay: Duration,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub merge: MergeConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::rooted_at(".")
    }
}

impl TrackerConfig {
    /// Default layout below `root`: `data/`, `reports/` and `rules/`.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let data_dir = root.join("data");
        Self {
            history_path: data_dir.join(HISTORY_FILE),
            data_dir,
            reports_dir: root.join("reports"),
            rules_path: root.join("rules").join("amenities.yaml"),
            source_id: WillhabenAdapter::SOURCE_ID.to_string(),
            base_url: WillhabenAdapter::DEFAULT_BASE_URL.to_string(),
            pages: 5,
            page_delay: Duration::from_millis(2000),
            user_agent: "vrt-bot/0.1".to_string(),
            http_timeout_secs: 20,
            merge: MergeConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let data_dir = env_path("VRT_DATA_DIR").unwrap_or(defaults.data_dir);
        let history_path = env_path("VRT_HISTORY_PATH").unwrap_or_else(|| data_dir.join(HISTORY_FILE));

        let scheme = match std::env::var("VRT_FINGERPRINT_SCHEME") {
            Ok(raw) => raw
                .parse::<FingerprintScheme>()
                .map_err(anyhow::Error::msg)
                .context("parsing VRT_FINGERPRINT_SCHEME")?,
            Err(_) => defaults.merge.scheme,
        };

        Ok(Self {
            data_dir,
            history_path,
            reports_dir: env_path("VRT_REPORTS_DIR").unwrap_or(defaults.reports_dir),
            rules_path: env_path("VRT_RULES_PATH").unwrap_or(defaults.rules_path),
            source_id: std::env::var("VRT_SOURCE").unwrap_or(defaults.source_id),
            base_url: std::env::var("VRT_BASE_URL").unwrap_or(defaults.base_url),
            pages: env_parse("VRT_PAGES").unwrap_or(defaults.pages),
            page_delay: env_parse("VRT_PAGE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.page_delay),
            user_agent: std::env::var("VRT_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("VRT_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            merge: MergeConfig {
                scheme,
                price_change_threshold: env_parse("VRT_PRICE_CHANGE_THRESHOLD")
                    .unwrap_or(defaults.merge.price_change_threshold),
                collision_review_threshold: env_parse("VRT_COLLISION_REVIEW_THRESHOLD")
                    .unwrap_or(defaults.merge.collision_review_threshold),
            },
        })
    }

    pub fn raw_snapshot_path(&self) -> PathBuf {
        self.data_dir.join(RAW_SNAPSHOT_FILE)
    }

    pub fn clean_snapshot_path(&self) -> PathBuf {
        self.data_dir.join(CLEAN_SNAPSHOT_FILE)
    }

    pub fn history_store(&self) -> HistoryStore {
        HistoryStore::new(&self.history_path)
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MergeConfig {
    pub scheme: FingerprintScheme,
    /// A price move counts as a change only when `|delta|` exceeds this.
    pub price_change_threshold: f64,
    /// Same-day collapses scoring below this are flagged for review.
    pub collision_review_threshold: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            scheme: FingerprintScheme::Physical,
            price_change_threshold: 0.0,
            collision_review_threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceChange {
    pub fingerprint: String,
    pub link: String,
    pub district: Option<u32>,
    pub previous_price: Option<f64>,
    pub price: Option<f64>,
    pub price_delta: Option<f64>,
    pub days_on_market: i64,
}

impl PriceChange {
    pub fn percent(&self) -> Option<f64> {
        match (self.price_delta, self.previous_price) {
            (Some(delta), Some(before)) if before != 0.0 => Some(delta / before * 100.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionResolution {
    /// Same offer posted twice; the later row was dropped.
    Collapsed,
    /// Different offer under the same key; both rows were kept.
    Split,
}

/// Two rows of one snapshot that mapped to the same fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollisionReviewItem {
    pub fingerprint: String,
    pub kept_link: String,
    pub duplicate_link: String,
    pub similarity: f64,
    pub resolution: CollisionResolution,
    /// Link-pinned fingerprint the duplicate was stored under after a split.
    pub split_fingerprint: Option<String>,
    pub review_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeSummary {
    pub snapshot_date: NaiveDate,
    pub previous_snapshot_date: Option<NaiveDate>,
    pub incoming_rows: usize,
    pub new_count: usize,
    pub recurring_count: usize,
    pub changed_count: usize,
    pub missing_count: usize,
    pub total_after_merge: usize,
    pub distinct_fingerprints_total: usize,
    pub replaced_rows: usize,
    pub collapsed_duplicates: usize,
    pub split_collisions: usize,
    pub low_confidence_count: usize,
    pub missing_fingerprints: Vec<String>,
    pub price_changes: Vec<PriceChange>,
    pub collisions: Vec<CollisionReviewItem>,
}

impl MergeSummary {
    fn start(snapshot_date: NaiveDate, previous_snapshot_date: Option<NaiveDate>, incoming_rows: usize) -> Self {
        Self {
            snapshot_date,
            previous_snapshot_date,
            incoming_rows,
            new_count: 0,
            recurring_count: 0,
            changed_count: 0,
            missing_count: 0,
            total_after_merge: 0,
            distinct_fingerprints_total: 0,
            replaced_rows: 0,
            collapsed_duplicates: 0,
            split_collisions: 0,
            low_confidence_count: 0,
            missing_fingerprints: Vec::new(),
            price_changes: Vec::new(),
            collisions: Vec::new(),
        }
    }

    /// True when the snapshot carried no rows and the table was left alone.
    pub fn is_noop(&self) -> bool {
        self.incoming_rows == 0
    }

    pub fn collisions_needing_review(&self) -> usize {
        self.collisions.iter().filter(|c| c.review_required).count()
    }
}

/// Price plus amenity flags: the attributes tracked across snapshots.
type Offer = (Option<f64>, (bool, bool, bool));

#[derive(Debug, Clone)]
struct PriorObservation {
    snapshot_date: NaiveDate,
    link: String,
    first_seen: NaiveDate,
    price: Option<f64>,
    amenities: (bool, bool, bool),
}

struct PriorState {
    latest: HashMap<String, PriorObservation>,
    previous_date: Option<NaiveDate>,
    previous_fingerprints: HashSet<String>,
}

impl PriorState {
    /// Everything observed strictly before `date`, so a re-run for the same
    /// day compares against yesterday and not against itself.
    fn before(table: &HistoryTable, date: NaiveDate) -> Self {
        let mut latest: HashMap<String, PriorObservation> = HashMap::new();
        let mut previous_date: Option<NaiveDate> = None;

        for row in table.rows().iter().filter(|r| r.snapshot_date < date) {
            previous_date = previous_date.max(Some(row.snapshot_date));
            let first_seen = row.first_seen.min(row.snapshot_date);
            match latest.get_mut(&row.fingerprint) {
                Some(prior) => {
                    prior.first_seen = prior.first_seen.min(first_seen);
                    if row.snapshot_date >= prior.snapshot_date {
                        prior.snapshot_date = row.snapshot_date;
                        prior.link.clone_from(&row.link);
                        prior.price = row.price;
                        prior.amenities = row.amenities();
                    }
                }
                None => {
                    latest.insert(
                        row.fingerprint.clone(),
                        PriorObservation {
                            snapshot_date: row.snapshot_date,
                            link: row.link.clone(),
                            first_seen,
                            price: row.price,
                            amenities: row.amenities(),
                        },
                    );
                }
            }
        }

        let previous_fingerprints = match previous_date {
            Some(prev) => table
                .rows_on(prev)
                .map(|r| r.fingerprint.clone())
                .collect(),
            None => HashSet::new(),
        };

        Self {
            latest,
            previous_date,
            previous_fingerprints,
        }
    }
}

/// Folds one day's clean snapshot into the history table.
#[derive(Debug, Clone, Default)]
pub struct HistoryMerger {
    config: MergeConfig,
}

impl HistoryMerger {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn merge(&self, table: &mut HistoryTable, snapshot: &[CleanListing], date: NaiveDate) -> MergeSummary {
        let span = info_span!("history_merge", %date, incoming = snapshot.len());
        let _guard = span.enter();

        let prior = PriorState::before(table, date);
        let mut summary = MergeSummary::start(date, prior.previous_date, snapshot.len());

        if snapshot.is_empty() {
            info!("empty snapshot, history left untouched");
            summary.total_after_merge = table.len();
            summary.distinct_fingerprints_total = table.distinct_fingerprints();
            return summary;
        }

        let scheme = self.config.scheme;
        let base: Vec<Fingerprint> = snapshot
            .iter()
            .map(|l| fingerprint(&ListingKey::from(l), scheme, &l.link))
            .collect();
        let anchors = Self::anchor_rows(snapshot, &base, &prior);

        let mut batch: Vec<HistoryRow> = Vec::with_capacity(snapshot.len());
        let mut kept: HashMap<String, usize> = HashMap::new();

        for (idx, (listing, base_fp)) in snapshot.iter().zip(&base).enumerate() {
            let anchor_idx = anchors[base_fp.value.as_str()];
            let fp = if anchor_idx == idx {
                base_fp.clone()
            } else {
                let anchor = &snapshot[anchor_idx];
                let same_offer = !self.offer_differs(
                    (listing.price, listing.amenities()),
                    (anchor.price, anchor.amenities()),
                );
                if listing.link == anchor.link || same_offer {
                    summary.collapsed_duplicates += 1;
                    summary
                        .collisions
                        .push(self.review_collision(&base_fp.value, anchor, listing, None));
                    continue;
                }

                let split = salted_fingerprint(&ListingKey::from(listing), scheme, &listing.link);
                if let Some(&twin) = kept.get(&split.value) {
                    summary.collapsed_duplicates += 1;
                    summary
                        .collisions
                        .push(self.review_collision(&split.value, &snapshot[twin], listing, None));
                    continue;
                }
                summary.split_collisions += 1;
                summary
                    .collisions
                    .push(self.review_collision(&base_fp.value, anchor, listing, Some(&split.value)));
                split
            };
            kept.insert(fp.value.clone(), idx);

            if fp.low_confidence {
                summary.low_confidence_count += 1;
                warn!(link = %listing.link, fingerprint = %fp.value, "low-confidence fingerprint");
            }

            let row = match prior.latest.get(&fp.value) {
                None => {
                    summary.new_count += 1;
                    HistoryRow::observe(listing, &fp, date, ListingStatus::New, None, date)
                }
                Some(prev) if self.is_material_change(listing, prev) => {
                    summary.changed_count += 1;
                    let price_delta = match (listing.price, prev.price) {
                        (Some(now), Some(before)) => Some(now - before),
                        _ => None,
                    };
                    let row = HistoryRow::observe(
                        listing,
                        &fp,
                        date,
                        ListingStatus::Changed,
                        price_delta,
                        prev.first_seen,
                    );
                    summary.price_changes.push(PriceChange {
                        fingerprint: fp.value.clone(),
                        link: listing.link.clone(),
                        district: listing.district,
                        previous_price: prev.price,
                        price: listing.price,
                        price_delta,
                        days_on_market: row.days_on_market,
                    });
                    row
                }
                Some(prev) => {
                    summary.recurring_count += 1;
                    HistoryRow::observe(listing, &fp, date, ListingStatus::Recurring, None, prev.first_seen)
                }
            };
            batch.push(row);
        }

        let mut missing: Vec<String> = prior
            .previous_fingerprints
            .into_iter()
            .filter(|fp| !kept.contains_key(fp))
            .collect();
        missing.sort();
        summary.missing_count = missing.len();
        summary.missing_fingerprints = missing;

        summary.replaced_rows = table.replace_snapshot(date, batch);
        summary.total_after_merge = table.len();
        summary.distinct_fingerprints_total = table.distinct_fingerprints();

        if summary.replaced_rows > 0 {
            info!(replaced = summary.replaced_rows, "re-run for an already merged date");
        }
        info!(
            new = summary.new_count,
            recurring = summary.recurring_count,
            changed = summary.changed_count,
            missing = summary.missing_count,
            total = summary.total_after_merge,
            "merge complete"
        );
        summary
    }

    /// Load from `backend`, merge, and save unless the merge was a no-op.
    pub fn merge_into(
        &self,
        backend: &dyn HistoryBackend,
        snapshot: &[CleanListing],
        date: NaiveDate,
    ) -> Result<MergeOutcome, StoreError> {
        let mut table = backend.load()?;
        let summary = self.merge(&mut table, snapshot, date);
        let saved = !summary.is_noop();
        if saved {
            backend.save(&table)?;
        }
        Ok(MergeOutcome { summary, table, saved })
    }

    /// Picks, per fingerprint, the snapshot row that keeps it. The row
    /// continuing the prior posting wins, otherwise the first one, so the
    /// outcome does not depend on the order the site returned rows in.
    fn anchor_rows<'a>(
        snapshot: &[CleanListing],
        base: &'a [Fingerprint],
        prior: &PriorState,
    ) -> HashMap<&'a str, usize> {
        let mut anchors: HashMap<&'a str, usize> = HashMap::new();
        for (idx, fp) in base.iter().enumerate() {
            let prior_link = prior.latest.get(&fp.value).map(|p| p.link.as_str());
            match anchors.entry(fp.value.as_str()) {
                Entry::Vacant(slot) => {
                    slot.insert(idx);
                }
                Entry::Occupied(mut slot) => {
                    let continues_prior = prior_link == Some(snapshot[idx].link.as_str());
                    let current_continues = prior_link == Some(snapshot[*slot.get()].link.as_str());
                    if continues_prior && !current_continues {
                        slot.insert(idx);
                    }
                }
            }
        }
        anchors
    }

    /// Price beyond the change threshold, a price appearing or vanishing, or
    /// any amenity flag flipping.
    fn offer_differs(&self, now: Offer, before: Offer) -> bool {
        let price_moved = match (now.0, before.0) {
            (Some(a), Some(b)) => (a - b).abs() > self.config.price_change_threshold,
            (None, None) => false,
            _ => true,
        };
        price_moved || now.1 != before.1
    }

    fn is_material_change(&self, listing: &CleanListing, prev: &PriorObservation) -> bool {
        self.offer_differs((listing.price, listing.amenities()), (prev.price, prev.amenities))
    }

    fn review_collision(
        &self,
        fp: &str,
        kept: &CleanListing,
        duplicate: &CleanListing,
        split: Option<&str>,
    ) -> CollisionReviewItem {
        let similarity = if kept.link == duplicate.link {
            1.0
        } else {
            jaro_winkler(&kept.raw_text, &duplicate.raw_text)
        };
        // A split always needs a human: the key says one flat, the offer says two.
        let review_required = split.is_some() || similarity < self.config.collision_review_threshold;
        if review_required {
            warn!(
                fingerprint = fp,
                kept = %kept.link,
                duplicate = %duplicate.link,
                similarity,
                split = split.is_some(),
                "same-day fingerprint collision flagged for review"
            );
        }
        CollisionReviewItem {
            fingerprint: fp.to_string(),
            kept_link: kept.link.clone(),
            duplicate_link: duplicate.link.clone(),
            similarity,
            resolution: if split.is_some() {
                CollisionResolution::Split
            } else {
                CollisionResolution::Collapsed
            },
            split_fingerprint: split.map(str::to_string),
            review_required,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub summary: MergeSummary,
    pub table: HistoryTable,
    pub saved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketTrend {
    Heating,
    Softening,
    Flat,
}

impl MarketTrend {
    fn headline(&self) -> &'static str {
        match self {
            Self::Heating => "more price increases than decreases, market is heating up",
            Self::Softening => "more price decreases than increases, market is softening",
            Self::Flat => "price movement is balanced",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketInsights {
    pub price_increases: usize,
    pub price_decreases: usize,
    pub trend: MarketTrend,
    pub top_districts_today: Vec<(u32, usize)>,
    pub snapshot_days: usize,
    pub first_snapshot: Option<NaiveDate>,
    pub last_snapshot: Option<NaiveDate>,
}

impl MarketInsights {
    pub fn from_merge(summary: &MergeSummary, table: &HistoryTable) -> Self {
        let price_increases = summary
            .price_changes
            .iter()
            .filter(|c| c.price_delta.is_some_and(|d| d > 0.0))
            .count();
        let price_decreases = summary
            .price_changes
            .iter()
            .filter(|c| c.price_delta.is_some_and(|d| d < 0.0))
            .count();
        let trend = match price_increases.cmp(&price_decreases) {
            std::cmp::Ordering::Greater => MarketTrend::Heating,
            std::cmp::Ordering::Less => MarketTrend::Softening,
            std::cmp::Ordering::Equal => MarketTrend::Flat,
        };
        let dates = table.snapshot_dates();
        Self {
            price_increases,
            price_decreases,
            trend,
            top_districts_today: top_districts(table, summary.snapshot_date, 5),
            snapshot_days: dates.len(),
            first_snapshot: dates.first().copied(),
            last_snapshot: dates.last().copied(),
        }
    }
}

/// Most listed districts on `date`, busiest first, ties by district code.
pub fn top_districts(table: &HistoryTable, date: NaiveDate, limit: usize) -> Vec<(u32, usize)> {
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for district in table.rows_on(date).filter_map(|r| r.district) {
        *counts.entry(district).or_default() += 1;
    }
    let mut ranked: Vec<(u32, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}

fn fmt_district(district: Option<u32>) -> String {
    district.map_or_else(|| "unknown".to_string(), |d| d.to_string())
}

fn fmt_signed_eur(delta: Option<f64>) -> String {
    match delta {
        Some(d) if d >= 0.0 => format!("+€{d:.0}"),
        Some(d) => format!("-€{:.0}", d.abs()),
        None => "n/a".to_string(),
    }
}

pub fn render_summary_text(summary: &MergeSummary) -> String {
    let mut out = format!("HISTORY MERGE {}\n", summary.snapshot_date);
    if summary.is_noop() {
        out.push_str("  No listings in today's snapshot, history unchanged.\n");
    }
    out.push_str(&format!(
        "  New listings (first appearance): {}\n  Recurring (no change):           {}\n  Changed (price/amenities):       {}\n  Missing today:                   {}\n  Total historical records:        {}\n  Distinct properties ever seen:   {}\n",
        summary.new_count,
        summary.recurring_count,
        summary.changed_count,
        summary.missing_count,
        summary.total_after_merge,
        summary.distinct_fingerprints_total,
    ));
    if summary.replaced_rows > 0 {
        out.push_str(&format!(
            "  Replaced rows from an earlier run today: {}\n",
            summary.replaced_rows
        ));
    }
    if !summary.collisions.is_empty() {
        out.push_str(&format!(
            "  Same-day collisions: {} collapsed, {} split ({} flagged for review)\n",
            summary.collapsed_duplicates,
            summary.split_collisions,
            summary.collisions_needing_review()
        ));
    }
    if summary.low_confidence_count > 0 {
        out.push_str(&format!(
            "  Low-confidence fingerprints: {}\n",
            summary.low_confidence_count
        ));
    }
    if !summary.price_changes.is_empty() {
        out.push_str("\n  Price changes:\n");
        for change in summary.price_changes.iter().take(5) {
            let arrow = match change.price_delta {
                Some(d) if d > 0.0 => "↑",
                Some(d) if d < 0.0 => "↓",
                _ => "·",
            };
            let pct = change
                .percent()
                .map(|p| format!(" ({p:+.1}%)"))
                .unwrap_or_default();
            out.push_str(&format!(
                "    {arrow} District {}: {}{pct}, {} days on market\n",
                fmt_district(change.district),
                fmt_signed_eur(change.price_delta),
                change.days_on_market
            ));
        }
    }
    out
}

pub fn render_daily_brief(summary: &MergeSummary, insights: &MarketInsights) -> String {
    let mut md = format!(
        "# Vienna Rent Daily Brief\n\n- Snapshot date: {}\n- Previous snapshot: {}\n- Incoming rows: {}\n\n## Merge\n\n| class | count |\n|---|---|\n| new | {} |\n| recurring | {} |\n| changed | {} |\n| missing today | {} |\n| total records | {} |\n| distinct properties | {} |\n",
        summary.snapshot_date,
        summary
            .previous_snapshot_date
            .map_or_else(|| "none".to_string(), |d| d.to_string()),
        summary.incoming_rows,
        summary.new_count,
        summary.recurring_count,
        summary.changed_count,
        summary.missing_count,
        summary.total_after_merge,
        summary.distinct_fingerprints_total,
    );

    md.push_str(&format!(
        "\n## Market\n\n- {} increases, {} decreases: {}\n- History covers {} snapshot day(s){}\n",
        insights.price_increases,
        insights.price_decreases,
        insights.trend.headline(),
        insights.snapshot_days,
        match (insights.first_snapshot, insights.last_snapshot) {
            (Some(first), Some(last)) => format!(" from {first} to {last}"),
            _ => String::new(),
        }
    ));

    if !insights.top_districts_today.is_empty() {
        md.push_str("\n### Top districts today\n\n");
        for (district, count) in &insights.top_districts_today {
            md.push_str(&format!("- {district}: {count}\n"));
        }
    }

    if !summary.price_changes.is_empty() {
        md.push_str("\n## Price changes\n\n| district | before | now | delta | days on market | link |\n|---|---|---|---|---|---|\n");
        for c in &summary.price_changes {
            md.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} |\n",
                fmt_district(c.district),
                c.previous_price.map_or_else(|| "n/a".to_string(), |p| format!("€{p:.0}")),
                c.price.map_or_else(|| "n/a".to_string(), |p| format!("€{p:.0}")),
                fmt_signed_eur(c.price_delta),
                c.days_on_market,
                c.link
            ));
        }
    }

    let flagged: Vec<&CollisionReviewItem> = summary.collisions.iter().filter(|c| c.review_required).collect();
    if !flagged.is_empty() {
        md.push_str("\n## Collisions to review\n\n");
        for c in flagged {
            let outcome = match (&c.resolution, &c.split_fingerprint) {
                (CollisionResolution::Split, Some(split)) => format!("kept apart as `{split}`"),
                _ => "dropped".to_string(),
            };
            md.push_str(&format!(
                "- `{}` kept {}, {} {} (similarity {:.2})\n",
                c.fingerprint, c.kept_link, c.duplicate_link, outcome, c.similarity
            ));
        }
    }
    md
}

/// Writes `merge_summary.json` and `daily_brief.md` under `reports/<date>/`.
pub async fn write_reports(reports_root: &Path, summary: &MergeSummary, insights: &MarketInsights) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.snapshot_date.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "generated_at": Utc::now(),
        "summary": summary,
        "insights": insights,
    }))
    .context("serializing merge summary")?;
    fs::write(reports_dir.join("merge_summary.json"), json)
        .await
        .context("writing merge_summary.json")?;

    fs::write(reports_dir.join("daily_brief.md"), render_daily_brief(summary, insights))
        .await
        .context("writing daily_brief.md")?;

    Ok(reports_dir)
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub records: usize,
    pub distinct_fingerprints: usize,
    pub low_confidence_rows: usize,
    pub snapshot_days: usize,
    pub first_snapshot: Option<NaiveDate>,
    pub last_snapshot: Option<NaiveDate>,
    pub latest_rows: usize,
    pub top_districts_latest: Vec<(u32, usize)>,
}

pub fn history_stats(table: &HistoryTable) -> HistoryStats {
    let dates = table.snapshot_dates();
    let last = dates.last().copied();
    HistoryStats {
        records: table.len(),
        distinct_fingerprints: table.distinct_fingerprints(),
        low_confidence_rows: table.rows().iter().filter(|r| r.low_confidence).count(),
        snapshot_days: dates.len(),
        first_snapshot: dates.first().copied(),
        last_snapshot: last,
        latest_rows: last.map_or(0, |d| table.rows_on(d).count()),
        top_districts_latest: last.map_or_else(Vec::new, |d| top_districts(table, d, 5)),
    }
}

pub fn render_stats_text(stats: &HistoryStats) -> String {
    let range = match (stats.first_snapshot, stats.last_snapshot) {
        (Some(first), Some(last)) => format!("{first} .. {last}"),
        _ => "empty".to_string(),
    };
    let mut out = format!(
        "records: {}\ndistinct properties: {}\nlow-confidence rows: {}\nsnapshot days: {}\ndate range: {}\nlatest snapshot rows: {}\n",
        stats.records,
        stats.distinct_fingerprints,
        stats.low_confidence_rows,
        stats.snapshot_days,
        range,
        stats.latest_rows
    );
    if !stats.top_districts_latest.is_empty() {
        out.push_str("top districts (latest day):\n");
        for (district, count) in &stats.top_districts_latest {
            out.push_str(&format!("  {district}: {count}\n"));
        }
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub last_snapshot: Option<NaiveDate>,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Exports the history as `history.parquet` plus `manifest.json` into
/// `out_dir`, returning the manifest path.
pub fn export_history_parquet(table: &HistoryTable, out_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let parquet_path = out_dir.join("history.parquet");
    let bytes = encode_history_parquet(table.rows())?;
    write_atomic(&parquet_path, &bytes)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        last_snapshot: table.latest_snapshot_date(),
        files: vec![ParquetManifestFile {
            name: "history".to_string(),
            path: "history.parquet".to_string(),
            rows: table.len(),
            sha256: sha256_hex(&bytes),
            bytes: bytes.len() as u64,
        }],
    };

    let manifest_path = out_dir.join("manifest.json");
    let json = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    write_atomic(&manifest_path, &json)?;
    info!(rows = table.len(), path = %parquet_path.display(), "history exported");
    Ok(manifest_path)
}

/// Encodes in memory so the file on disk is only ever replaced whole.
fn encode_parquet(batch: RecordBatch) -> Result<Vec<u8>> {
    let mut writer =
        ArrowWriter::try_new(Vec::new(), batch.schema(), None).context("opening parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.into_inner().context("closing parquet writer")
}

fn encode_history_parquet(rows: &[HistoryRow]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("fingerprint", DataType::Utf8, false),
        ArrowField::new("low_confidence", DataType::Boolean, false),
        ArrowField::new("snapshot_date", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("price_delta", DataType::Float64, true),
        ArrowField::new("first_seen", DataType::Utf8, false),
        ArrowField::new("days_on_market", DataType::Int64, false),
        ArrowField::new("link", DataType::Utf8, false),
        ArrowField::new("price", DataType::Float64, true),
        ArrowField::new("size", DataType::Float64, true),
        ArrowField::new("rooms", DataType::UInt32, true),
        ArrowField::new("district", DataType::UInt32, true),
        ArrowField::new("has_outdoor", DataType::Boolean, false),
        ArrowField::new("is_neubau", DataType::Boolean, false),
        ArrowField::new("is_furnished", DataType::Boolean, false),
        ArrowField::new("price_per_m2", DataType::Float64, true),
        ArrowField::new("dist_center", DataType::Float64, true),
        ArrowField::new("dist_ubahn", DataType::Float64, true),
    ]));

    let fingerprints = StringArray::from(rows.iter().map(|r| r.fingerprint.as_str()).collect::<Vec<_>>());
    let low_confidence = BooleanArray::from(rows.iter().map(|r| r.low_confidence).collect::<Vec<_>>());
    let snapshot_dates = StringArray::from(rows.iter().map(|r| r.snapshot_date.to_string()).collect::<Vec<_>>());
    let statuses = StringArray::from(rows.iter().map(|r| r.status.as_str()).collect::<Vec<_>>());
    let price_deltas = Float64Array::from(rows.iter().map(|r| r.price_delta).collect::<Vec<_>>());
    let first_seen = StringArray::from(rows.iter().map(|r| r.first_seen.to_string()).collect::<Vec<_>>());
    let days_on_market = Int64Array::from(rows.iter().map(|r| r.days_on_market).collect::<Vec<_>>());
    let links = StringArray::from(rows.iter().map(|r| r.link.as_str()).collect::<Vec<_>>());
    let prices = Float64Array::from(rows.iter().map(|r| r.price).collect::<Vec<_>>());
    let sizes = Float64Array::from(rows.iter().map(|r| r.size).collect::<Vec<_>>());
    let rooms = UInt32Array::from(rows.iter().map(|r| r.rooms).collect::<Vec<_>>());
    let districts = UInt32Array::from(rows.iter().map(|r| r.district).collect::<Vec<_>>());
    let outdoor = BooleanArray::from(rows.iter().map(|r| r.has_outdoor).collect::<Vec<_>>());
    let neubau = BooleanArray::from(rows.iter().map(|r| r.is_neubau).collect::<Vec<_>>());
    let furnished = BooleanArray::from(rows.iter().map(|r| r.is_furnished).collect::<Vec<_>>());
    let price_per_m2 = Float64Array::from(rows.iter().map(|r| r.price_per_m2).collect::<Vec<_>>());
    let dist_center = Float64Array::from(rows.iter().map(|r| r.dist_center).collect::<Vec<_>>());
    let dist_ubahn = Float64Array::from(rows.iter().map(|r| r.dist_ubahn).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(fingerprints),
            Arc::new(low_confidence),
            Arc::new(snapshot_dates),
            Arc::new(statuses),
            Arc::new(price_deltas),
            Arc::new(first_seen),
            Arc::new(days_on_market),
            Arc::new(links),
            Arc::new(prices),
            Arc::new(sizes),
            Arc::new(rooms),
            Arc::new(districts),
            Arc::new(outdoor),
            Arc::new(neubau),
            Arc::new(furnished),
            Arc::new(price_per_m2),
            Arc::new(dist_center),
            Arc::new(dist_ubahn),
        ],
    )
    .context("building history record batch")?;
    encode_parquet(batch)
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeOutcome {
    pub source_id: String,
    pub pages_requested: u32,
    pub pages_failed: u32,
    pub listings: usize,
    pub raw_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanOutcome {
    pub raw_rows: usize,
    pub clean_rows: usize,
    pub with_price: usize,
    pub with_district: usize,
    pub clean_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackOutcome {
    /// `loaded`, `empty` or `missing`.
    pub input: &'static str,
    pub saved: bool,
    pub history_path: String,
    pub summary: MergeSummary,
    pub insights: MarketInsights,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub scrape: ScrapeOutcome,
    pub clean: CleanOutcome,
    pub track: TrackOutcome,
    pub reports_dir: String,
}

/// Reads the clean snapshot, then merges it into the history behind
/// `backend`. A malformed snapshot fails before the history is loaded.
pub fn track_snapshot(
    snapshot_path: &Path,
    backend: &dyn HistoryBackend,
    merger: &HistoryMerger,
    date: NaiveDate,
) -> Result<TrackOutcome> {
    let input = read_clean_snapshot(snapshot_path)
        .with_context(|| format!("reading clean snapshot {}", snapshot_path.display()))?;
    match &input {
        SnapshotInput::Missing => {
            warn!(path = %snapshot_path.display(), "no clean snapshot today, merge is a no-op")
        }
        SnapshotInput::Empty => {
            warn!(path = %snapshot_path.display(), "clean snapshot has no rows, merge is a no-op")
        }
        SnapshotInput::Rows(rows) => info!(rows = rows.len(), "clean snapshot loaded"),
    }

    let outcome = merger
        .merge_into(backend, input.rows(), date)
        .with_context(|| format!("merging into history {}", backend.location()))?;
    let insights = MarketInsights::from_merge(&outcome.summary, &outcome.table);
    Ok(TrackOutcome {
        input: input.label(),
        saved: outcome.saved,
        history_path: backend.location(),
        summary: outcome.summary,
        insights,
    })
}

/// scrape → clean → track → report, one invocation per day.
pub struct TrackerPipeline {
    config: TrackerConfig,
    http: HttpFetcher,
    source: Box<dyn ListingSource>,
    extractor: FeatureExtractor,
    merger: HistoryMerger,
}

impl TrackerPipeline {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })?;
        let source = adapter_for_source(&config.source_id, &config.base_url)
            .with_context(|| format!("no adapter registered for source {:?}", config.source_id))?;
        let rules = AmenityRules::load_or_default(&config.rules_path)?;
        let extractor = FeatureExtractor::new(rules).context("compiling feature extractor")?;
        let merger = HistoryMerger::new(config.merge);
        Ok(Self {
            config,
            http,
            source,
            extractor,
            merger,
        })
    }

    pub fn with_source(mut self, source: Box<dyn ListingSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub async fn scrape(&self) -> Result<ScrapeOutcome> {
        let pages = self.config.pages;
        let source_id = self.source.source_id();
        info!(source = source_id, pages, "scrape started");

        let mut listings: Vec<RawListing> = Vec::new();
        let mut pages_failed = 0u32;
        for page in 1..=pages {
            let parsed = match self.source.fetch_page(&self.http, page).await {
                Ok(fetched) => self.source.parse_page(&fetched),
                Err(err) => Err(err),
            };
            match parsed {
                Ok(found) => {
                    info!(page, found = found.len(), "page scraped");
                    listings.extend(found);
                }
                Err(err) => {
                    pages_failed += 1;
                    warn!(page, error = %err, "page failed, continuing");
                }
            }
            if page < pages && !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }

        if pages > 0 && pages_failed == pages {
            bail!("all {pages} pages from {source_id} failed");
        }
        if listings.is_empty() {
            warn!(source = source_id, "scrape returned no listings");
        }

        let raw_path = self.config.raw_snapshot_path();
        write_raw_snapshot(&raw_path, &listings)
            .with_context(|| format!("writing raw snapshot {}", raw_path.display()))?;
        Ok(ScrapeOutcome {
            source_id: source_id.to_string(),
            pages_requested: pages,
            pages_failed,
            listings: listings.len(),
            raw_path: raw_path.display().to_string(),
        })
    }

    pub fn clean(&self) -> Result<CleanOutcome> {
        let raw_path = self.config.raw_snapshot_path();
        let raw = read_raw_snapshot(&raw_path)
            .with_context(|| format!("reading raw snapshot {}", raw_path.display()))?;
        if matches!(raw, SnapshotInput::Missing) {
            bail!("raw snapshot {} not found, run scrape first", raw_path.display());
        }

        let clean = self.extractor.clean_all(raw.rows());
        let clean_path = self.config.clean_snapshot_path();
        write_clean_snapshot(&clean_path, &clean)
            .with_context(|| format!("writing clean snapshot {}", clean_path.display()))?;

        let outcome = CleanOutcome {
            raw_rows: raw.rows().len(),
            clean_rows: clean.len(),
            with_price: clean.iter().filter(|c| c.price.is_some()).count(),
            with_district: clean.iter().filter(|c| c.district.is_some()).count(),
            clean_path: clean_path.display().to_string(),
        };
        info!(
            rows = outcome.clean_rows,
            with_price = outcome.with_price,
            with_district = outcome.with_district,
            "clean snapshot written"
        );
        Ok(outcome)
    }

    pub fn track(&self, date: NaiveDate) -> Result<TrackOutcome> {
        track_snapshot(
            &self.config.clean_snapshot_path(),
            &self.config.history_store(),
            &self.merger,
            date,
        )
    }

    pub async fn report(&self, track: &TrackOutcome) -> Result<PathBuf> {
        write_reports(&self.config.reports_dir, &track.summary, &track.insights).await
    }

    pub async fn run_once(&self, date: NaiveDate) -> Result<PipelineSummary> {
        let scrape = self.scrape().await.context("scrape step")?;
        let clean = self.clean().context("clean step")?;
        let track = self.track(date).context("track step")?;
        let reports_dir = self.report(&track).await.context("report step")?;
        Ok(PipelineSummary {
            scrape,
            clean,
            track,
            reports_dir: reports_dir.display().to_string(),
        })
    }
}

pub async fn run_pipeline_once_from_env(date: NaiveDate) -> Result<PipelineSummary> {
    let config = TrackerConfig::from_env()?;
    TrackerPipeline::new(config)?.run_once(date).await
}
