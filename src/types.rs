//! Shared types for the CARBITRAGE pipeline.
//!
//! These types form the data model used across all modules.
//! They are kept free of behaviour that depends on other modules so that
//! sources, valuation, pricing, storage, and the scheduler can all depend
//! on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Raw listings
// ---------------------------------------------------------------------------

/// Optional search parameters forwarded to listing providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchParams {
    pub make: Option<String>,
    pub model: Option<String>,
}

/// A raw foreign-market listing, before enrichment.
///
/// Produced by a listing provider and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub make: String,
    pub model: String,
    pub year: i32,
    /// Odometer reading in km, when the provider exposes one.
    pub mileage: Option<u32>,
    pub condition: Option<String>,
    /// Asking price in the source currency (whole units, e.g. JPY).
    pub price: i64,
    /// Provider tag, e.g. "Goo-net" or "Mock USS Auction".
    pub source: String,
    pub url: String,
    pub listed_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: VehicleAttributes,
}

impl ListingRecord {
    /// Whether this record came from the synthetic generator.
    pub fn is_synthetic(&self) -> bool {
        self.source.starts_with("Mock ")
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            make: self.make.clone(),
            model: self.model.clone(),
            year: self.year,
            source_price: self.price,
            source_url: self.url.clone(),
        }
    }
}

impl fmt::Display for ListingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} ({} JPY, {}) [{}]",
            self.year,
            self.make,
            self.model,
            self.price,
            self.mileage
                .map(|m| format!("{m} km"))
                .unwrap_or_else(|| "? km".to_string()),
            self.source,
        )
    }
}

/// Optional descriptive attributes carried through to the persisted record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleAttributes {
    pub engine_size: Option<String>,
    pub fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub body_type: Option<String>,
    pub color: Option<String>,
    pub location: Option<String>,
    /// Auction inspection grade (USS only).
    pub auction_grade: Option<String>,
}

/// Anything the profitability engine can price: a source price plus the
/// age and mileage inputs of the condition bonus.
pub trait Priced {
    fn source_price(&self) -> i64;
    fn year(&self) -> i32;
    fn mileage(&self) -> Option<u32>;
}

impl Priced for ListingRecord {
    fn source_price(&self) -> i64 {
        self.price
    }
    fn year(&self) -> i32 {
        self.year
    }
    fn mileage(&self) -> Option<u32> {
        self.mileage
    }
}

// ---------------------------------------------------------------------------
// Valuation
// ---------------------------------------------------------------------------

/// Which fallback tier produced a valuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum Provenance {
    /// Exact match from the remote structured API.
    RemoteApi,
    /// min/max/mean over prices scraped from search results.
    WebAggregate { sample_size: usize },
    /// Curated lookup table with age depreciation.
    CuratedTable,
    /// Randomised base value for unknown make/model pairs.
    Generated,
}

impl Provenance {
    /// Whether the estimate came from a live remote source.
    pub fn is_live(&self) -> bool {
        matches!(self, Provenance::RemoteApi | Provenance::WebAggregate { .. })
    }

    /// The short tag persisted alongside the record.
    pub fn tag(&self) -> &'static str {
        match self {
            Provenance::RemoteApi => "classic.com API",
            Provenance::WebAggregate { .. } => "classic.com web",
            Provenance::CuratedTable => "mock data",
            Provenance::Generated => "generated mock data",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::WebAggregate { sample_size } => {
                write!(f, "{} (n={sample_size})", self.tag())
            }
            other => write!(f, "{}", other.tag()),
        }
    }
}

/// A destination-market resale estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationEstimate {
    pub low: Option<Decimal>,
    pub high: Option<Decimal>,
    pub average: Option<Decimal>,
    pub currency: String,
    pub provenance: Provenance,
    pub fetched_at: DateTime<Utc>,
}

impl ValuationEstimate {
    /// The value used for profit: average, or low when average is absent.
    /// Zero counts as absent.
    pub fn usable_value(&self) -> Option<Decimal> {
        let nonzero = |v: &Decimal| !v.is_zero();
        self.average
            .filter(nonzero)
            .or_else(|| self.low.filter(nonzero))
    }
}

impl fmt::Display for ValuationEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<Decimal>| v.map(|d| format!("{d:.0}")).unwrap_or_else(|| "-".into());
        write!(
            f,
            "{} {} [{} .. {}] via {}",
            show(self.average),
            self.currency,
            show(self.low),
            show(self.high),
            self.provenance,
        )
    }
}

/// Make/model/year triple used to look up a valuation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VehicleQuery {
    pub make: String,
    pub model: String,
    pub year: i32,
}

impl VehicleQuery {
    pub fn new(make: impl Into<String>, model: impl Into<String>, year: i32) -> Self {
        Self {
            make: make.into(),
            model: model.into(),
            year,
        }
    }

    /// Free-text search string, e.g. "Toyota Prius 2019".
    pub fn search_text(&self) -> String {
        format!("{} {} {}", self.make, self.model, self.year)
    }

    /// Whether a scraped make/model/year triple is an exact match
    /// (case-insensitive on make and model).
    pub fn matches(&self, make: &str, model: &str, year: i32) -> bool {
        self.make.eq_ignore_ascii_case(make.trim())
            && self.model.eq_ignore_ascii_case(model.trim())
            && self.year == year
    }
}

impl From<&ListingRecord> for VehicleQuery {
    fn from(listing: &ListingRecord) -> Self {
        Self::new(listing.make.clone(), listing.model.clone(), listing.year)
    }
}

impl From<&ArbitrageRecord> for VehicleQuery {
    fn from(record: &ArbitrageRecord) -> Self {
        Self::new(record.make.clone(), record.model.clone(), record.year)
    }
}

// ---------------------------------------------------------------------------
// Profitability
// ---------------------------------------------------------------------------

/// Landed-cost components, all in the destination currency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub shipping: Decimal,
    pub insurance: Decimal,
    pub customs_duty: Decimal,
    pub vat: Decimal,
    pub clearance: Decimal,
    pub local_transport: Decimal,
    pub documentation: Decimal,
}

impl CostBreakdown {
    /// Sum of every component (excludes the vehicle price itself).
    pub fn total_additional(&self) -> Decimal {
        self.shipping
            + self.insurance
            + self.customs_duty
            + self.vat
            + self.clearance
            + self.local_transport
            + self.documentation
    }

    /// Duty plus VAT, the "duties & taxes" line.
    pub fn duties_and_taxes(&self) -> Decimal {
        self.customs_duty + self.vat
    }
}

/// Risk tier derived jointly from score and margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskTier {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::Low => write!(f, "Low"),
            RiskTier::Medium => write!(f, "Medium"),
            RiskTier::High => write!(f, "High"),
            RiskTier::VeryHigh => write!(f, "Very High"),
        }
    }
}

/// Output of the profitability engine for one listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitabilityResult {
    /// Source price converted to the destination currency.
    pub price_converted: Decimal,
    pub costs: CostBreakdown,
    pub total_cost: Decimal,
    pub expected_resale: Decimal,
    pub gross_profit: Decimal,
    /// Percent of total cost; negative for a loss.
    pub profit_margin: Decimal,
    /// Percent of converted price; negative for a loss.
    pub roi: Decimal,
    pub score: u8,
    pub recommended: bool,
    pub risk: RiskTier,
}

// ---------------------------------------------------------------------------
// Persisted entity
// ---------------------------------------------------------------------------

/// Identity of a real-world listing across repeated scrapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub make: String,
    pub model: String,
    pub year: i32,
    pub source_price: i64,
    pub source_url: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} @ {} ({})",
            self.year, self.make, self.model, self.source_price, self.source_url
        )
    }
}

/// The persisted, enriched and scored listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageRecord {
    pub id: Uuid,

    pub make: String,
    pub model: String,
    pub year: i32,
    pub mileage: Option<u32>,
    pub condition: Option<String>,
    #[serde(default)]
    pub attributes: VehicleAttributes,

    pub source_price: i64,
    pub source_currency: String,
    pub source_url: String,
    pub source_name: String,
    pub listed_at: DateTime<Utc>,

    pub resale_value: Option<Decimal>,
    pub resale_currency: String,
    pub valuation_source: String,

    #[serde(default)]
    pub costs: CostBreakdown,
    pub total_cost: Option<Decimal>,
    pub estimated_profit: Option<Decimal>,
    pub profit_margin: Option<Decimal>,
    pub profitability_score: Option<u8>,
    pub risk: Option<RiskTier>,
    #[serde(default)]
    pub recommended: bool,

    pub is_active: bool,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ArbitrageRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            make: self.make.clone(),
            model: self.model.clone(),
            year: self.year,
            source_price: self.source_price,
            source_url: self.source_url.clone(),
        }
    }

    /// Score and profit are jointly present. Records failing this are
    /// malformed and never appear in profitability-ranked queries.
    pub fn is_scored(&self) -> bool {
        self.profitability_score.is_some() && self.estimated_profit.is_some()
    }

    /// Overwrite the valuation and profitability fields in place.
    pub fn apply_score(&mut self, valuation: &ValuationEstimate, result: &ProfitabilityResult) {
        let money = |d: Decimal| d.round_dp(2);
        self.resale_value = Some(money(result.expected_resale));
        self.resale_currency = valuation.currency.clone();
        self.valuation_source = valuation.provenance.tag().to_string();
        self.costs = CostBreakdown {
            shipping: money(result.costs.shipping),
            insurance: money(result.costs.insurance),
            customs_duty: money(result.costs.customs_duty),
            vat: money(result.costs.vat),
            clearance: money(result.costs.clearance),
            local_transport: money(result.costs.local_transport),
            documentation: money(result.costs.documentation),
        };
        self.total_cost = Some(money(result.total_cost));
        self.estimated_profit = Some(money(result.gross_profit));
        self.profit_margin = Some(money(result.profit_margin));
        self.profitability_score = Some(result.score);
        self.risk = Some(result.risk);
        self.recommended = result.recommended;
    }

    /// Build a fresh record from a listing and its scored valuation.
    /// Identity fields (`id`, `created_at`) are provisional until the
    /// reconciler has looked up the natural key.
    pub fn from_scored(
        listing: &ListingRecord,
        valuation: &ValuationEstimate,
        result: &ProfitabilityResult,
        source_currency: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let mut record = Self {
            id: Uuid::new_v4(),
            make: listing.make.clone(),
            model: listing.model.clone(),
            year: listing.year,
            mileage: listing.mileage,
            condition: listing.condition.clone(),
            attributes: listing.attributes.clone(),
            source_price: listing.price,
            source_currency: source_currency.to_string(),
            source_url: listing.url.clone(),
            source_name: listing.source.clone(),
            listed_at: listing.listed_at,
            resale_value: None,
            resale_currency: valuation.currency.clone(),
            valuation_source: String::new(),
            costs: CostBreakdown::default(),
            total_cost: None,
            estimated_profit: None,
            profit_margin: None,
            profitability_score: None,
            risk: None,
            recommended: false,
            is_active: true,
            last_updated: now,
            created_at: now,
        };
        record.apply_score(valuation, result);
        record
    }
}

impl Priced for ArbitrageRecord {
    fn source_price(&self) -> i64 {
        self.source_price
    }
    fn year(&self) -> i32 {
        self.year
    }
    fn mileage(&self) -> Option<u32> {
        self.mileage
    }
}

impl fmt::Display for ArbitrageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} | profit: {} | score: {} | {}",
            self.year,
            self.make,
            self.model,
            self.estimated_profit
                .map(|p| format!("${p:.0}"))
                .unwrap_or_else(|| "-".into()),
            self.profitability_score
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into()),
            if self.is_active { "active" } else { "inactive" },
        )
    }
}

// ---------------------------------------------------------------------------
// Job audit trail
// ---------------------------------------------------------------------------

/// Outcome of one job invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Error,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Success => write!(f, "success"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" => Ok(JobStatus::Success),
            "error" => Ok(JobStatus::Error),
            other => anyhow::bail!("Unknown job status: {other}"),
        }
    }
}

/// One append-only entry in the execution audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionRecord {
    pub job_name: String,
    pub status: JobStatus,
    /// Result payload on success, `{"error": "..."}` on failure.
    pub payload: serde_json::Value,
    pub executed_at: DateTime<Utc>,
}

impl JobExecutionRecord {
    pub fn success(job_name: &str, payload: serde_json::Value) -> Self {
        Self {
            job_name: job_name.to_string(),
            status: JobStatus::Success,
            payload,
            executed_at: Utc::now(),
        }
    }

    pub fn error(job_name: &str, message: impl fmt::Display) -> Self {
        Self {
            job_name: job_name.to_string(),
            status: JobStatus::Error,
            payload: serde_json::json!({ "error": message.to_string() }),
            executed_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run summaries
// ---------------------------------------------------------------------------

/// Counts returned by a full scrape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeSummary {
    pub total_scraped: usize,
    pub with_valuation: usize,
    pub saved: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed_writes: usize,
    /// Scored records whose write was never started because of cancellation.
    #[serde(default)]
    pub unwritten: usize,
    pub synthetic: bool,
    pub cancelled: bool,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for ScrapeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scraped={} valued={} saved={} (new={} updated={} failed={}){}",
            self.total_scraped,
            self.with_valuation,
            self.saved,
            self.inserted,
            self.updated,
            self.failed_writes,
            if self.cancelled { " [cancelled]" } else { "" },
        )
    }
}

/// Counts returned by a refresh of existing records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub candidates: usize,
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub timestamp: DateTime<Utc>,
}

/// Counts returned by the two-stage retirement sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupSummary {
    pub deactivated: u64,
    pub purged: u64,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for CARBITRAGE.
#[derive(Debug, thiserror::Error)]
pub enum ArbError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid exchange rate ({pair}): {value}")]
    InvalidRate { pair: String, value: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Run cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn sample_listing() -> ListingRecord {
        ListingRecord {
            make: "Toyota".to_string(),
            model: "Prius".to_string(),
            year: 2019,
            mileage: Some(40_000),
            condition: Some("Good".to_string()),
            price: 2_000_000,
            source: "Goo-net".to_string(),
            url: "https://www.goo-net.com/usedcar/spread/goo/1.html".to_string(),
            listed_at: Utc::now(),
            attributes: VehicleAttributes::default(),
        }
    }

    pub(crate) fn sample_valuation(average: Option<Decimal>, low: Option<Decimal>) -> ValuationEstimate {
        ValuationEstimate {
            low,
            high: None,
            average,
            currency: "USD".to_string(),
            provenance: Provenance::CuratedTable,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn test_usable_value_prefers_average() {
        let v = sample_valuation(Some(dec!(20000)), Some(dec!(15000)));
        assert_eq!(v.usable_value(), Some(dec!(20000)));
    }

    #[test]
    fn test_usable_value_falls_back_to_low() {
        let v = sample_valuation(None, Some(dec!(15000)));
        assert_eq!(v.usable_value(), Some(dec!(15000)));
        let zero_avg = sample_valuation(Some(Decimal::ZERO), Some(dec!(12000)));
        assert_eq!(zero_avg.usable_value(), Some(dec!(12000)));
    }

    #[test]
    fn test_usable_value_absent() {
        assert_eq!(sample_valuation(None, None).usable_value(), None);
        assert_eq!(
            sample_valuation(Some(Decimal::ZERO), Some(Decimal::ZERO)).usable_value(),
            None
        );
    }

    #[test]
    fn test_provenance_tags() {
        assert!(Provenance::RemoteApi.is_live());
        assert!(Provenance::WebAggregate { sample_size: 3 }.is_live());
        assert!(!Provenance::CuratedTable.is_live());
        assert!(!Provenance::Generated.is_live());
        assert_eq!(
            format!("{}", Provenance::WebAggregate { sample_size: 4 }),
            "classic.com web (n=4)"
        );
    }

    #[test]
    fn test_vehicle_query_matches_case_insensitive() {
        let q = VehicleQuery::new("Toyota", "Prius", 2019);
        assert!(q.matches("toyota", " PRIUS ", 2019));
        assert!(!q.matches("toyota", "prius", 2018));
        assert!(!q.matches("honda", "prius", 2019));
        assert_eq!(q.search_text(), "Toyota Prius 2019");
    }

    #[test]
    fn test_natural_key_from_listing() {
        let l = sample_listing();
        let key = l.natural_key();
        assert_eq!(key.make, "Toyota");
        assert_eq!(key.source_price, 2_000_000);
        assert_eq!(key.source_url, l.url);
    }

    #[test]
    fn test_is_scored_requires_both_fields() {
        let listing = sample_listing();
        let valuation = sample_valuation(Some(dec!(20000)), None);
        let result = ProfitabilityResult {
            price_converted: dec!(13400),
            costs: CostBreakdown::default(),
            total_cost: dec!(13400),
            expected_resale: dec!(20000),
            gross_profit: dec!(6600),
            profit_margin: dec!(49.25),
            roi: dec!(49.25),
            score: 90,
            recommended: true,
            risk: RiskTier::Low,
        };
        let mut record = ArbitrageRecord::from_scored(&listing, &valuation, &result, "JPY", Utc::now());
        assert!(record.is_scored());
        record.estimated_profit = None;
        assert!(!record.is_scored());
        record.estimated_profit = Some(dec!(1));
        record.profitability_score = None;
        assert!(!record.is_scored());
    }

    #[test]
    fn test_job_record_constructors() {
        let ok = JobExecutionRecord::success("refresh", serde_json::json!({"refreshed": 3}));
        assert_eq!(ok.status, JobStatus::Success);
        let err = JobExecutionRecord::error("exchange_rate_update", "timeout");
        assert_eq!(err.status, JobStatus::Error);
        assert_eq!(err.payload["error"], "timeout");
    }

    #[test]
    fn test_job_status_roundtrip_str() {
        assert_eq!("SUCCESS".parse::<JobStatus>().unwrap(), JobStatus::Success);
        assert_eq!("error".parse::<JobStatus>().unwrap(), JobStatus::Error);
        assert!("meh".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_risk_tier_display() {
        assert_eq!(format!("{}", RiskTier::VeryHigh), "Very High");
        assert_eq!(format!("{}", RiskTier::Low), "Low");
    }
}
