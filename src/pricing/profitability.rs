//! Profitability engine.
//!
//! Pure, deterministic scoring of a priced listing against a resale
//! estimate: landed cost, profit, margin, ROI, a bucketed 0–100 score,
//! a recommendation flag, and a risk tier.
//!
//! The score is a sum of four independently capped buckets. Each bucket
//! awards the highest breakpoint whose threshold is met, with no
//! interpolation, so inputs near a breakpoint produce step changes.

use chrono::{Datelike, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use super::{PricingSnapshot, SharedPricing};
use crate::types::{CostBreakdown, Priced, ProfitabilityResult, RiskTier, ValuationEstimate};

// ---------------------------------------------------------------------------
// Score buckets
// ---------------------------------------------------------------------------

/// Margin % → points (max 40).
const MARGIN_BUCKETS: &[(Decimal, u8)] = &[
    (dec!(30), 40),
    (dec!(20), 30),
    (dec!(15), 20),
    (dec!(10), 10),
];

/// Absolute profit → points (max 30).
const PROFIT_BUCKETS: &[(Decimal, u8)] = &[
    (dec!(5000), 30),
    (dec!(3000), 25),
    (dec!(2000), 20),
    (dec!(1000), 15),
    (dec!(500), 10),
];

/// ROI % → points (max 20).
const ROI_BUCKETS: &[(Decimal, u8)] = &[
    (dec!(50), 20),
    (dec!(30), 15),
    (dec!(20), 10),
    (dec!(10), 5),
];

/// Vehicle age in years (upper bound) → points (max 5).
const AGE_BUCKETS: &[(i32, u8)] = &[(5, 5), (10, 3), (15, 1)];

/// Mileage in km (upper bound) → points (max 5).
const MILEAGE_BUCKETS: &[(u32, u8)] = &[(50_000, 5), (100_000, 3), (150_000, 1)];

const MAX_SCORE: u8 = 100;

/// Highest bucket whose threshold `value` meets or exceeds.
fn at_least(value: Decimal, buckets: &[(Decimal, u8)]) -> u8 {
    buckets
        .iter()
        .find(|(threshold, _)| value >= *threshold)
        .map(|(_, points)| *points)
        .unwrap_or(0)
}

/// Highest bucket whose upper bound `value` stays within.
fn at_most<T: PartialOrd + Copy>(value: T, buckets: &[(T, u8)]) -> u8 {
    buckets
        .iter()
        .find(|(limit, _)| value <= *limit)
        .map(|(_, points)| *points)
        .unwrap_or(0)
}

/// Inputs to the 0–100 score.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    pub margin: Decimal,
    pub profit: Decimal,
    pub roi: Decimal,
    pub age_years: i32,
    pub mileage: Option<u32>,
}

/// Additive bucketed score, clamped to [0, 100].
pub fn profitability_score(inputs: &ScoreInputs) -> u8 {
    let condition = at_most(inputs.age_years, AGE_BUCKETS)
        + inputs
            .mileage
            .filter(|km| *km > 0)
            .map(|km| at_most(km, MILEAGE_BUCKETS))
            .unwrap_or(0);

    let total = at_least(inputs.margin, MARGIN_BUCKETS) as u16
        + at_least(inputs.profit, PROFIT_BUCKETS) as u16
        + at_least(inputs.roi, ROI_BUCKETS) as u16
        + condition as u16;

    total.min(MAX_SCORE as u16) as u8
}

/// Risk tier from score and margin together.
pub fn risk_tier(score: u8, margin: Decimal) -> RiskTier {
    if score >= 80 && margin >= dec!(25) {
        RiskTier::Low
    } else if score >= 60 && margin >= dec!(15) {
        RiskTier::Medium
    } else if score >= 40 && margin >= dec!(10) {
        RiskTier::High
    } else {
        RiskTier::VeryHigh
    }
}

pub fn is_recommended(score: u8, margin: Decimal) -> bool {
    score >= 60 && margin >= dec!(15)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Scores listings against the current shared pricing inputs.
#[derive(Debug, Clone)]
pub struct ProfitabilityEngine {
    pricing: SharedPricing,
}

impl ProfitabilityEngine {
    pub fn new(pricing: SharedPricing) -> Self {
        Self { pricing }
    }

    pub fn pricing(&self) -> &SharedPricing {
        &self.pricing
    }

    /// Score a listing against a valuation. Returns `None` when either
    /// input is absent or the valuation carries no usable value.
    pub fn score<L: Priced>(
        &self,
        listing: Option<&L>,
        valuation: Option<&ValuationEstimate>,
    ) -> Option<ProfitabilityResult> {
        let (listing, valuation) = (listing?, valuation?);
        self.evaluate(listing, valuation)
    }

    /// Score against the current snapshot and calendar year.
    pub fn evaluate<L: Priced>(
        &self,
        listing: &L,
        valuation: &ValuationEstimate,
    ) -> Option<ProfitabilityResult> {
        let snapshot = self.pricing.snapshot();
        evaluate_with(&snapshot, listing, valuation, Utc::now().year())
    }
}

/// Landed-cost components for a vehicle priced at `price` (destination
/// currency). VAT applies to the duty-inclusive value.
pub fn cost_breakdown(snapshot: &PricingSnapshot, price: Decimal) -> CostBreakdown {
    let c = &snapshot.costs;
    let customs_duty = price * c.customs_duty_rate;
    CostBreakdown {
        shipping: c.shipping,
        insurance: price * c.insurance_rate,
        customs_duty,
        vat: (price + customs_duty) * c.vat_rate,
        clearance: c.clearance,
        local_transport: c.local_transport,
        documentation: c.documentation,
    }
}

/// Deterministic scoring against an explicit snapshot and reference year.
pub fn evaluate_with<L: Priced>(
    snapshot: &PricingSnapshot,
    listing: &L,
    valuation: &ValuationEstimate,
    current_year: i32,
) -> Option<ProfitabilityResult> {
    let expected_resale = valuation.usable_value()?;
    if listing.source_price() <= 0 {
        debug!(price = listing.source_price(), "Non-positive source price, skipping");
        return None;
    }

    let price_converted = snapshot
        .rates
        .to_destination(Decimal::from(listing.source_price()));
    let costs = cost_breakdown(snapshot, price_converted);
    let total_cost = price_converted + costs.total_additional();

    let gross_profit = expected_resale - total_cost;
    let profit_margin = gross_profit / total_cost * dec!(100);
    let roi = gross_profit / price_converted * dec!(100);

    let score = profitability_score(&ScoreInputs {
        margin: profit_margin,
        profit: gross_profit,
        roi,
        age_years: current_year - listing.year(),
        mileage: listing.mileage(),
    });

    Some(ProfitabilityResult {
        price_converted,
        costs,
        total_cost,
        expected_resale,
        gross_profit,
        profit_margin,
        roi,
        score,
        recommended: is_recommended(score, profit_margin),
        risk: risk_tier(score, profit_margin),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
