//! Synthetic valuation (last tier). Never fails.
//!
//! Known make/model pairs come from a curated table depreciated 5% per
//! year (floor 60%). Anything else gets a random base in
//! [15 000, 25 000) USD depreciated 8% per year (floor 50%), with low/high
//! at ±20%.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use std::time::Duration;

use super::ValuationTier;
use crate::types::{Provenance, ValuationEstimate, VehicleQuery};

/// (make, model, low, high, average) in USD for a current-year vehicle.
const CURATED: &[(&str, &str, Decimal, Decimal, Decimal)] = &[
    ("Toyota", "Prius", dec!(15000), dec!(25000), dec!(20000)),
    ("Toyota", "Camry", dec!(18000), dec!(28000), dec!(23000)),
    ("Toyota", "Corolla", dec!(12000), dec!(20000), dec!(16000)),
    ("Honda", "Civic", dec!(14000), dec!(22000), dec!(18000)),
    ("Honda", "Accord", dec!(16000), dec!(26000), dec!(21000)),
    ("Honda", "CR-V", dec!(20000), dec!(32000), dec!(26000)),
    ("Nissan", "Altima", dec!(13000), dec!(21000), dec!(17000)),
    ("Mazda", "Mazda3", dec!(12000), dec!(19000), dec!(15500)),
    ("Subaru", "Outback", dec!(18000), dec!(30000), dec!(24000)),
];

const CURATED_RATE: Decimal = dec!(0.05);
const CURATED_FLOOR: Decimal = dec!(0.6);
const GENERATED_RATE: Decimal = dec!(0.08);
const GENERATED_FLOOR: Decimal = dec!(0.5);
const GENERATED_BASE_MIN: f64 = 15_000.0;
const GENERATED_BASE_SPAN: f64 = 10_000.0;

fn whole_dollars(d: Decimal) -> Decimal {
    d.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

fn age_factor(age: i32, rate: Decimal, floor: Decimal) -> Decimal {
    (Decimal::ONE - Decimal::from(age) * rate).max(floor)
}

pub struct SyntheticValuation {
    rng: Mutex<StdRng>,
}

impl Default for SyntheticValuation {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticValuation {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn estimate(&self, query: &VehicleQuery) -> ValuationEstimate {
        self.estimate_for_year(query, Utc::now().year())
    }

    pub fn estimate_for_year(&self, query: &VehicleQuery, current_year: i32) -> ValuationEstimate {
        let age = current_year - query.year;
        let curated = CURATED.iter().find(|(make, model, ..)| {
            make.eq_ignore_ascii_case(query.make.trim()) && model.eq_ignore_ascii_case(query.model.trim())
        });

        let (low, high, average, provenance) = match curated {
            Some((_, _, low, high, avg)) => {
                let f = age_factor(age, CURATED_RATE, CURATED_FLOOR);
                (
                    whole_dollars(low * f),
                    whole_dollars(high * f),
                    whole_dollars(avg * f),
                    Provenance::CuratedTable,
                )
            }
            None => {
                let raw: f64 = GENERATED_BASE_MIN + self.rng.lock().gen::<f64>() * GENERATED_BASE_SPAN;
                let base = Decimal::try_from(raw).unwrap_or(dec!(20000));
                let adjusted = base * age_factor(age, GENERATED_RATE, GENERATED_FLOOR);
                (
                    whole_dollars(adjusted * dec!(0.8)),
                    whole_dollars(adjusted * dec!(1.2)),
                    whole_dollars(adjusted),
                    Provenance::Generated,
                )
            }
        };

        ValuationEstimate {
            low: Some(low),
            high: Some(high),
            average: Some(average),
            currency: "USD".to_string(),
            provenance,
            fetched_at: Utc::now(),
        }
    }
}

#[async_trait]
impl ValuationTier for SyntheticValuation {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn is_live(&self) -> bool {
        false
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn try_fetch(&self, query: &VehicleQuery) -> Result<Option<ValuationEstimate>> {
        Ok(Some(self.estimate(query)))
    }
}
