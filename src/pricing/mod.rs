//! Pricing inputs shared between the profitability engine and the jobs
//! that update them.
//!
//! The exchange-rate pair and cost parameters are the only mutable state
//! shared across concurrent jobs. They live behind [`SharedPricing`], a
//! read-copy-update handle: readers clone an `Arc` snapshot and never hold
//! the lock while scoring, writers validate first and then swap.

pub mod profitability;
pub mod rates;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::types::ArbError;

// ---------------------------------------------------------------------------
// Cost parameters
// ---------------------------------------------------------------------------

/// Flat fees (destination currency) and rates (fractions) applied to every
/// import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostParameters {
    pub shipping: Decimal,
    pub insurance_rate: Decimal,
    pub customs_duty_rate: Decimal,
    pub vat_rate: Decimal,
    pub clearance: Decimal,
    pub local_transport: Decimal,
    pub documentation: Decimal,
    /// Target margin surfaced to operators; not used by the score.
    pub target_margin: Decimal,
}

impl Default for CostParameters {
    fn default() -> Self {
        Self {
            shipping: dec!(1500),
            insurance_rate: dec!(0.02),
            customs_duty_rate: dec!(0.25),
            vat_rate: dec!(0.15),
            clearance: dec!(500),
            local_transport: dec!(300),
            documentation: dec!(200),
            target_margin: dec!(0.20),
        }
    }
}

/// Upper bound on the customs duty rate (300%).
const MAX_DUTY_RATE: Decimal = dec!(3);

impl CostParameters {
    pub fn validate(&self) -> Result<(), ArbError> {
        let fees = [
            ("shipping", self.shipping),
            ("clearance", self.clearance),
            ("local_transport", self.local_transport),
            ("documentation", self.documentation),
        ];
        for (name, value) in fees {
            if value.is_sign_negative() {
                return Err(ArbError::InvalidConfig(format!("{name} must be >= 0, got {value}")));
            }
        }

        let unit_rates = [
            ("insurance_rate", self.insurance_rate),
            ("vat_rate", self.vat_rate),
            ("target_margin", self.target_margin),
        ];
        for (name, value) in unit_rates {
            if value < Decimal::ZERO || value > Decimal::ONE {
                return Err(ArbError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }

        if self.customs_duty_rate < Decimal::ZERO || self.customs_duty_rate > MAX_DUTY_RATE {
            return Err(ArbError::InvalidConfig(format!(
                "customs_duty_rate must be within [0, {MAX_DUTY_RATE}], got {}",
                self.customs_duty_rate
            )));
        }
        Ok(())
    }

    /// Merge a partial update over these parameters.
    pub fn merged(&self, update: &CostUpdate) -> Self {
        Self {
            shipping: update.shipping.unwrap_or(self.shipping),
            insurance_rate: update.insurance_rate.unwrap_or(self.insurance_rate),
            customs_duty_rate: update.customs_duty_rate.unwrap_or(self.customs_duty_rate),
            vat_rate: update.vat_rate.unwrap_or(self.vat_rate),
            clearance: update.clearance.unwrap_or(self.clearance),
            local_transport: update.local_transport.unwrap_or(self.local_transport),
            documentation: update.documentation.unwrap_or(self.documentation),
            target_margin: update.target_margin.unwrap_or(self.target_margin),
        }
    }
}

/// Partial cost-parameter update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostUpdate {
    pub shipping: Option<Decimal>,
    pub insurance_rate: Option<Decimal>,
    pub customs_duty_rate: Option<Decimal>,
    pub vat_rate: Option<Decimal>,
    pub clearance: Option<Decimal>,
    pub local_transport: Option<Decimal>,
    pub documentation: Option<Decimal>,
    pub target_margin: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Exchange rates
// ---------------------------------------------------------------------------

/// Point-in-time source/destination rate pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeRates {
    /// 1 unit of source currency in destination currency (JPY→USD).
    pub source_to_destination: Decimal,
    /// 1 unit of destination currency in source currency (USD→JPY).
    pub destination_to_source: Decimal,
    pub as_of: Option<DateTime<Utc>>,
}

impl Default for ExchangeRates {
    fn default() -> Self {
        Self {
            source_to_destination: dec!(0.0067),
            destination_to_source: dec!(149.25),
            as_of: None,
        }
    }
}

impl ExchangeRates {
    /// Build a pair from a quote of source units per destination unit
    /// (e.g. `rates.JPY` against a USD base).
    pub fn from_quote(source_per_destination: Decimal) -> Result<Self, ArbError> {
        if source_per_destination <= Decimal::ZERO {
            return Err(ArbError::InvalidRate {
                pair: "USD_TO_JPY".into(),
                value: source_per_destination.to_string(),
            });
        }
        Ok(Self {
            source_to_destination: (Decimal::ONE / source_per_destination).round_dp(10),
            destination_to_source: source_per_destination,
            as_of: Some(Utc::now()),
        })
    }

    pub fn validate(&self) -> Result<(), ArbError> {
        if self.source_to_destination <= Decimal::ZERO {
            return Err(ArbError::InvalidRate {
                pair: "JPY_TO_USD".into(),
                value: self.source_to_destination.to_string(),
            });
        }
        if self.destination_to_source <= Decimal::ZERO {
            return Err(ArbError::InvalidRate {
                pair: "USD_TO_JPY".into(),
                value: self.destination_to_source.to_string(),
            });
        }
        Ok(())
    }

    pub fn to_destination(&self, source_amount: Decimal) -> Decimal {
        source_amount * self.source_to_destination
    }

    pub fn to_source(&self, destination_amount: Decimal) -> Decimal {
        destination_amount * self.destination_to_source
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Immutable view of the pricing inputs at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricingSnapshot {
    pub costs: CostParameters,
    pub rates: ExchangeRates,
}

/// Cloneable handle to the process-wide pricing inputs.
#[derive(Debug, Clone)]
pub struct SharedPricing {
    inner: Arc<RwLock<Arc<PricingSnapshot>>>,
}

impl SharedPricing {
    pub fn new(costs: CostParameters, rates: ExchangeRates) -> Result<Self, ArbError> {
        costs.validate()?;
        rates.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(PricingSnapshot { costs, rates }))),
        })
    }

    /// Current snapshot. Cheap; the lock is held only for the `Arc` clone.
    pub fn snapshot(&self) -> Arc<PricingSnapshot> {
        self.inner.read().clone()
    }

    /// Replace the exchange-rate pair. Invalid rates leave state untouched.
    pub fn set_rates(&self, rates: ExchangeRates) -> Result<(), ArbError> {
        rates.validate()?;
        let mut guard = self.inner.write();
        let next = PricingSnapshot {
            costs: guard.costs.clone(),
            rates,
        };
        info!(
            source_to_destination = %next.rates.source_to_destination,
            destination_to_source = %next.rates.destination_to_source,
            "Exchange rates updated"
        );
        *guard = Arc::new(next);
        Ok(())
    }

    /// Merge a partial cost update. Invalid results leave state untouched.
    pub fn update_costs(&self, update: &CostUpdate) -> Result<CostParameters, ArbError> {
        let mut guard = self.inner.write();
        let merged = guard.costs.merged(update);
        merged.validate()?;
        let next = PricingSnapshot {
            costs: merged.clone(),
            rates: guard.rates.clone(),
        };
        *guard = Arc::new(next);
        info!(?merged, "Cost parameters updated");
        Ok(merged)
    }
}

impl Default for SharedPricing {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(PricingSnapshot {
                costs: CostParameters::default(),
                rates: ExchangeRates::default(),
            }))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
