//! Destination-market resale valuation tiers.
//!
//! Each tier implements [`ValuationTier`]: given a make/model/year it
//! returns an estimate, `Ok(None)` when it has no data for the vehicle, or
//! an error when the tier itself failed. The cascade in
//! [`crate::engine::valuer`] treats the last two identically and moves on.

pub mod classic_api;
pub mod classic_web;
pub mod synthetic;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;

use crate::types::{ValuationEstimate, VehicleQuery};

/// One strategy in the valuation fallback chain.
#[async_trait]
pub trait ValuationTier: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this tier hits a remote endpoint (and so is rate limited).
    fn is_live(&self) -> bool;

    /// Upper bound on one lookup; a slower lookup counts as no data.
    fn timeout(&self) -> Duration;

    async fn try_fetch(&self, query: &VehicleQuery) -> Result<Option<ValuationEstimate>>;
}

/// Parse a dollar amount such as "$18,500" or "18500.00".
pub(crate) fn parse_usd(text: &str) -> Option<Decimal> {
    let clean: String = text
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',')
        .collect();
    clean.trim().parse::<Decimal>().ok().filter(|v| *v > Decimal::ZERO)
}
