//! Foreign-market listing providers.
//!
//! Defines the `ListingProvider` trait and the concrete providers: Goo-net
//! (HTML listing page), USS auction (JSON search API), and the synthetic
//! generator used when no live provider yields data.

pub mod goonet;
pub mod synthetic;
pub mod uss;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use crate::types::{ListingRecord, SearchParams};

/// Abstraction over a source of raw listings.
///
/// A provider returns whatever it could parse; items with missing or
/// unparseable required fields are dropped by the provider itself. An
/// `Err` means the provider as a whole failed (network, status, payload).
#[async_trait]
pub trait ListingProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Whether this provider hits a remote endpoint.
    fn is_live(&self) -> bool {
        true
    }

    /// Upper bound on one fetch; a slower fetch counts as a failure.
    fn timeout(&self) -> Duration;

    async fn fetch(&self, params: &SearchParams) -> Result<Vec<ListingRecord>>;
}

/// Browser-like UA; both listing sites reject obvious bot agents.
pub(crate) const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Digits-only integer from free text, e.g. "45,000 km" → 45000.
pub(crate) fn parse_digits(text: &str) -> Option<u64> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}
