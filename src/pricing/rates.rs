//! Exchange-rate provider.
//!
//! Fetches a public snapshot of rates against the destination currency
//! and installs the source/destination pair into [`SharedPricing`].
//!
//! API: `https://api.exchangerate-api.com/v4/latest/USD`
//! Auth: none.
//! Response: `{"base": "USD", "rates": {"JPY": 149.25, ...}}`

use anyhow::{Context, Result};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::{ExchangeRates, SharedPricing};

#[derive(Debug, Deserialize)]
struct RateSnapshot {
    #[serde(default)]
    rates: HashMap<String, f64>,
}

pub struct ExchangeRateClient {
    http: Client,
    url: String,
    /// Quote symbol looked up in `rates`, e.g. "JPY".
    symbol: String,
}

impl ExchangeRateClient {
    pub fn new(url: &str, symbol: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("CARBITRAGE/0.1.0")
            .build()
            .context("Failed to build exchange-rate HTTP client")?;
        Ok(Self {
            http,
            url: url.to_string(),
            symbol: symbol.to_string(),
        })
    }

    /// Fetch the current quote (source units per destination unit).
    pub async fn fetch_quote(&self) -> Result<Decimal> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .context("Exchange-rate request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("Exchange-rate API error: {status}");
        }

        let body = resp
            .text()
            .await
            .context("Failed to read exchange-rate response")?;
        parse_quote(&body, &self.symbol)
    }

    /// Fetch and install new rates. On any failure the shared pricing is
    /// left as it was and the error is returned to the caller.
    pub async fn refresh(&self, pricing: &SharedPricing) -> Result<ExchangeRates> {
        let quote = self.fetch_quote().await?;
        debug!(symbol = %self.symbol, %quote, "Exchange-rate quote received");
        let rates = ExchangeRates::from_quote(quote)?;
        pricing.set_rates(rates.clone())?;
        info!(
            symbol = %self.symbol,
            destination_to_source = %rates.destination_to_source,
            "Exchange rates refreshed"
        );
        Ok(rates)
    }
}

/// Extract `rates.<symbol>` from a snapshot body.
pub fn parse_quote(body: &str, symbol: &str) -> Result<Decimal> {
    let snapshot: RateSnapshot =
        serde_json::from_str(body).context("Failed to parse exchange-rate response")?;
    let raw = snapshot
        .rates
        .get(symbol)
        .copied()
        .with_context(|| format!("Rate for {symbol} missing from response"))?;
    let quote = Decimal::try_from(raw)
        .with_context(|| format!("Rate for {symbol} is not a finite number: {raw}"))?;
    Ok(quote.round_dp(6))
}
