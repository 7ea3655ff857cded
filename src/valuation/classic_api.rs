//! Remote structured valuation API (first tier).
//!
//! API: `GET https://api.classic.com/search?q=<make model year>&type=vehicle`
//! Auth: optional bearer key (`valuation.api.api_key_env`).
//! Only an exact make/model/year match carrying a `valuation` object counts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::ValuationTier;
use crate::config::EndpointConfig;
use crate::sources::BROWSER_USER_AGENT;
use crate::types::{Provenance, ValuationEstimate, VehicleQuery};

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct VehicleResult {
    make: String,
    model: String,
    year: i32,
    #[serde(default)]
    valuation: Option<Valuation>,
}

#[derive(Debug, Deserialize)]
struct Valuation {
    #[serde(default)]
    low: Option<f64>,
    #[serde(default)]
    high: Option<f64>,
    #[serde(default)]
    average: Option<f64>,
}

pub struct ClassicApiTier {
    http: Client,
    base_url: String,
    timeout: Duration,
    api_key: Option<SecretString>,
}

impl ClassicApiTier {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout())
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .context("Failed to build valuation API HTTP client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
            api_key: config.api_key(),
        })
    }
}

#[async_trait]
impl ValuationTier for ClassicApiTier {
    fn name(&self) -> &str {
        "classic.com API"
    }

    fn is_live(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn try_fetch(&self, query: &VehicleQuery) -> Result<Option<ValuationEstimate>> {
        let text = query.search_text();
        let mut req = self
            .http
            .get(format!("{}/search", self.base_url))
            .query(&[("q", text.as_str()), ("type", "vehicle")]);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req.send().await.context("Valuation API request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("Valuation API error: {status}");
        }

        let body = resp
            .text()
            .await
            .context("Failed to read valuation API response")?;
        parse_response(&body, query)
    }
}

fn to_decimal(v: Option<f64>) -> Option<Decimal> {
    v.and_then(|f| Decimal::try_from(f).ok()).map(|d| d.round_dp(2))
}

/// Find the exact match for `query` in a search response.
pub fn parse_response(body: &str, query: &VehicleQuery) -> Result<Option<ValuationEstimate>> {
    let response: SearchResponse =
        serde_json::from_str(body).context("Failed to parse valuation API response")?;

    let exact = response
        .results
        .into_iter()
        .filter_map(|raw| serde_json::from_value::<VehicleResult>(raw).ok())
        .find(|r| query.matches(&r.make, &r.model, r.year));

    let Some(valuation) = exact.and_then(|r| r.valuation) else {
        debug!(vehicle = %query.search_text(), "No exact API match");
        return Ok(None);
    };

    let estimate = ValuationEstimate {
        low: to_decimal(valuation.low),
        high: to_decimal(valuation.high),
        average: to_decimal(valuation.average),
        currency: "USD".to_string(),
        provenance: Provenance::RemoteApi,
        fetched_at: Utc::now(),
    };
    // An estimate with nothing usable is no data, so the next tier runs.
    Ok(estimate.usable_value().is_some().then_some(estimate))
}
