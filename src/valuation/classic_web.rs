//! HTML aggregation valuation tier (second tier).
//!
//! Page: `GET https://classic.com/search?q=<make model year>`
//! Collects the prices of every `.search-result-item` that exactly matches
//! the vehicle and reports min/max/mean over that sample.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use tracing::debug;

use super::{parse_usd, ValuationTier};
use crate::config::EndpointConfig;
use crate::sources::BROWSER_USER_AGENT;
use crate::types::{Provenance, ValuationEstimate, VehicleQuery};

pub struct ClassicWebTier {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl ClassicWebTier {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout())
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .context("Failed to build valuation web HTTP client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
        })
    }
}

#[async_trait]
impl ValuationTier for ClassicWebTier {
    fn name(&self) -> &str {
        "classic.com web"
    }

    fn is_live(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn try_fetch(&self, query: &VehicleQuery) -> Result<Option<ValuationEstimate>> {
        let url = format!(
            "{}/search?q={}",
            self.base_url,
            urlencoding::encode(&query.search_text())
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("Valuation web request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("Valuation web error: {status}");
        }
        let html = resp.text().await.context("Failed to read valuation page")?;
        Ok(aggregate(&matching_prices(&html, query)))
    }
}

fn text_of(item: &ElementRef<'_>, selector: &Selector) -> String {
    item.select(selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

/// Prices of the result items that exactly match `query`.
pub fn matching_prices(html: &str, query: &VehicleQuery) -> Vec<Decimal> {
    let selectors = (
        Selector::parse(".search-result-item"),
        Selector::parse(".make"),
        Selector::parse(".model"),
        Selector::parse(".year"),
        Selector::parse(".price"),
    );
    let (Ok(item), Ok(make), Ok(model), Ok(year), Ok(price)) = selectors else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    document
        .select(&item)
        .filter_map(|el| {
            let item_year: i32 = text_of(&el, &year).parse().ok()?;
            if !query.matches(&text_of(&el, &make), &text_of(&el, &model), item_year) {
                return None;
            }
            parse_usd(&text_of(&el, &price))
        })
        .collect()
}

/// min/max/mean over the sample; `None` for an empty sample.
pub fn aggregate(prices: &[Decimal]) -> Option<ValuationEstimate> {
    let low = prices.iter().min().copied()?;
    let high = prices.iter().max().copied()?;
    let sum: Decimal = prices.iter().sum();
    let average = (sum / Decimal::from(prices.len())).round_dp(2);
    debug!(samples = prices.len(), %low, %high, %average, "Aggregated web valuation");
    Some(ValuationEstimate {
        low: Some(low),
        high: Some(high),
        average: Some(average),
        currency: "USD".to_string(),
        provenance: Provenance::WebAggregate {
            sample_size: prices.len(),
        },
        fetched_at: Utc::now(),
    })
}
