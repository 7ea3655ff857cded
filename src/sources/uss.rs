//! USS auction listing provider.
//!
//! API: `https://www.ussnet.co.jp/api/search`
//! Response: `{"results": [{"maker", "model", "year", "price", "mileage",
//! "grade", "auctionDate", "lotNumber"}]}`. The format is loosely
//! specified, so each item is decoded on its own and bad items are dropped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use super::{ListingProvider, BROWSER_USER_AGENT};
use crate::config::EndpointConfig;
use crate::types::{ListingRecord, SearchParams, VehicleAttributes};

const SEARCH_PATH: &str = "/api/search";
const SOURCE_NAME: &str = "USS Auction";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuctionItem {
    maker: String,
    model: String,
    year: i32,
    price: i64,
    #[serde(default)]
    mileage: Option<u32>,
    #[serde(default)]
    grade: Option<String>,
    #[serde(default)]
    auction_date: Option<String>,
    #[serde(default)]
    lot_number: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

pub struct UssAuctionProvider {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl UssAuctionProvider {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout())
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .context("Failed to build USS HTTP client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
        })
    }
}

#[async_trait]
impl ListingProvider for UssAuctionProvider {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch(&self, params: &SearchParams) -> Result<Vec<ListingRecord>> {
        let mut req = self.http.get(format!("{}{SEARCH_PATH}", self.base_url));
        if let Some(make) = &params.make {
            req = req.query(&[("maker", make.as_str())]);
        }
        if let Some(model) = &params.model {
            req = req.query(&[("model", model.as_str())]);
        }

        let resp = req.send().await.context("USS request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("USS API error: {status}");
        }

        let body = resp.text().await.context("Failed to read USS response")?;
        let listings = parse_results(&body, &self.base_url)?;
        info!(count = listings.len(), "USS auction listings parsed");
        Ok(listings)
    }
}

/// Decode a search response. A malformed envelope is an error; a
/// malformed item is dropped.
pub fn parse_results(body: &str, base_url: &str) -> Result<Vec<ListingRecord>> {
    let response: SearchResponse =
        serde_json::from_str(body).context("Failed to parse USS response")?;
    let now = Utc::now();

    let listings = response
        .results
        .into_iter()
        .enumerate()
        .filter_map(|(index, raw)| match serde_json::from_value::<AuctionItem>(raw) {
            Ok(item) if item.price > 0 && !item.maker.trim().is_empty() => {
                Some(to_listing(item, base_url, now))
            }
            Ok(_) => {
                debug!(index, "Dropping USS item without price or maker");
                None
            }
            Err(e) => {
                debug!(index, error = %e, "Dropping unparseable USS item");
                None
            }
        })
        .collect();
    Ok(listings)
}

fn to_listing(item: AuctionItem, base_url: &str, now: DateTime<Utc>) -> ListingRecord {
    let listed_at = item
        .auction_date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(now);

    // Items rarely carry a link; the lot number (or the vehicle itself)
    // stands in so the natural key stays stable across scrapes.
    let url = item.url.clone().unwrap_or_else(|| match &item.lot_number {
        Some(lot) => format!("{base_url}/lot/{}", urlencoding::encode(lot)),
        None => format!(
            "{base_url}{SEARCH_PATH}?maker={}&model={}&year={}&price={}",
            urlencoding::encode(&item.maker),
            urlencoding::encode(&item.model),
            item.year,
            item.price
        ),
    });

    ListingRecord {
        make: item.maker.trim().to_string(),
        model: item.model.trim().to_string(),
        year: item.year,
        mileage: item.mileage.filter(|km| *km > 0),
        condition: None,
        price: item.price,
        source: SOURCE_NAME.to_string(),
        url,
        listed_at,
        attributes: VehicleAttributes {
            auction_grade: item.grade,
            ..VehicleAttributes::default()
        },
    }
}
