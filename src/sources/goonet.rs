//! Goo-net listing provider.
//!
//! Scrapes the public used-car search page and parses each
//! `.usedcar-list-item` card. Prices are shown either in plain yen or in
//! 万円 units (×10 000).
//!
//! Page: `https://www.goo-net.com/usedcar/search/`
//! Auth: none. Optional `maker` filter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Url};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{parse_digits, ListingProvider, BROWSER_USER_AGENT};
use crate::config::EndpointConfig;
use crate::types::{ListingRecord, SearchParams, VehicleAttributes};

const SEARCH_PATH: &str = "/usedcar/search/";
const SOURCE_NAME: &str = "Goo-net";

pub struct GooNetProvider {
    http: Client,
    base_url: Url,
    timeout: Duration,
}

impl GooNetProvider {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout())
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .context("Failed to build Goo-net HTTP client")?;
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid Goo-net base URL: {}", config.base_url))?;
        Ok(Self {
            http,
            base_url,
            timeout: config.timeout(),
        })
    }

    async fn fetch_page(&self, params: &SearchParams) -> Result<String> {
        let url = self
            .base_url
            .join(SEARCH_PATH)
            .context("Failed to build Goo-net search URL")?;

        let mut req = self.http.get(url);
        if let Some(make) = &params.make {
            req = req.query(&[("maker", make.as_str())]);
        }

        let resp = req.send().await.context("Goo-net request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("Goo-net returned {status}");
        }
        resp.text().await.context("Failed to read Goo-net page")
    }
}

#[async_trait]
impl ListingProvider for GooNetProvider {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch(&self, params: &SearchParams) -> Result<Vec<ListingRecord>> {
        let html = self.fetch_page(params).await?;
        let listings = parse_listing_page(&html, &self.base_url);
        info!(count = listings.len(), "Goo-net listings parsed");
        Ok(listings)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a yen price. "189.8万円" → 1 898 000, "¥1,250,000" → 1 250 000.
pub fn parse_price(text: &str) -> Option<i64> {
    let clean: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut price = Decimal::from_str(&clean).ok()?;
    if text.contains('万') {
        price *= Decimal::from(10_000);
    }
    let price = price.trunc().to_i64()?;
    (price > 0).then_some(price)
}

/// Parse an odometer reading. "4.2万km" → 42 000, "63,000 km" → 63 000.
pub fn parse_mileage(text: &str) -> Option<u32> {
    let km = if text.contains('万') {
        u64::try_from(parse_price(text)?).ok()?
    } else {
        parse_digits(text)?
    };
    u32::try_from(km).ok().filter(|km| *km > 0)
}

fn parse_year(text: &str) -> Option<i32> {
    let year = i32::try_from(parse_digits(text)?).ok()?;
    (1900..=2100).contains(&year).then_some(year)
}

struct CardSelectors {
    item: Selector,
    make: Selector,
    model: Selector,
    year: Selector,
    price: Selector,
    mileage: Selector,
    location: Selector,
    link: Selector,
}

impl CardSelectors {
    fn new() -> Option<Self> {
        Some(Self {
            item: Selector::parse(".usedcar-list-item").ok()?,
            make: Selector::parse(".maker-name").ok()?,
            model: Selector::parse(".model-name").ok()?,
            year: Selector::parse(".year").ok()?,
            price: Selector::parse(".price").ok()?,
            mileage: Selector::parse(".mileage").ok()?,
            location: Selector::parse(".location").ok()?,
            link: Selector::parse("a[href]").ok()?,
        })
    }
}

fn text_of(card: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse every listing card on a search page. Cards missing make, model,
/// year, a positive price, or a link are dropped.
pub fn parse_listing_page(html: &str, base_url: &Url) -> Vec<ListingRecord> {
    let Some(sel) = CardSelectors::new() else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let now = Utc::now();

    let mut out = Vec::new();
    for (index, card) in document.select(&sel.item).enumerate() {
        let parsed = (|| {
            let make = text_of(&card, &sel.make)?;
            let model = text_of(&card, &sel.model)?;
            let year = parse_year(&text_of(&card, &sel.year)?)?;
            let price = parse_price(&text_of(&card, &sel.price)?)?;
            let href = card.select(&sel.link).next()?.value().attr("href")?;
            let url = base_url.join(href).ok()?;
            Some(ListingRecord {
                make,
                model,
                year,
                mileage: text_of(&card, &sel.mileage).and_then(|m| parse_mileage(&m)),
                condition: None,
                price,
                source: SOURCE_NAME.to_string(),
                url: url.to_string(),
                listed_at: now,
                attributes: VehicleAttributes {
                    location: text_of(&card, &sel.location),
                    ..VehicleAttributes::default()
                },
            })
        })();

        match parsed {
            Some(listing) => out.push(listing),
            None => debug!(index, "Dropping unparseable Goo-net card"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <div class="usedcar-list-item">
            <a href="/usedcar/spread/goo/700101.html">
              <span class="maker-name">Toyota</span>
              <span class="model-name">Prius</span>
            </a>
            <span class="year">2019年</span>
            <span class="price">189.8万円</span>
            <span class="mileage">4.2万km</span>
            <span class="location">Tokyo</span>
          </div>
          <div class="usedcar-list-item">
            <a href="https://www.goo-net.com/usedcar/spread/goo/700102.html">
              <span class="maker-name">Honda</span>
              <span class="model-name">Fit</span>
            </a>
            <span class="year">2016</span>
            <span class="price">¥980,000</span>
            <span class="mileage">63,000 km</span>
          </div>
          <div class="usedcar-list-item">
            <a href="/usedcar/spread/goo/700103.html">
              <span class="maker-name">Nissan</span>
              <span class="model-name">Note</span>
            </a>
            <span class="year">2018</span>
            <span class="price">ASK</span>
          </div>
          <div class="usedcar-list-item">
            <span class="maker-name">Mazda</span>
            <span class="model-name">CX-5</span>
            <span class="year">unknown</span>
            <span class="price">150万円</span>
          </div>
        </body></html>
    "#;

    fn base() -> Url {
        Url::parse("https://www.goo-net.com").unwrap()
    }

    #[test]
    fn test_parse_price_man_units() {
        assert_eq!(parse_price("189.8万円"), Some(1_898_000));
        assert_eq!(parse_price("150万円"), Some(1_500_000));
        assert_eq!(parse_price("¥1,250,000"), Some(1_250_000));
        assert_eq!(parse_price("ASK"), None);
        assert_eq!(parse_price("0円"), None);
    }

    #[test]
    fn test_parse_mileage() {
        assert_eq!(parse_mileage("63,000 km"), Some(63_000));
        assert_eq!(parse_mileage("4.2万km"), Some(42_000));
        assert_eq!(parse_mileage("---"), None);
    }

    #[test]
    fn test_parse_listing_page_drops_bad_cards() {
        let listings = parse_listing_page(PAGE, &base());
        assert_eq!(listings.len(), 2);

        let prius = &listings[0];
        assert_eq!(prius.make, "Toyota");
        assert_eq!(prius.model, "Prius");
        assert_eq!(prius.year, 2019);
        assert_eq!(prius.price, 1_898_000);
        assert_eq!(prius.url, "https://www.goo-net.com/usedcar/spread/goo/700101.html");
        assert_eq!(prius.mileage, Some(42_000));
        assert_eq!(prius.attributes.location.as_deref(), Some("Tokyo"));
        assert_eq!(prius.source, "Goo-net");
        assert!(!prius.is_synthetic());

        let fit = &listings[1];
        assert_eq!(fit.price, 980_000);
        assert_eq!(fit.mileage, Some(63_000));
    }

    #[test]
    fn test_parse_empty_page() {
        assert!(parse_listing_page("<html></html>", &base()).is_empty());
    }
}
