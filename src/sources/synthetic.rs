//! Synthetic listing generator.
//!
//! Produces statistically plausible JPY listings when no live provider
//! yields data. Every record's source tag starts with `Mock ` so callers
//! can tell synthetic data apart. Seedable for deterministic tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use std::time::Duration;

use super::ListingProvider;
use crate::types::{ListingRecord, SearchParams, VehicleAttributes};

// ---------------------------------------------------------------------------
// Catalogue
// ---------------------------------------------------------------------------

const CATALOGUE: &[(&str, &[&str])] = &[
    ("Toyota", &["Prius", "Camry", "Corolla", "RAV4", "Highlander", "Land Cruiser", "Vitz"]),
    ("Honda", &["Civic", "Accord", "CR-V", "Fit", "Pilot", "Odyssey", "HR-V"]),
    ("Nissan", &["Altima", "Sentra", "Rogue", "Pathfinder", "Murano", "Note", "March"]),
    ("Mazda", &["Mazda3", "Mazda6", "CX-5", "CX-9", "MX-5", "Demio", "Axela"]),
    ("Subaru", &["Outback", "Forester", "Impreza", "Legacy", "XV", "Levorg", "WRX"]),
    ("Mitsubishi", &["Outlander", "Lancer", "Pajero", "Eclipse", "Mirage"]),
    ("Suzuki", &["Swift", "Vitara", "Jimny", "Alto", "Wagon R"]),
];

const PREMIUM_MAKES: &[&str] = &["Toyota", "Honda", "Subaru"];
const POPULAR_MODELS: &[&str] = &["Prius", "Civic", "Corolla", "CR-V"];

const CONDITIONS: &[(&str, f64)] = &[("Excellent", 0.1), ("Good", 0.4), ("Fair", 0.4), ("Poor", 0.1)];
const FUEL_TYPES: &[(&str, f64)] = &[("Gasoline", 0.6), ("Hybrid", 0.25), ("Diesel", 0.1), ("Electric", 0.05)];
const TRANSMISSIONS: &[(&str, f64)] = &[("Automatic", 0.7), ("Manual", 0.2), ("CVT", 0.1)];
const BODY_TYPES: &[(&str, f64)] = &[
    ("Sedan", 0.3),
    ("Hatchback", 0.25),
    ("SUV", 0.2),
    ("Wagon", 0.15),
    ("Coupe", 0.08),
    ("Convertible", 0.02),
];
const COLORS: &[(&str, f64)] = &[
    ("White", 0.3),
    ("Black", 0.25),
    ("Silver", 0.15),
    ("Gray", 0.1),
    ("Blue", 0.08),
    ("Red", 0.07),
    ("Green", 0.03),
    ("Yellow", 0.02),
];
const ENGINE_SIZES: &[&str] = &["1.0L", "1.3L", "1.5L", "1.8L", "2.0L", "2.4L", "3.0L", "3.5L"];
const LOCATIONS: &[&str] = &["Tokyo", "Osaka", "Nagoya", "Yokohama", "Kobe", "Fukuoka", "Sapporo"];
const SOURCES: &[&str] = &["Mock Goo-net", "Mock USS Auction", "Mock JAA", "Mock TAA"];

const MIN_YEAR: i32 = 2010;
const MAX_MILEAGE_KM: f64 = 200_000.0;
const BASE_PRICE_JPY: f64 = 2_000_000.0;
const ANNUAL_DEPRECIATION: f64 = 0.15;
const PRICE_FLOOR_JPY: f64 = 300_000.0;

pub const MOCK_URL_BASE: &str = "https://mock-auction.jp/car";

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

pub struct SyntheticListings {
    rng: Mutex<StdRng>,
    default_count: usize,
}

impl SyntheticListings {
    pub fn new(default_count: usize) -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
            default_count,
        }
    }

    pub fn seeded(seed: u64, default_count: usize) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            default_count,
        }
    }

    /// Generate `count` listings aged against the current calendar year.
    pub fn generate(&self, count: usize) -> Vec<ListingRecord> {
        self.generate_for_year(count, Utc::now().year())
    }

    pub fn generate_for_year(&self, count: usize, current_year: i32) -> Vec<ListingRecord> {
        let mut rng = self.rng.lock();
        (0..count)
            .map(|i| generate_one(&mut *rng, i + 1, current_year))
            .collect()
    }
}

fn pick<'a, R: Rng>(rng: &mut R, items: &[&'a str]) -> &'a str {
    items.choose(rng).copied().unwrap_or_default()
}

fn weighted<'a, R: Rng>(rng: &mut R, items: &[(&'a str, f64)]) -> &'a str {
    match WeightedIndex::new(items.iter().map(|(_, w)| *w)) {
        Ok(dist) => items[dist.sample(rng)].0,
        Err(_) => items.first().map(|(name, _)| *name).unwrap_or_default(),
    }
}

/// Year in [MIN_YEAR, current_year], skewed toward newer cars.
fn biased_year<R: Rng>(rng: &mut R, current_year: i32) -> i32 {
    let range = (current_year - MIN_YEAR + 1).max(1) as f64;
    let u: f64 = rng.gen();
    (MIN_YEAR + (u.sqrt() * range).floor() as i32).min(current_year.max(MIN_YEAR))
}

/// Asking price in JPY before noise.
pub fn base_price(make: &str, model: &str, age_years: i32, mileage_km: u32) -> f64 {
    let mut price = BASE_PRICE_JPY;
    if PREMIUM_MAKES.contains(&make) {
        price *= 1.2;
    }
    if POPULAR_MODELS.contains(&model) {
        price *= 1.15;
    }
    price *= (1.0 - ANNUAL_DEPRECIATION).powi(age_years.max(0));
    price * (1.0 - mileage_km as f64 / 300_000.0).max(0.5)
}

fn generate_one<R: Rng>(rng: &mut R, index: usize, current_year: i32) -> ListingRecord {
    let (make, models) = CATALOGUE.choose(rng).copied().unwrap_or(CATALOGUE[0]);
    let model = pick(rng, models);
    let year = biased_year(rng, current_year);
    let mileage = (rng.gen::<f64>() * MAX_MILEAGE_KM).floor() as u32;

    let noise = rng.gen_range(0.8..1.2);
    let price = (base_price(make, model, current_year - year, mileage) * noise)
        .max(PRICE_FLOOR_JPY)
        .floor() as i64;

    ListingRecord {
        make: make.to_string(),
        model: model.to_string(),
        year,
        mileage: Some(mileage),
        condition: Some(weighted(rng, CONDITIONS).to_string()),
        price,
        source: pick(rng, SOURCES).to_string(),
        url: format!("{MOCK_URL_BASE}/{index}"),
        listed_at: Utc::now(),
        attributes: VehicleAttributes {
            engine_size: Some(pick(rng, ENGINE_SIZES).to_string()),
            fuel_type: Some(weighted(rng, FUEL_TYPES).to_string()),
            transmission: Some(weighted(rng, TRANSMISSIONS).to_string()),
            body_type: Some(weighted(rng, BODY_TYPES).to_string()),
            color: Some(weighted(rng, COLORS).to_string()),
            location: Some(pick(rng, LOCATIONS).to_string()),
            auction_grade: None,
        },
    }
}

#[async_trait]
impl ListingProvider for SyntheticListings {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn is_live(&self) -> bool {
        false
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn fetch(&self, _params: &SearchParams) -> Result<Vec<ListingRecord>> {
        Ok(self.generate(self.default_count))
    }
}
