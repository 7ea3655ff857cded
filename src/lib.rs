//! CARBITRAGE: vehicle import arbitrage pipeline
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod sources;
pub mod valuation;
pub mod pricing;
pub mod storage;
pub mod engine;
pub mod scheduler;
pub mod dashboard;
