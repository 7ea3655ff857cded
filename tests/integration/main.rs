//! End-to-end tests against in-memory providers, tiers and stores.
//! No network access.

mod mock_sources;
mod pipeline_flow;
mod scheduler_flow;
