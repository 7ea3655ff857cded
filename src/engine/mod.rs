//! Core engine: acquire → valuate → score → reconcile.

pub mod acquirer;
pub mod pipeline;
pub mod reconciler;
pub mod throttle;
pub mod valuer;
