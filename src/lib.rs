//! Sliding Gate - Sliding Window Rate Limiting
//!
//! This crate decides, for every inbound request, whether a client may
//! proceed based on a bounded quota over a sliding time window. Windows are
//! kept either in a shared Redis sorted set, so every service instance
//! enforces one quota, or in process memory for single-instance deployments.
//! Backend outages fail open.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod telemetry;
