//! Redlimit - Distributed Rate Limiting over Redis
//!
//! This crate admits or rejects hits against named budgets shared by any
//! number of processes. Counting state lives in Redis; every check-and-count
//! step runs as a single server-side script or MULTI/EXEC transaction, so
//! concurrent callers never over-admit. Fixed and sliding windows are
//! supported.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use config::{Algorithm, Execution, LimiterOptions, Settings};
pub use error::{LimiterError, Result};
pub use ratelimit::{HitResult, RateLimiter};
