//! Sluice - Multi-Window Rate Throttling
//!
//! This crate implements an async rate throttler that enforces several
//! `(window, max_count)` limits at once. Recent executions are tracked in a
//! single fixed-size circular buffer, and callers are suspended until one more
//! execution fits every configured limit.

pub mod config;
pub mod error;
pub mod throttle;
