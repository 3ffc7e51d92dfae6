//! Escrow & settlement engine for a pooled-purchase marketplace.
//!
//! Buyers pre-pay into a per-pool escrow; once delivery is confirmed and the
//! dispute grace period has elapsed, a saga releases the held funds to the
//! vendor through an external transfer provider, minus platform commission.

pub mod bootstrap;
pub mod config;
pub mod dispute;
pub mod error;
pub mod escrow;
pub mod notify;
pub mod settlement;
pub mod store;
pub mod transfer;
