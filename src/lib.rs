//! Subscription billing payment gateway: provider adapters, the transaction
//! status machine, and the billing effects of a completed payment.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
