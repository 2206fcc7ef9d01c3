//! CraftPay Server - escrow payments for the CraftPay marketplace
//!
//! Collects buyer payments over M-Pesa, holds them until delivery is
//! confirmed, and pays the seller (or refunds the buyer) exactly once.

pub mod clock;
pub mod collection;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod orders;
pub mod reconciler;
pub mod release;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod store;

pub use error::AppError;
pub use routes::create_router;
pub use state::AppState;
