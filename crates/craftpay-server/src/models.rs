//! Domain models for the escrow engine.

pub mod order;
pub mod payment;

pub use order::{Order, OrderStatus};
pub use payment::{NewPayment, Payment, PaymentStatus, PaymentUpdate};
