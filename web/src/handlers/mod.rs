//! HTTP request handlers, grouped by resource.

pub mod callbacks;
pub mod health;
pub mod orders;
pub mod payments;
pub mod session;
