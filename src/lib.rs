//! Farmhand: labour request fulfillment core.

pub mod config;
pub mod error;
pub mod labour;
pub mod store;
