//! Hetzner Robot dedicated server provider.
//!
//! Implements the [`Provider`](crate::providers::Provider) trait for the
//! Hetzner Robot API. Dedicated servers usually carry several disks, so
//! bootstrap requires an explicit disk selection for them.

mod client;
mod models;

pub use client::Hetzner;
pub use models::*;
