//! Hetzner Cloud provider.
//!
//! Cloud servers have a single root disk, so bootstrap picks it automatically.

mod client;
mod models;

pub use client::HetznerCloud;
pub use models::*;
