//! Upstream bus: the single shared connection and its listener.

pub mod holder;
pub mod listener;

pub use holder::{BusHolder, BusSink};
