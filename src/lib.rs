//! Quiver: filtered, cluster-aware approximate nearest-neighbor search over a
//! pluggable vector engine.

pub mod accelerator;
pub mod autotune;
pub mod clustering;
pub mod config;
pub mod error;
pub mod index;
pub mod io;
pub mod metrics;
pub mod params;
pub mod selector;
pub mod transform;
pub mod types;
