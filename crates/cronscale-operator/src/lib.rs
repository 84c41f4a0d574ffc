//! Schedule-aware autoscaling for Kubernetes.
//!
//! A [`CronScale`](crd::CronScale) pairs a time window with replica bounds and a CPU target for a
//! workload. Control loops periodically take a [`snapshot`] of all CronScales in their scope and
//! the targets they reference, [`decision::decide`] what should hold right now and [`apply`] the
//! difference with optimistic concurrency.
//!
//! Everything below [`driver`] only depends on the [`store::ScaleStore`] capability, which
//! [`client::Client`] implements for a real cluster.
pub mod apply;
pub mod cli;
pub mod client;
pub mod crd;
pub mod decision;
pub mod driver;
pub mod error;
pub mod health;
pub mod logging;
pub mod namespace;
pub mod schedule;
pub mod snapshot;
pub mod store;
pub mod utils;

// Internal re-exports
pub use crate::crd::{CronScale, CronScaleSpec};
