//! Application Services
//!
//! Services that orchestrate domain logic between the gateway layer and
//! the event hub.
//!
//! - `reconciler`: position reconciliation, throttling, and health.

/// Position reconciliation layer.
pub mod reconciler;

pub use reconciler::{PositionReconciler, ReconcilerStatus};
