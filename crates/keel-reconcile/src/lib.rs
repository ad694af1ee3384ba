//! keel-reconcile — the background reconciliation loop.
//!
//! Every tick, in order:
//!
//! ```text
//! 1. probe every instance concurrently → health_score / status
//! 2. for each auto_scaling endpoint without a running deployment:
//!      healthy + starting < min  → create (min - healthy - starting) instances
//!      healthy > max             → remove the oldest healthy instances
//! 3. refresh FleetMetrics
//! ```
//!
//! A failing probe or a failed scaling step is logged and never stops the
//! loop.

pub mod reconciler;

pub use reconciler::{ReconcileConfig, Reconciler, TickReport};
