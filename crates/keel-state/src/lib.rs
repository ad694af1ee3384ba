//! keel-state — records and persistence for Keel.
//!
//! Backed by [redb](https://docs.rs/redb), stores deployment endpoints,
//! service instances, and deployment status records in three keyed
//! upsert tables. The [`Registry`] layers per-kind in-memory maps on top
//! and is the single context object the rest of Keel shares.
//!
//! # Architecture
//!
//! ```text
//! Registry (Clone, shared across tasks)
//!   ├── endpoints   RwLock<HashMap>  ──┐
//!   ├── instances   RwLock<HashMap>  ──┼── write-through ──► StateStore (redb)
//!   ├── deployments RwLock<HashMap>  ──┘
//!   └── routes      RwLock<HashMap>   (in memory only)
//! ```

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult, UnknownStrategy};
pub use registry::Registry;
pub use store::StateStore;
pub use types::*;
