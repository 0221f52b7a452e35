//! Metrics collection for autonomous multi-agent coding sessions.
//!
//! A [`Collector`] tracks sessions and the delegations made inside them,
//! folds every finished delegation into per-agent profiles, runs the
//! XP/achievement/strengths engines, and persists everything to a single
//! crash-safe JSON file through [`Store`].

pub mod aggregate;
pub mod collector;
pub mod config;
pub mod data_dir;
pub mod model;
pub mod pricing;
pub mod rules;
#[cfg(feature = "serve")]
pub mod serve;
pub mod store;

pub use collector::{Collector, CollectorError, CollectorOptions, DelegationOutcome, Tracker};
pub use model::{
    AgentProfile, Event, EventStatus, GlobalSummary, Metadata, MetadataValue, Session,
    SessionSummary, StoreRoot,
};
pub use store::{Loaded, Recovery, StagedWrite, Store, StoreError};
