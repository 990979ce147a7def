//! # pvstream-core
//!
//! Core process-variable (PV) data model and in-memory state.
//!
//! This crate provides:
//! - Data model types (PvUpdate, Sample, Severity)
//! - Time-series history cache with bin-averaging compaction
//! - Subscription registry / dispatcher with last-value seeding
//! - Settings and the shared error taxonomy
//!
//! This crate is intentionally runtime-agnostic and contains no async code.
//! Every type here is safe to call from the event loop and from foreign
//! protocol-client threads alike.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod model;

pub use config::{ConfigError, Settings, SourceMode};
pub use dispatcher::{DemandHook, Dispatcher, PvCallback, SubscriptionId};
pub use error::PvError;
pub use history::{downsample, HistoryCache, PvHistory, DEFAULT_MAX_RAW_POINTS};
pub use model::*;
