//! Test support for orgflow pipelines.
//!
//! This module provides:
//! - A scripted stage processor
//! - A journal ordering invocations against record writes
//! - Registry and organization fixtures

pub mod fixtures;
mod mocks;

pub use fixtures::{acme, completed_records, market_registry, organization};
pub use mocks::{Journal, JournalEntry, JournalingCheckpointStore, ScriptedProcessor, StageScript};
