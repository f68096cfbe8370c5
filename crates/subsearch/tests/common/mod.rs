//! Shared test utilities for subsearch integration tests.
//!
//! This module provides:
//! - `TestHarness`: an in-memory database, a scripted catalog and a
//!   fully wired `SearchService`
//! - `CatalogItemBuilder` for building catalog fixtures

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{Gate, RecordingNotifier, TestHarness};
