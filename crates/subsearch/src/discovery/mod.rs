//! Keyword discovery across several catalog query strategies.

pub mod engine;
pub mod strategy;

pub use engine::{Discovery, DiscoveryEngine, DiscoveryStats, SeenSet};
pub use strategy::{PlanSettings, SampleSource, Strategy, MAX_BREADTH};
