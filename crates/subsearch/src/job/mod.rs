//! Job records, their lifecycle, and where they live.

pub mod cancel;
pub mod progress;
pub mod record;
pub mod store;

pub use cancel::{CancellationToken, StopReason};
pub use progress::{JobEvent, JobProgressBroadcaster};
pub use record::{
    ActivityFilter, JobParams, JobRecord, JobSource, JobState, Priority, QueueMetadata,
};
pub use store::JobStore;
