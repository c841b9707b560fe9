//! Feed update engine and quarantine.

pub mod engine;
pub mod quarantine;

pub use engine::{start_updater, FeedUpdater, PassReport, DEFAULT_INTERVAL, DEFAULT_PASS_TIMEOUT};
pub use quarantine::{removal_notice, Quarantine, QuarantineOutcome, QuarantinePolicy};
