/// Job management module
///
/// Builds jobs from block templates and validates shares against them

pub mod extranonce;
pub mod job;
pub mod manager;
pub mod merkle;

pub use extranonce::{ExtraNonceCounter, ExtraNonceError, SubscriptionCounter};
pub use job::{Job, JobError, JobParams};
pub use manager::{JobEvent, JobManager, PayoutScripts};
