// Scheduled job records, storage and the claim protocol
pub mod claim;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod service;
pub mod store;

pub use claim::{claim, ClaimOutcome};
pub use memory::MemoryJobStore;
pub use models::{Asset, Frequency, JobPatch, JobStatus, ScheduledJob, UpdateGuard};
pub use postgres::PgJobStore;
pub use service::{JobPreview, JobService, JobServiceConfig, NewJob};
pub use store::JobStore;
