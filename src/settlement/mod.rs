pub mod processor;
pub mod queue;
pub mod reconciliation;
pub mod scheduler;

pub use processor::{
    ReleaseOutcome, ReleaseProcessor, ReleaseReceipt, ReleaseTrigger, SkipReason,
};
pub use queue::{ReleaseJob, ReleaseQueue, ReleaseWorker};
pub use reconciliation::ReconciliationReporter;
pub use scheduler::{ReleaseScheduler, SchedulerConfig};
