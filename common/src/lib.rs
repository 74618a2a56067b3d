pub mod job;
pub mod migrations;
pub mod stats;
pub mod store;

pub use job::{JobId, JobRecord, JobStatus, Outcome};
pub use stats::{AverageDuration, ReportingWindow, StatsAggregator, StatsSnapshot};
pub use store::{JobStore, StoreError};

// Production paths (follow FHS - Filesystem Hierarchy Standard)
pub const DEFAULT_CONFIG_PATH: &str = "/etc/portald/config.yaml";
pub const DEFAULT_STORE_PATH: &str = "/var/lib/portald/queries.db";
pub const DEFAULT_LOG_FILE: &str = "/var/log/portald/portald.log";
pub const DEFAULT_SERVICE_LOG_FILE: &str = "/var/log/portald/services.log";

/// Bounded wait for the store's write lock before a query gives up.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;
