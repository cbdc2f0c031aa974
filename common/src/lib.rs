pub mod audit;
pub mod ipc;
pub mod job;
pub mod status;

pub use audit::{AuditFailure, AuditOutcome, AuditReport, Suspect};
pub use ipc::{Request, Response};
pub use job::{EventKind, JobEvent, JobId, JobStatus, HEARTBEAT_STEP};
pub use status::{reduce, DerivedStatus};

// Production paths (follow FHS - Filesystem Hierarchy Standard)
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/jobwatch/jobwatch.sock";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/jobwatch/config.yaml";
