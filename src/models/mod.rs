// Domain models: snapshots, hourly log, issues, report

mod log;
mod report;
mod snapshot;

pub use log::{HourKey, HourlyLogEntry, Issue};
pub use report::{GroupTotal, Report};
pub use snapshot::{
    Counters, DirEntry, SnapshotError, SnapshotKeys, SnapshotRecord, UserCounters,
    parse_capture_datetime,
};
