pub mod backup;
pub mod list;
pub mod merge;
pub mod rotate;

pub use backup::{execute_backup, BackupReport};
pub use list::{execute_list, BackupSetSummary};
pub use merge::{execute_merge, DiskMergeOutcome, DiskMergeResult, MergeReport};
pub use rotate::{execute_rotation, RotateReport};
