pub mod cli;
pub mod config;
pub mod constants;
pub mod errors;
pub mod hypervisor;
pub mod operations;
pub mod services;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigManager};
pub use errors::{BackupError, Result};
pub use hypervisor::{Hypervisor, VirshHypervisor};
pub use operations::{execute_backup, execute_list, execute_merge, execute_rotation};
