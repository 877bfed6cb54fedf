//! Central repository for naming rules, limits and default configuration values
//!
//! Grouped by category so the operations modules share a single source of
//! truth for file names, polling intervals and retention defaults.

/// File and directory naming inside the backup store
pub mod naming {
    /// Snapshot names (and therefore backup set directory names) are local timestamps
    pub const SNAPSHOT_NAME_FORMAT: &str = "%Y%m%d_%H%M%S";

    /// Manifest written as the last step of a successful backup
    pub const MANIFEST_FILE: &str = "manifest.json";

    /// Temporary name used while the manifest is being written
    pub const MANIFEST_TMP_FILE: &str = "manifest.json.tmp";

    /// Copy of the domain definition kept next to the disk files
    pub const DOMAIN_DEFINITION_FILE: &str = "domain.xml";

    /// Current manifest schema version
    pub const MANIFEST_FORMAT_VERSION: u32 = 1;

    /// Prefix of the per-domain advisory lock file
    pub const LOCK_FILE_PREFIX: &str = "vmsnap-";
}

/// Limits and constraints
pub mod limits {
    /// Longest backing chain the inspector will walk before giving up
    pub const MAX_CHAIN_DEPTH: usize = 1024;

    /// Buffer size used when copying frozen backing files
    pub const COPY_BUFFER_SIZE: usize = 4 * 1024 * 1024;

    /// Attempts at finding a free snapshot name within the same second
    pub const MAX_NAME_SUFFIX: u32 = 100;
}

/// Default configuration values
pub mod defaults {
    /// Config file read when no path is given and the file exists
    pub const CONFIG_PATH: &str = "/etc/vmsnap/config.toml";

    /// Environment variable naming an alternative config file
    pub const CONFIG_ENV: &str = "VMSNAP_CONFIG";

    /// libvirt connection URI
    pub const HYPERVISOR_URI: &str = "qemu:///system";

    pub const VIRSH_BINARY: &str = "virsh";

    pub const QEMU_IMG_BINARY: &str = "qemu-img";

    /// Interval between block job status polls
    pub const POLL_INTERVAL_SECONDS: u64 = 5;

    /// Maximum time a single disk's block pull may take
    pub const MAX_WAIT_SECONDS: u64 = 86400; // 24 hours

    /// Number of complete backup sets kept by rotation
    pub const RETENTION: usize = 1;
}
