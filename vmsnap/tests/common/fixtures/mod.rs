//! Reusable test utilities:
//! - In-memory hypervisor over real image files
//! - Temporary domain environments with backup store paths

// Allow unused code in test fixtures - each test binary uses a different subset
#![allow(dead_code)]
#![allow(unused_imports)]

pub mod fake_hypervisor;
pub mod test_env;

pub use fake_hypervisor::{FakeHypervisor, JobBehaviour};
pub use test_env::*;
