pub mod commands;
pub mod copier;
pub mod inspector;
pub mod lock;
pub mod store;
