//! CLI command handlers

pub mod convert;
pub mod fetch;
pub mod train;

pub use convert::run_convert;
pub use fetch::resolve_model_dir;
pub use train::run_train;
