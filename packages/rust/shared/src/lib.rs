//! Shared types, error model, and configuration for Wise.
//!
//! This crate is the foundation depended on by all other Wise crates.
//! It provides:
//! - The unified error type, [`WiseError`]
//! - Domain types ([`Task`], [`Step`], their statuses, listing queries)
//! - Configuration ([`AppConfig`], [`SchedulerConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, SchedulerConfig, SchedulerSection, StorageSection, UrlMarkConfig, UrlMarkSection,
    config_dir, config_file_path, init_config, load_config, load_config_from, resolve_db_path,
    validate_config,
};
pub use error::{Result, WiseError};
pub use types::{
    EMPTY_JSON, Step, StepStatus, Task, TaskDetail, TaskPage, TaskQuery, TaskStatus, new_id,
};
