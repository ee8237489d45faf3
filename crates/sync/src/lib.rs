//! Version sync for depot
//!
//! Builds on `depot-core` indexes and `depot-store` block stores:
//! - [`write_content`] packs and uploads the blocks a store is missing
//! - [`change_version`] turns an on-disk tree from one version into another
//! - [`flows`] chains scanning, indexing, uploading and updating
//! - [`Engine`] runs all of it synchronously with its own diagnostics

pub mod config;
pub mod content;
pub mod engine;
pub mod flows;
pub mod writer;

pub use config::EngineConfig;
pub use content::write_content;
pub use engine::{AssertHook, CallOptions, Engine};
pub use flows::{
    get_current_version_index, update_version, upload_version, FlowContext, UpdateOptions, UploadOptions,
    UploadedVersion,
};
pub use writer::{change_version, ChangeVersionContext};
