//! Runner pieces for the refinement orchestrator: the HTTP generation
//! backend, the filesystem store and their configuration.

pub mod capability;
pub mod config;
pub mod store;

pub use capability::HttpCapability;
pub use config::RunnerConfig;
pub use store::FsContentStore;
