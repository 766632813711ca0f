pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod settings;
pub mod store;
pub mod update;

pub use backend::{DataBackend, FileWatcher, HttpDataBackend, Navigator};
pub use config::EngineConfig;
pub use engine::{EngineEvent, ViewerEngine};
pub use error::EngineError;
pub use store::{DataStore, ViewKey, ViewTarget, DEFAULT_PAGE_SIZE};
