pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod fetch;
pub mod job;
pub mod link;
pub mod metadata;
pub mod progress;
pub mod provider;
pub mod quality;
pub mod settings;
pub mod temp;
pub mod update;


pub use crate::engine::{DownloadEngine, EngineState};
pub use crate::error::{CoreError, CoreResult};
pub use crate::event::EngineEvent;
pub use crate::job::{BatchJob, ItemOutcome, JobId, JobReport};
pub use crate::link::{LinkReference, ResourceKind};
