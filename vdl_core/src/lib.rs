//! Core of the multi-source video download service: the task lifecycle
//! engine, the shared store gateway, the provider adapters and the media
//! pipeline. The HTTP server and the worker binary are thin shells over
//! this crate.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod paths;
pub mod pipeline;
pub mod progress;
pub mod providers;
pub mod store;
pub mod task;
pub mod worker;

pub use config::Settings;
pub use error::DownloadError;
pub use orchestrator::{Orchestrator, ANONYMOUS_USER};
pub use providers::{DownloadCtx, ProviderRegistry};
pub use store::{MemoryKv, RedisKv, TaskStore};
pub use task::{DownloadRequest, MediaSnapshot, MediaVariant, StatusBlock, TaskRecord, TaskStatus};
pub use worker::Worker;
