// Errors returned by the event pipeline

use crate::runtime::RuntimeError;
use crate::traffic::TrafficError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventsError {
    #[error("unsupported format {0:?} (expected plain or json)")]
    UnsupportedFormat(String),
    #[error("runtime {0:?} is not initialized")]
    RuntimeNotInitialized(String),
    #[error("config: {0}")]
    Config(String),
    #[error("runtime: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("traffic: {0}")]
    Traffic(#[from] TrafficError),
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
