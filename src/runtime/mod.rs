// Container runtime contract consumed by the event pipeline

mod docker;

pub use docker::DockerRuntime;

use crate::models::{Container, RuntimeEvent};
use futures_util::stream::BoxStream;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("container {id} has no running process")]
    NoProcess { id: String },
    #[error("namespace path not ready for container {id}")]
    NamespaceNotReady { id: String },
}

/// Events in feed order; a feed error is delivered in-band and ends the feed.
pub type RuntimeEventStream = BoxStream<'static, Result<RuntimeEvent, RuntimeError>>;

/// Which containers `list_containers` returns. Unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    /// Label key that must be present.
    pub label: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
    /// Inspect running matches for their init pid.
    pub with_pid: bool,
}

impl ContainerFilter {
    /// Containers carrying `label`, with pids resolved.
    pub fn label_exists(label: &str) -> Self {
        Self {
            label: Some(label.to_string()),
            with_pid: true,
            ..Default::default()
        }
    }
}

pub trait ContainerRuntime: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> impl Future<Output = Result<Vec<Container>, RuntimeError>> + Send;

    /// Subscribes to lifecycle events of containers carrying `label`.
    fn events(
        &self,
        label: &str,
    ) -> impl Future<Output = Result<RuntimeEventStream, RuntimeError>> + Send;

    /// Filesystem path of the container's network namespace.
    /// May fail transiently right after the container starts.
    fn namespace_path(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<PathBuf, RuntimeError>> + Send;
}
