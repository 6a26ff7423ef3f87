// Per-namespace interface watchers and the registry that owns them

pub mod monitor;
pub mod registry;
pub mod watcher;

pub use monitor::{LinkMonitor, LinkUpdate, NamespaceLinks, NetlinkMonitor};
pub use registry::WatcherRegistry;
pub use watcher::{InterfaceTable, WatchOptions};

use crate::runtime::RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("namespace: {0}")]
    Namespace(#[from] std::io::Error),
    #[error("netlink: {0}")]
    Netlink(#[from] rtnetlink::Error),
    #[error("resolve namespace: {0}")]
    Runtime(#[from] RuntimeError),
}
