// Protocol traffic counters sampled from tc/eBPF classifier programs

pub mod backend;
pub mod collector;
pub mod counters;
pub mod services;
pub mod tc;

pub use backend::{CounterTable, ScopeSpec, TrafficBackend, discover_scopes};
pub use collector::TrafficCollector;
pub use counters::{CounterSnapshot, ProtoCounterKey, ProtoCounterValue, diff_counters};
pub use services::ServiceTable;
pub use tc::{TcBpfBackend, TrafficBackendConfig};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("traffic monitoring requires \"tc\" in PATH: {0}")]
    MissingTc(#[from] which::Error),
    #[error("mount bpffs on {path}: {source}")]
    BpffsMount {
        path: PathBuf,
        source: nix::errno::Errno,
    },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("namespace: {0}")]
    Namespace(#[from] std::io::Error),
    #[error("unsupported architecture {0:?} for traffic eBPF object")]
    UnsupportedArch(&'static str),
    #[error("load traffic eBPF object for scope {scope:?}: {source}")]
    Load {
        scope: String,
        source: aya::EbpfError,
    },
    #[error("traffic eBPF object is missing {0:?}")]
    MissingObject(&'static str),
    #[error("eBPF program {name}: {source}")]
    Program {
        name: &'static str,
        source: aya::programs::ProgramError,
    },
    #[error("eBPF map: {0}")]
    Map(#[from] aya::maps::MapError),
    #[error("pin {path}: {source}")]
    Pin {
        path: PathBuf,
        source: aya::pin::PinError,
    },
    #[error("{command} failed: {detail}")]
    Command { command: String, detail: String },
    #[error("list interfaces in scope {scope:?}: {detail}")]
    Interfaces { scope: String, detail: String },
    #[error("no traffic monitoring scopes were discovered")]
    NoScopes,
}
