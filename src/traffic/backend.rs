// Counter-table capability and monitoring scope discovery

use super::{CounterSnapshot, TrafficError};
use crate::models::{Container, LinkState};
use crate::netns::namespace_inode;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};

/// One monitoring domain: the host, or one container (or nested) namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSpec {
    pub id: String,
    pub label: String,
    /// `None` for the host namespace.
    pub netns: Option<PathBuf>,
}

impl ScopeSpec {
    pub fn host() -> Self {
        Self {
            id: "host".to_string(),
            label: "host".to_string(),
            netns: None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.netns.is_none()
    }
}

/// Loaded counter programs of one scope.
pub trait CounterTable: Send + 'static {
    /// Links currently present in the scope's namespace.
    fn links(&mut self) -> impl Future<Output = Result<Vec<LinkState>, TrafficError>> + Send;

    /// Attaches the classifier pair to `ifname`. Repeating it is harmless.
    fn attach(&mut self, ifname: &str) -> impl Future<Output = Result<(), TrafficError>> + Send;

    /// Best-effort removal of the classifier pair from `ifname`.
    fn detach(&mut self, ifname: &str) -> impl Future<Output = ()> + Send;

    /// Full dump of cumulative counters.
    fn read(&mut self) -> impl Future<Output = Result<CounterSnapshot, TrafficError>> + Send;

    /// Unpins and releases everything the table loaded.
    fn close(self) -> impl Future<Output = ()> + Send;
}

pub trait TrafficBackend: Send + Sync + 'static {
    type Table: CounterTable;

    /// Checks preconditions once before any scope is loaded.
    fn prepare(&self) -> impl Future<Output = Result<(), TrafficError>> + Send;

    fn discover(
        &self,
        containers: &[Container],
    ) -> impl Future<Output = Result<Vec<ScopeSpec>, TrafficError>> + Send;

    fn load(&self, scope: &ScopeSpec) -> impl Future<Output = Result<Self::Table, TrafficError>> + Send;

    /// Called after every table is closed.
    fn finish(&self) -> impl Future<Output = ()> + Send;
}

/// Host scope plus the root and nested named namespaces of every container with
/// a process, deduplicated by namespace inode. `host_inode` joins the dedup set.
pub fn discover_scopes(proc_root: &Path, containers: &[Container], host_inode: Option<u64>) -> Vec<ScopeSpec> {
    let mut scopes = vec![ScopeSpec::host()];
    let mut seen: HashSet<u64> = host_inode.into_iter().collect();

    for container in containers {
        let Some(pid) = container.pid.filter(|pid| *pid > 0) else {
            continue;
        };
        let name = match (container.first_name(), container.short_id.as_str()) {
            ("", "") => format!("pid-{pid}"),
            ("", short) => short.to_string(),
            (name, _) => name.to_string(),
        };

        let proc_dir = proc_root.join(pid.to_string());
        let mut candidates = vec![(proc_dir.join("ns/net"), format!("{name}/root-netns"))];
        let nested = proc_dir.join("root/var/run/netns");
        if let Ok(entries) = std::fs::read_dir(&nested) {
            let mut names: Vec<String> = entries
                .filter_map(Result::ok)
                .filter(|e| e.file_type().map(|t| !t.is_dir()).unwrap_or(false))
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            for entry in names {
                candidates.push((nested.join(&entry), format!("{name}/{entry}")));
            }
        }

        for (path, label) in candidates {
            let Ok(inode) = namespace_inode(&path) else {
                continue;
            };
            if !seen.insert(inode) {
                continue;
            }
            scopes.push(ScopeSpec {
                id: format!("ns-{inode}"),
                label,
                netns: Some(path),
            });
        }
    }
    scopes
}

/// Interfaces worth attaching to, sorted, plus the index-to-name map of every
/// non-loopback link. Fabric-facing links are preferred; otherwise all are used.
pub fn desired_interfaces(links: &[LinkState]) -> (Vec<String>, HashMap<u32, String>) {
    let mut preferred = Vec::new();
    let mut fallback = Vec::new();
    let mut names = HashMap::new();

    for link in links {
        let s = &link.snapshot;
        if s.name.is_empty() || s.name == "lo" {
            continue;
        }
        names.insert(s.index, s.name.clone());
        fallback.push(s.name.clone());
        if is_fabric_link(link) {
            preferred.push(s.name.clone());
        }
    }

    preferred.sort();
    fallback.sort();
    if preferred.is_empty() {
        (fallback, names)
    } else {
        (preferred, names)
    }
}

fn is_fabric_link(link: &LinkState) -> bool {
    if link.controller.is_some_and(|idx| idx != 0) {
        return true;
    }
    let name = link.snapshot.name.as_str();
    if name.starts_with("docker0") || name.starts_with("br-") || name.starts_with("vnet") {
        return true;
    }
    matches!(link.snapshot.kind.as_str(), "veth" | "bridge")
}
