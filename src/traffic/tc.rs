// tc + eBPF counter backend: classifier programs pinned in bpffs, attached with tc

use super::backend::{CounterTable, ScopeSpec, TrafficBackend, discover_scopes};
use super::{CounterSnapshot, ProtoCounterKey, ProtoCounterValue, TrafficError};
use crate::models::{Container, LinkState};
use crate::netlink::monitor::list_links;
use crate::netns::{self, HOST_NETNS, namespace_inode};
use aya::maps::{HashMap as BpfHashMap, MapData};
use aya::programs::SchedClassifier;
use aya::{Ebpf, EbpfLoader};
use nix::errno::Errno;
use nix::mount::{MsFlags, mount};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

const BPFFS_MOUNT: &str = "/sys/fs/bpf";
const BPFFS_MAGIC: i64 = 0xCAFE_4A11;
const FILTER_PREF: &str = "42420";
const INGRESS_PROG: &str = "ingress_prog";
const EGRESS_PROG: &str = "egress_prog";
const COUNTER_MAP: &str = "proto_counters";

// SAFETY: both types are repr(C) plain integers with no padding-sensitive invariants.
unsafe impl aya::Pod for ProtoCounterKey {}
unsafe impl aya::Pod for ProtoCounterValue {}

#[derive(Debug, Clone)]
pub struct TrafficBackendConfig {
    /// Per-run directory under bpffs; one subdirectory per scope.
    pub bpffs_root: PathBuf,
    /// Holds `traffic_proto_top.<arch>.o`.
    pub object_dir: PathBuf,
}

impl Default for TrafficBackendConfig {
    fn default() -> Self {
        Self {
            bpffs_root: PathBuf::from("/sys/fs/bpf/lab_events_traffic"),
            object_dir: PathBuf::from("/usr/local/lib/lab-events"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TcBpfBackend {
    config: TrafficBackendConfig,
}

impl TcBpfBackend {
    pub fn new(config: TrafficBackendConfig) -> Self {
        Self { config }
    }

    fn object_path(&self) -> Result<PathBuf, TrafficError> {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "x86",
            "aarch64" => "arm64",
            other => return Err(TrafficError::UnsupportedArch(other)),
        };
        Ok(self
            .config
            .object_dir
            .join(format!("traffic_proto_top.{arch}.o")))
    }
}

pub struct TcBpfTable {
    scope: ScopeSpec,
    dir: PathBuf,
    ingress_pin: PathBuf,
    egress_pin: PathBuf,
    counters: BpfHashMap<MapData, ProtoCounterKey, ProtoCounterValue>,
    _ebpf: Ebpf,
}

impl TrafficBackend for TcBpfBackend {
    type Table = TcBpfTable;

    async fn prepare(&self) -> Result<(), TrafficError> {
        which::which("tc")?;
        ensure_bpffs_mounted()?;
        create_dir(&self.config.bpffs_root)
    }

    async fn discover(&self, containers: &[Container]) -> Result<Vec<ScopeSpec>, TrafficError> {
        let host = namespace_inode(Path::new(HOST_NETNS)).ok();
        Ok(discover_scopes(Path::new("/proc"), containers, host))
    }

    async fn load(&self, scope: &ScopeSpec) -> Result<TcBpfTable, TrafficError> {
        let dir = self.config.bpffs_root.join(sanitize_for_path(&scope.id));
        create_dir(&dir)?;
        let ingress_pin = dir.join(INGRESS_PROG);
        let egress_pin = dir.join(EGRESS_PROG);
        let map_pin = dir.join(COUNTER_MAP);
        for stale in [&ingress_pin, &egress_pin, &map_pin] {
            let _ = std::fs::remove_file(stale);
        }

        let object = self.object_path()?;
        let bytes = std::fs::read(&object).map_err(|source| TrafficError::Io {
            path: object.clone(),
            source,
        })?;
        let mut ebpf = EbpfLoader::new()
            .load(&bytes)
            .map_err(|source| TrafficError::Load {
                scope: scope.label.clone(),
                source,
            })?;

        for (name, pin) in [(INGRESS_PROG, &ingress_pin), (EGRESS_PROG, &egress_pin)] {
            let program: &mut SchedClassifier = ebpf
                .program_mut(name)
                .ok_or(TrafficError::MissingObject(name))?
                .try_into()
                .map_err(|source| TrafficError::Program { name, source })?;
            program
                .load()
                .map_err(|source| TrafficError::Program { name, source })?;
            program.pin(pin).map_err(|source| TrafficError::Pin {
                path: pin.clone(),
                source,
            })?;
        }

        let map = ebpf
            .take_map(COUNTER_MAP)
            .ok_or(TrafficError::MissingObject(COUNTER_MAP))?;
        map.pin(&map_pin).map_err(|source| TrafficError::Pin {
            path: map_pin.clone(),
            source,
        })?;
        let counters = BpfHashMap::try_from(map)?;

        debug!(scope = %scope.label, dir = %dir.display(), "Traffic programs loaded");
        Ok(TcBpfTable {
            scope: scope.clone(),
            dir,
            ingress_pin,
            egress_pin,
            counters,
            _ebpf: ebpf,
        })
    }

    async fn finish(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.config.bpffs_root) {
            debug!(path = %self.config.bpffs_root.display(), error = %e, "Traffic bpffs root not removed");
        }
    }
}

impl CounterTable for TcBpfTable {
    async fn links(&mut self) -> Result<Vec<LinkState>, TrafficError> {
        list_links(self.scope.netns.clone())
            .await
            .map_err(|e| TrafficError::Interfaces {
                scope: self.scope.label.clone(),
                detail: e.to_string(),
            })
    }

    async fn attach(&mut self, ifname: &str) -> Result<(), TrafficError> {
        let ifname = ifname.to_string();
        let ingress = self.ingress_pin.to_string_lossy().into_owned();
        let egress = self.egress_pin.to_string_lossy().into_owned();
        netns::run_in_netns(self.scope.netns.clone(), move || {
            // Fails when the qdisc already exists.
            let _ = Command::new("tc")
                .args(["qdisc", "add", "dev", &ifname, "clsact"])
                .output();
            Ok(run_tc(&filter_args(&ifname, "ingress", &ingress))
                .and_then(|()| run_tc(&filter_args(&ifname, "egress", &egress))))
        })
        .await?
    }

    async fn detach(&mut self, ifname: &str) {
        let ifname = ifname.to_string();
        let result = netns::run_in_netns(self.scope.netns.clone(), move || {
            for hook in ["ingress", "egress"] {
                let _ = Command::new("tc")
                    .args(["filter", "del", "dev", &ifname, hook, "pref", FILTER_PREF, "protocol", "all"])
                    .output();
            }
            Ok(())
        })
        .await;
        if let Err(e) = result {
            debug!(scope = %self.scope.label, error = %e, "Traffic detach failed");
        }
    }

    async fn read(&mut self) -> Result<CounterSnapshot, TrafficError> {
        let mut snapshot = CounterSnapshot::new();
        for entry in self.counters.iter() {
            let (key, value) = entry?;
            snapshot.insert(key, value);
        }
        Ok(snapshot)
    }

    async fn close(self) {
        for pin in [&self.ingress_pin, &self.egress_pin, &self.dir.join(COUNTER_MAP)] {
            let _ = std::fs::remove_file(pin);
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            debug!(scope = %self.scope.label, error = %e, "Traffic pin directory not removed");
        }
    }
}

fn filter_args(ifname: &str, hook: &str, pin: &str) -> Vec<String> {
    [
        "filter", "replace", "dev", ifname, hook, "pref", FILTER_PREF, "protocol", "all", "bpf",
        "da", "pinned", pin,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn run_tc(args: &[String]) -> Result<(), TrafficError> {
    let command = format!("tc {}", args.join(" "));
    let output = Command::new("tc")
        .args(args)
        .output()
        .map_err(|e| TrafficError::Command {
            command: command.clone(),
            detail: e.to_string(),
        })?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let detail = if stderr.is_empty() {
        output.status.to_string()
    } else {
        format!("{} ({stderr})", output.status)
    };
    Err(TrafficError::Command { command, detail })
}

fn ensure_bpffs_mounted() -> Result<(), TrafficError> {
    create_dir(Path::new(BPFFS_MOUNT))?;
    let stat = nix::sys::statfs::statfs(BPFFS_MOUNT).map_err(|source| TrafficError::BpffsMount {
        path: PathBuf::from(BPFFS_MOUNT),
        source,
    })?;
    if stat.filesystem_type().0 as i64 == BPFFS_MAGIC {
        return Ok(());
    }
    match mount(Some("bpf"), BPFFS_MOUNT, Some("bpf"), MsFlags::empty(), None::<&str>) {
        Ok(()) | Err(Errno::EBUSY) => Ok(()),
        Err(source) => Err(TrafficError::BpffsMount {
            path: PathBuf::from(BPFFS_MOUNT),
            source,
        }),
    }
}

fn create_dir(path: &Path) -> Result<(), TrafficError> {
    std::fs::create_dir_all(path).map_err(|source| TrafficError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// ASCII alphanumerics kept, everything else becomes `_`.
pub fn sanitize_for_path(value: &str) -> String {
    if value.is_empty() {
        return "scope".to_string();
    }
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
