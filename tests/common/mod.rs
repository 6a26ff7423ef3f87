// Shared test helpers: in-memory runtime, link monitor and counter backend

#![allow(dead_code)]

use futures_util::StreamExt;
use lab_events::models::*;
use lab_events::netlink::{LinkMonitor, LinkUpdate, NamespaceLinks};
use lab_events::runtime::{ContainerFilter, ContainerRuntime, RuntimeError, RuntimeEventStream};
use lab_events::traffic::{CounterSnapshot, CounterTable, ScopeSpec, TrafficBackend, TrafficError};
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn container(id: &str, name: &str, state: ContainerState) -> Container {
    let mut labels = HashMap::new();
    labels.insert("containerlab".to_string(), "lab1".to_string());
    Container {
        id: id.to_string(),
        short_id: short_id(id).to_string(),
        names: vec![name.to_string()],
        labels,
        state,
        pid: (state == ContainerState::Running).then_some(4242),
        ..Default::default()
    }
}

pub fn link(index: u32, name: &str) -> LinkState {
    LinkState::from(InterfaceSnapshot {
        index,
        name: name.to_string(),
        mtu: 1500,
        oper_state: "up".to_string(),
        kind: "veth".to_string(),
        ..Default::default()
    })
}

pub fn netns_path(id: &str) -> PathBuf {
    PathBuf::from(format!("/fake/netns/{id}"))
}

type FeedItem = Result<RuntimeEvent, RuntimeError>;

/// Runtime with a fixed container list and a feed driven by the test.
pub struct FakeRuntime {
    name: String,
    pub containers: Mutex<Vec<Container>>,
    feed_tx: mpsc::UnboundedSender<FeedItem>,
    feed_rx: Mutex<Option<mpsc::UnboundedReceiver<FeedItem>>>,
    pub list_calls: AtomicUsize,
    /// Every filter passed to `list_containers`, in call order.
    pub filters: Mutex<Vec<ContainerFilter>>,
}

impl FakeRuntime {
    pub fn new(containers: Vec<Container>) -> Self {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        Self {
            name: "docker".to_string(),
            containers: Mutex::new(containers),
            feed_tx,
            feed_rx: Mutex::new(Some(feed_rx)),
            list_calls: AtomicUsize::new(0),
            filters: Mutex::new(Vec::new()),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn push_event(&self, ev: RuntimeEvent) {
        let _ = self.feed_tx.send(Ok(ev));
    }

    pub fn push_error(&self, err: RuntimeError) {
        let _ = self.feed_tx.send(Err(err));
    }
}

impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<Container>, RuntimeError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.filters.lock().unwrap().push(filter.clone());
        let containers = self.containers.lock().unwrap().clone();
        Ok(containers
            .into_iter()
            .filter(|c| filter.label.as_ref().is_none_or(|l| c.labels.contains_key(l)))
            .filter(|c| filter.id.as_ref().is_none_or(|id| c.id.starts_with(id.as_str())))
            .filter(|c| filter.name.as_ref().is_none_or(|n| c.names.contains(n)))
            .collect())
    }

    async fn events(&self, _label: &str) -> Result<RuntimeEventStream, RuntimeError> {
        let rx = self.feed_rx.lock().unwrap().take();
        match rx {
            Some(rx) => Ok(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            None => Ok(futures_util::stream::empty().boxed()),
        }
    }

    async fn namespace_path(&self, id: &str) -> Result<PathBuf, RuntimeError> {
        let containers = self.containers.lock().unwrap().clone();
        containers
            .iter()
            .find(|c| c.id == id && c.pid.is_some())
            .map(|c| netns_path(&c.id))
            .ok_or_else(|| RuntimeError::NoProcess { id: id.to_string() })
    }
}

struct FakeNamespace {
    inventory: Vec<LinkState>,
    updates: Option<mpsc::UnboundedReceiver<LinkUpdate>>,
}

/// Link monitor over namespaces registered by the test.
#[derive(Default)]
pub struct FakeMonitor {
    namespaces: Mutex<HashMap<PathBuf, FakeNamespace>>,
    pub opened: AtomicUsize,
}

impl FakeMonitor {
    /// Registers a namespace; the returned sender injects link notifications.
    pub fn add_namespace(&self, path: PathBuf, inventory: Vec<LinkState>) -> mpsc::UnboundedSender<LinkUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.namespaces.lock().unwrap().insert(
            path,
            FakeNamespace {
                inventory,
                updates: Some(rx),
            },
        );
        tx
    }
}

pub struct FakeLinks {
    inventory: Vec<LinkState>,
    updates: mpsc::UnboundedReceiver<LinkUpdate>,
}

impl LinkMonitor for FakeMonitor {
    type Links = FakeLinks;

    async fn open(&self, netns: PathBuf) -> Result<FakeLinks, lab_events::netlink::WatchError> {
        let mut namespaces = self.namespaces.lock().unwrap();
        let ns = namespaces
            .get_mut(&netns)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such namespace"))?;
        let updates = ns
            .updates
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "namespace already open"))?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(FakeLinks {
            inventory: ns.inventory.clone(),
            updates,
        })
    }
}

impl NamespaceLinks for FakeLinks {
    async fn list(&mut self) -> Result<Vec<LinkState>, lab_events::netlink::WatchError> {
        Ok(self.inventory.clone())
    }

    async fn next_update(&mut self) -> Option<LinkUpdate> {
        let update = self.updates.recv().await?;
        match &update {
            LinkUpdate::Upsert(state) => {
                self.inventory.retain(|l| l.snapshot.index != state.snapshot.index);
                self.inventory.push(state.clone());
            }
            LinkUpdate::Removed(state) => {
                self.inventory.retain(|l| l.snapshot.index != state.snapshot.index);
            }
        }
        Some(update)
    }
}

/// Counter backend whose map contents are shared with the test.
#[derive(Clone)]
pub struct FakeBackend {
    pub counters: Arc<Mutex<CounterSnapshot>>,
    /// Links every scope reports; tests may change them between ticks.
    pub links: Arc<Mutex<Vec<LinkState>>>,
    pub scopes: Vec<ScopeSpec>,
    /// Scope ids whose attaches always fail.
    pub fail_attach: HashSet<String>,
    pub attached: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<AtomicUsize>,
    pub finished: Arc<AtomicBool>,
}

impl FakeBackend {
    pub fn new(links: Vec<LinkState>) -> Self {
        Self {
            counters: Arc::new(Mutex::new(CounterSnapshot::new())),
            links: Arc::new(Mutex::new(links)),
            scopes: vec![ScopeSpec::host()],
            fail_attach: HashSet::new(),
            attached: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub struct FakeTable {
    scope: ScopeSpec,
    backend: FakeBackend,
}

impl TrafficBackend for FakeBackend {
    type Table = FakeTable;

    async fn prepare(&self) -> Result<(), TrafficError> {
        Ok(())
    }

    async fn discover(&self, _containers: &[Container]) -> Result<Vec<ScopeSpec>, TrafficError> {
        Ok(self.scopes.clone())
    }

    async fn load(&self, scope: &ScopeSpec) -> Result<FakeTable, TrafficError> {
        Ok(FakeTable {
            scope: scope.clone(),
            backend: self.clone(),
        })
    }

    async fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

impl CounterTable for FakeTable {
    async fn links(&mut self) -> Result<Vec<LinkState>, TrafficError> {
        Ok(self.backend.links.lock().unwrap().clone())
    }

    async fn attach(&mut self, ifname: &str) -> Result<(), TrafficError> {
        if self.backend.fail_attach.contains(&self.scope.id) {
            return Err(TrafficError::Command {
                command: format!("tc filter replace dev {ifname}"),
                detail: "exit status: 2".to_string(),
            });
        }
        self.backend.attached.lock().unwrap().push(ifname.to_string());
        Ok(())
    }

    async fn detach(&mut self, ifname: &str) {
        self.backend.attached.lock().unwrap().retain(|n| n != ifname);
    }

    async fn read(&mut self) -> Result<CounterSnapshot, TrafficError> {
        Ok(self.backend.counters.lock().unwrap().clone())
    }

    async fn close(self) {
        self.backend.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Cloneable in-memory sink.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Receives the next event or panics after `timeout`.
pub async fn recv_within(rx: &mut mpsc::Receiver<AggregatedEvent>, timeout: Duration) -> AggregatedEvent {
    tokio::time::timeout(timeout, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

/// Polls `cond` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
