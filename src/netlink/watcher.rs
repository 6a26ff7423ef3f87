// Per-container interface watcher: inventory, diffing and optional counter sampling

use super::{LinkMonitor, LinkUpdate, NamespaceLinks, WatchError};
use crate::events::EventSender;
use crate::models::{AggregatedEvent, Container, EventKind, InterfaceSnapshot, LinkCounters, LinkState};
use crate::runtime::{ContainerRuntime, RuntimeError};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{Duration, Instant, Interval, MissedTickBehavior};
use tracing::{debug, instrument};

const NS_ATTEMPTS: usize = 5;
const NS_RETRY_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Settings shared by every watcher of one pipeline.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Label key whose value identifies the owning lab.
    pub lab_label: String,
    /// Emit one `snapshot` event per interface of the starting inventory.
    pub include_initial_state: bool,
    /// Emit `stats` events at this interval.
    pub stats_interval: Option<Duration>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            lab_label: "containerlab".to_string(),
            include_initial_state: false,
            stats_interval: None,
        }
    }
}

/// Last known snapshot per interface index.
#[derive(Debug, Default)]
pub struct InterfaceTable {
    entries: HashMap<u32, InterfaceSnapshot>,
}

impl InterfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed<I: IntoIterator<Item = InterfaceSnapshot>>(snapshots: I) -> Self {
        Self {
            entries: snapshots.into_iter().map(|s| (s.index, s)).collect(),
        }
    }

    /// Applies one notification and returns the event to emit, if any.
    pub fn apply(&mut self, update: &LinkUpdate) -> Option<(&'static str, InterfaceSnapshot)> {
        match update {
            LinkUpdate::Removed(state) => self
                .entries
                .remove(&state.snapshot.index)
                .map(|last| ("delete", last)),
            LinkUpdate::Upsert(state) => {
                let fresh = &state.snapshot;
                let action = match self.entries.get(&fresh.index) {
                    Some(previous) if previous == fresh => return None,
                    Some(_) => "update",
                    None => "create",
                };
                self.entries.insert(fresh.index, fresh.clone());
                Some((action, fresh.clone()))
            }
        }
    }

    pub fn get(&self, index: u32) -> Option<&InterfaceSnapshot> {
        self.entries.get(&index)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.entries.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by index.
    pub fn snapshots(&self) -> Vec<&InterfaceSnapshot> {
        let mut out: Vec<_> = self.entries.values().collect();
        out.sort_by_key(|s| s.index);
        out
    }
}

/// Rates derived from two counter readings of one link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsMetrics {
    pub current: LinkCounters,
    pub rx_bps: f64,
    pub tx_bps: f64,
    pub rx_pps: f64,
    pub tx_pps: f64,
    pub interval: Duration,
}

#[derive(Debug, Default)]
pub struct StatsTracker {
    samples: HashMap<u32, (LinkCounters, Instant)>,
}

impl StatsTracker {
    /// Records a reading; returns metrics once a previous reading exists.
    pub fn observe(&mut self, index: u32, current: LinkCounters, now: Instant) -> Option<StatsMetrics> {
        let previous = self.samples.insert(index, (current, now));
        let (prev, at) = previous?;
        let interval = now.checked_duration_since(at).filter(|d| !d.is_zero())?;
        let secs = interval.as_secs_f64();
        Some(StatsMetrics {
            current,
            rx_bps: delta_counter(prev.rx_bytes, current.rx_bytes) as f64 * 8.0 / secs,
            tx_bps: delta_counter(prev.tx_bytes, current.tx_bytes) as f64 * 8.0 / secs,
            rx_pps: delta_counter(prev.rx_packets, current.rx_packets) as f64 / secs,
            tx_pps: delta_counter(prev.tx_packets, current.tx_packets) as f64 / secs,
            interval,
        })
    }

    /// Restarts the baseline of `index`.
    pub fn rebase(&mut self, index: u32, counters: Option<LinkCounters>, now: Instant) {
        match counters {
            Some(c) => {
                self.samples.insert(index, (c, now));
            }
            None => {
                self.samples.remove(&index);
            }
        }
    }

    pub fn forget(&mut self, index: u32) {
        self.samples.remove(&index);
    }
}

/// Zero means the one-second default.
pub fn normalize_stats_interval(interval: Duration) -> Duration {
    if interval.is_zero() {
        DEFAULT_STATS_INTERVAL
    } else {
        interval
    }
}

/// A counter below its previous reading restarted from zero.
pub fn delta_counter(previous: u64, current: u64) -> u64 {
    if current >= previous {
        current - previous
    } else {
        current
    }
}

/// Attributes of every `interface` event.
pub fn interface_attributes(
    container: &Container,
    lab_label: &str,
    snapshot: &InterfaceSnapshot,
) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    attrs.insert("ifname".to_string(), snapshot.name.clone());
    attrs.insert("index".to_string(), snapshot.index.to_string());
    attrs.insert("mtu".to_string(), snapshot.mtu.to_string());
    attrs.insert("state".to_string(), snapshot.oper_state.clone());
    attrs.insert("type".to_string(), snapshot.kind.clone());
    attrs.insert("origin".to_string(), "netlink".to_string());
    if !snapshot.alias.is_empty() {
        attrs.insert("alias".to_string(), snapshot.alias.clone());
    }
    if !snapshot.mac.is_empty() {
        attrs.insert("mac".to_string(), snapshot.mac.clone());
    }
    let lab = container.label(lab_label);
    if !lab.is_empty() {
        attrs.insert("lab".to_string(), lab.to_string());
    }
    if !container.first_name().is_empty() {
        attrs.insert("name".to_string(), container.first_name().to_string());
    }
    attrs
}

fn interface_event(
    container: &Container,
    lab_label: &str,
    action: &str,
    snapshot: &InterfaceSnapshot,
) -> AggregatedEvent {
    AggregatedEvent::new(EventKind::Interface, action)
        .actor(&container.short_id, container.first_name(), &container.id)
        .attributes(interface_attributes(container, lab_label, snapshot))
}

fn stats_event(container: &Container, lab_label: &str, snapshot: &InterfaceSnapshot, m: &StatsMetrics) -> AggregatedEvent {
    interface_event(container, lab_label, "stats", snapshot).attributes([
        ("rx_bytes", m.current.rx_bytes.to_string()),
        ("tx_bytes", m.current.tx_bytes.to_string()),
        ("rx_packets", m.current.rx_packets.to_string()),
        ("tx_packets", m.current.tx_packets.to_string()),
        ("rx_bps", m.rx_bps.to_string()),
        ("tx_bps", m.tx_bps.to_string()),
        ("rx_pps", m.rx_pps.to_string()),
        ("tx_pps", m.tx_pps.to_string()),
        ("interval_seconds", m.interval.as_secs_f64().to_string()),
    ])
}

/// Resolves the namespace path, retrying while the container is still starting.
pub async fn wait_for_namespace_path<R: ContainerRuntime>(
    runtime: &R,
    id: &str,
) -> Result<PathBuf, WatchError> {
    let mut last_err = None;
    for attempt in 0..NS_ATTEMPTS {
        match runtime.namespace_path(id).await {
            Ok(path) if !path.as_os_str().is_empty() => return Ok(path),
            Ok(_) => {}
            Err(e) => last_err = Some(e),
        }
        if attempt + 1 < NS_ATTEMPTS {
            tokio::time::sleep(NS_RETRY_DELAY).await;
        }
    }
    Err(last_err
        .unwrap_or_else(|| RuntimeError::NamespaceNotReady { id: id.to_string() })
        .into())
}

/// Watch task body. Errors end this watcher only.
#[instrument(skip_all, fields(container = %container.first_name()))]
pub(crate) async fn run_watcher<R: ContainerRuntime, M: LinkMonitor>(
    container: Container,
    runtime: Arc<R>,
    monitor: Arc<M>,
    sender: EventSender,
    options: Arc<WatchOptions>,
) {
    match watch(&container, runtime.as_ref(), monitor.as_ref(), &sender, &options).await {
        Ok(()) => debug!("Interface watcher stopped"),
        Err(e) => debug!(error = %e, "Interface watcher failed"),
    }
}

async fn watch<R: ContainerRuntime, M: LinkMonitor>(
    container: &Container,
    runtime: &R,
    monitor: &M,
    sender: &EventSender,
    options: &WatchOptions,
) -> Result<(), WatchError> {
    let cancel = sender.token().clone();
    let path = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        res = wait_for_namespace_path(runtime, container.identity()) => res?,
    };
    let mut links = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        res = monitor.open(path) => res?,
    };

    let inventory = match links.list().await {
        Ok(inventory) => inventory,
        Err(e) => {
            debug!(error = %e, "Interface inventory failed");
            Vec::new()
        }
    };
    let mut table = InterfaceTable::seed(inventory.iter().map(|l| l.snapshot.clone()));
    let mut stats = StatsTracker::default();
    let now = Instant::now();
    for link in &inventory {
        stats.rebase(link.snapshot.index, link.counters, now);
    }

    let lab_label = options.lab_label.as_str();
    if options.include_initial_state {
        for snapshot in table.snapshots() {
            if !sender.send(interface_event(container, lab_label, "snapshot", snapshot)).await {
                return Ok(());
            }
        }
    }

    let mut ticker = options.stats_interval.map(|period| {
        let period = normalize_stats_interval(period);
        let mut t = tokio::time::interval_at(Instant::now() + period, period);
        t.set_missed_tick_behavior(MissedTickBehavior::Skip);
        t
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = next_tick(&mut ticker) => {
                let current = match links.list().await {
                    Ok(current) => current,
                    Err(e) => {
                        debug!(error = %e, "Interface stats read failed");
                        continue;
                    }
                };
                if !emit_stats(container, lab_label, &table, &mut stats, current, sender).await {
                    return Ok(());
                }
            }
            update = links.next_update() => {
                let Some(update) = update else { return Ok(()) };
                match &update {
                    LinkUpdate::Removed(state) => stats.forget(state.snapshot.index),
                    LinkUpdate::Upsert(state) => {
                        stats.rebase(state.snapshot.index, state.counters, Instant::now());
                    }
                }
                if let Some((action, snapshot)) = table.apply(&update)
                    && !sender.send(interface_event(container, lab_label, action, &snapshot)).await
                {
                    return Ok(());
                }
            }
        }
    }
}

async fn emit_stats(
    container: &Container,
    lab_label: &str,
    table: &InterfaceTable,
    stats: &mut StatsTracker,
    current: Vec<LinkState>,
    sender: &EventSender,
) -> bool {
    let now = Instant::now();
    for link in current {
        let index = link.snapshot.index;
        if !table.contains(index) {
            continue;
        }
        let Some(counters) = link.counters else {
            stats.forget(index);
            continue;
        };
        if let Some(metrics) = stats.observe(index, counters, now)
            && !sender.send(stats_event(container, lab_label, &link.snapshot, &metrics)).await
        {
            return false;
        }
    }
    true
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(index: u32, name: &str, mtu: u32) -> InterfaceSnapshot {
        InterfaceSnapshot {
            index,
            name: name.into(),
            mtu,
            oper_state: "up".into(),
            kind: "veth".into(),
            ..Default::default()
        }
    }

    #[test]
    fn zero_stats_interval_uses_default() {
        assert_eq!(normalize_stats_interval(Duration::ZERO), Duration::from_secs(1));
        assert_eq!(normalize_stats_interval(Duration::from_millis(250)), Duration::from_millis(250));
    }

    #[test]
    fn unknown_upsert_creates_then_change_updates() {
        let mut table = InterfaceTable::new();
        let up = LinkUpdate::Upsert(snap(3, "eth1", 1500).into());
        assert_eq!(table.apply(&up).map(|(a, _)| a), Some("create"));
        assert_eq!(table.apply(&up), None);

        let changed = LinkUpdate::Upsert(snap(3, "eth1", 9000).into());
        let (action, s) = table.apply(&changed).unwrap();
        assert_eq!(action, "update");
        assert_eq!(s.mtu, 9000);
        assert_eq!(table.get(3).map(|s| s.mtu), Some(9000));
    }

    #[test]
    fn delete_reports_last_known_snapshot_only_when_known() {
        let mut table = InterfaceTable::seed([snap(4, "eth2", 1500)]);
        let mut gone = snap(4, "", 0);
        gone.oper_state = "down".into();
        let (action, last) = table.apply(&LinkUpdate::Removed(gone.clone().into())).unwrap();
        assert_eq!(action, "delete");
        assert_eq!(last.name, "eth2");
        assert!(table.is_empty());
        assert_eq!(table.apply(&LinkUpdate::Removed(gone.into())), None);
    }

    #[test]
    fn stats_first_reading_is_baseline() {
        let mut tracker = StatsTracker::default();
        let t0 = Instant::now();
        let c0 = LinkCounters { rx_bytes: 1000, tx_bytes: 0, rx_packets: 10, tx_packets: 0 };
        assert!(tracker.observe(1, c0, t0).is_none());

        let c1 = LinkCounters { rx_bytes: 2000, tx_bytes: 500, rx_packets: 20, tx_packets: 5 };
        let m = tracker.observe(1, c1, t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(m.rx_bps, 4000.0);
        assert_eq!(m.tx_bps, 2000.0);
        assert_eq!(m.rx_pps, 5.0);
        assert_eq!(m.interval, Duration::from_secs(2));
    }

    #[test]
    fn counter_reset_uses_current_value() {
        assert_eq!(delta_counter(100, 150), 50);
        assert_eq!(delta_counter(100, 30), 30);
    }

    #[test]
    fn attributes_carry_lab_and_name() {
        let mut container = Container {
            id: "abcdef0123456789".into(),
            short_id: "abcdef012345".into(),
            names: vec!["clab-lab-r1".into()],
            ..Default::default()
        };
        container.labels.insert("containerlab".into(), "lab".into());
        let mut s = snap(2, "eth1", 1500);
        s.mac = "aa:c1:ab:00:00:01".into();
        let attrs = interface_attributes(&container, "containerlab", &s);
        assert_eq!(attrs["ifname"], "eth1");
        assert_eq!(attrs["index"], "2");
        assert_eq!(attrs["origin"], "netlink");
        assert_eq!(attrs["lab"], "lab");
        assert_eq!(attrs["name"], "clab-lab-r1");
        assert!(!attrs.contains_key("alias"));
    }
}
