// Traffic collector: scope setup, per-tick reconciliation, sampling and teardown

use super::backend::{CounterTable, ScopeSpec, TrafficBackend, desired_interfaces};
use super::counters::{Aggregation, InterfaceRow, ProtocolRow, format_window, normalize_interval};
use super::{CounterSnapshot, ServiceTable, TrafficError, diff_counters};
use crate::events::EventSender;
use crate::models::{AggregatedEvent, Container, EventKind};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

const SAMPLE_ACTOR: &str = "tc-ebpf-map";

struct Scope<T> {
    spec: ScopeSpec,
    table: T,
    attached: BTreeSet<String>,
    previous: CounterSnapshot,
    ifnames: HashMap<u32, String>,
}

impl<T: CounterTable> Scope<T> {
    /// Attaches newly desired interfaces and detaches vanished ones. Returns the
    /// first attach error when the scope ends up with nothing attached.
    async fn reconcile(&mut self) -> Option<TrafficError> {
        let links = match self.table.links().await {
            Ok(links) => links,
            Err(e) => {
                debug!(scope = %self.spec.label, error = %e, "Traffic interface listing failed");
                return None;
            }
        };
        let (desired, ifnames) = desired_interfaces(&links);
        self.ifnames = ifnames;
        if desired.is_empty() {
            debug!(scope = %self.spec.label, "No interfaces for traffic attachment");
            return None;
        }

        let mut first_err = None;
        for ifname in &desired {
            if self.attached.contains(ifname) {
                continue;
            }
            match self.table.attach(ifname).await {
                Ok(()) => {
                    self.attached.insert(ifname.clone());
                }
                Err(e) => {
                    debug!(scope = %self.spec.label, interface = %ifname, error = %e, "Traffic attach failed");
                    first_err.get_or_insert(e);
                }
            }
        }

        let stale: Vec<String> = self
            .attached
            .iter()
            .filter(|name| !desired.contains(name))
            .cloned()
            .collect();
        for ifname in stale {
            self.table.detach(&ifname).await;
            self.attached.remove(&ifname);
        }

        if self.attached.is_empty() { first_err } else { None }
    }

    async fn close(mut self) {
        for ifname in std::mem::take(&mut self.attached) {
            self.table.detach(&ifname).await;
        }
        self.table.close().await;
    }
}

/// Samples protocol counters of every discovered scope on a fixed interval.
pub struct TrafficCollector<B: TrafficBackend> {
    backend: B,
    interval: Duration,
    services: ServiceTable,
    scopes: Vec<Scope<B::Table>>,
}

impl<B: TrafficBackend> TrafficCollector<B> {
    /// Prepares the backend, loads every scope and takes the baseline reading.
    /// Anything already loaded is torn down again on failure.
    pub async fn init(
        backend: B,
        containers: &[Container],
        interval: Duration,
        services: ServiceTable,
    ) -> Result<Self, TrafficError> {
        let mut collector = Self {
            backend,
            interval: normalize_interval(interval),
            services,
            scopes: Vec::new(),
        };
        match collector.load_scopes(containers).await {
            Ok(()) => Ok(collector),
            Err(e) => {
                collector.cleanup().await;
                Err(e)
            }
        }
    }

    async fn load_scopes(&mut self, containers: &[Container]) -> Result<(), TrafficError> {
        self.backend.prepare().await?;
        let mut specs = self.backend.discover(containers).await?;
        specs.sort_by(|a, b| a.id.cmp(&b.id));

        let mut first_err = None;
        for spec in specs {
            let table = self.backend.load(&spec).await?;
            let mut scope = Scope {
                spec,
                table,
                attached: BTreeSet::new(),
                previous: CounterSnapshot::new(),
                ifnames: HashMap::new(),
            };
            if let Some(e) = scope.reconcile().await {
                first_err.get_or_insert(e);
            }
            let baseline = scope.table.read().await;
            match baseline {
                Ok(baseline) => scope.previous = baseline,
                Err(e) => {
                    self.scopes.push(scope);
                    return Err(e);
                }
            }
            self.scopes.push(scope);
        }

        if self.scopes.is_empty() {
            return Err(TrafficError::NoScopes);
        }
        if let Some(e) = first_err
            && self.attached_total() == 0
        {
            return Err(e);
        }
        info!(
            scopes = self.scopes.len(),
            interfaces = self.attached_total(),
            interval = %format_window(self.interval),
            "Traffic collector ready"
        );
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    fn attached_total(&self) -> usize {
        self.scopes.iter().map(|s| s.attached.len()).sum()
    }

    /// Samples until cancelled or until a fatal error. Cleanup always runs.
    #[instrument(name = "traffic", skip_all)]
    pub async fn run(mut self, sender: EventSender) -> Result<(), TrafficError> {
        let cancel = sender.token().clone();
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    match self.sample(&sender).await {
                        Ok(true) => {}
                        Ok(false) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
            }
        };
        if let Err(e) = &result {
            warn!(error = %e, "Traffic collector stopped");
        }
        self.cleanup().await;
        result
    }

    /// One tick. Returns false once the sender is closed or cancelled.
    async fn sample(&mut self, sender: &EventSender) -> Result<bool, TrafficError> {
        let mut aggregation = Aggregation::default();
        let mut first_err = None;

        for scope in &mut self.scopes {
            if let Some(e) = scope.reconcile().await {
                first_err.get_or_insert(e);
            }
            let current = scope.table.read().await?;
            let delta = diff_counters(&scope.previous, &current);
            scope.previous = current;
            if !delta.is_empty() {
                let qualifier = (!scope.spec.is_host()).then_some(scope.spec.label.as_str());
                aggregation.add_scope(qualifier, &scope.ifnames, &delta, &self.services);
            }
        }

        let attached = self.attached_total();
        if let Some(e) = first_err
            && attached == 0
        {
            return Err(e);
        }
        if aggregation.is_empty() {
            return Ok(true);
        }

        let (global, interfaces) = aggregation.into_rows();
        let window = format_window(self.interval);
        let now = Utc::now();
        let events = std::iter::once(sample_event(
            now,
            &window,
            attached,
            global.len(),
            interfaces.len(),
            self.scopes.len(),
        ))
        .chain(global.iter().map(|row| global_event(now, &window, row)))
        .chain(interfaces.iter().map(|row| interface_event(now, &window, row)));

        for event in events {
            if !sender.send(event).await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Detaches, unpins and removes everything, for every scope.
    async fn cleanup(&mut self) {
        for scope in std::mem::take(&mut self.scopes) {
            scope.close().await;
        }
        self.backend.finish().await;
        debug!("Traffic collector cleaned up");
    }
}

fn traffic_event(now: DateTime<Utc>, action: &str, actor: &str) -> AggregatedEvent {
    AggregatedEvent::new(EventKind::Traffic, action)
        .at(now)
        .actor("", actor, "")
}

fn sample_event(
    now: DateTime<Utc>,
    window: &str,
    interfaces: usize,
    global_rows: usize,
    iface_rows: usize,
    scopes: usize,
) -> AggregatedEvent {
    traffic_event(now, "sample", SAMPLE_ACTOR).attributes([
        ("window", window.to_string()),
        ("interfaces", interfaces.to_string()),
        ("global_rows", global_rows.to_string()),
        ("iface_rows", iface_rows.to_string()),
        ("scopes", scopes.to_string()),
    ])
}

fn global_event(now: DateTime<Utc>, window: &str, row: &ProtocolRow) -> AggregatedEvent {
    traffic_event(now, "global", &row.protocol).attributes([
        ("scope", "global".to_string()),
        ("protocol", row.protocol.clone()),
        ("packets", row.packets.to_string()),
        ("bytes", row.bytes.to_string()),
        ("window", window.to_string()),
    ])
}

fn interface_event(now: DateTime<Utc>, window: &str, row: &InterfaceRow) -> AggregatedEvent {
    traffic_event(now, "interface", &row.interface).attributes([
        ("scope", "interface".to_string()),
        ("interface", row.interface.clone()),
        ("protocol", row.protocol.clone()),
        ("packets", row.packets.to_string()),
        ("bytes", row.bytes.to_string()),
        ("window", window.to_string()),
    ])
}
