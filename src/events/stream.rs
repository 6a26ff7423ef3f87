// Stream orchestrator: fans runtime, netlink and traffic events into one formatted sink

use super::{EventSender, Formatter};
use crate::error::EventsError;
use crate::models::{AggregatedEvent, Container, ContainerState, EventKind, RuntimeEvent, exposed_ports_value};
use crate::netlink::{LinkMonitor, WatchOptions, WatcherRegistry};
use crate::runtime::{ContainerFilter, ContainerRuntime, RuntimeError, RuntimeEventStream};
use crate::traffic::{ServiceTable, TcBpfBackend, TrafficBackend, TrafficCollector, TrafficError};
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

const TRAFFIC_CLEANUP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub format: String,
    /// Runtime the caller expects; must match the bound runtime's name.
    pub runtime: String,
    pub lab_label: String,
    pub include_initial_state: bool,
    pub include_interface_stats: bool,
    pub stats_interval: Duration,
    pub include_traffic: bool,
    pub traffic_interval: Duration,
    pub services_file: PathBuf,
    pub channel_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            format: "plain".to_string(),
            runtime: "docker".to_string(),
            lab_label: "containerlab".to_string(),
            include_initial_state: false,
            include_interface_stats: false,
            stats_interval: Duration::from_secs(1),
            include_traffic: false,
            traffic_interval: Duration::from_secs(5),
            services_file: PathBuf::from("/etc/services"),
            channel_capacity: 128,
        }
    }
}

/// One stream invocation. Owns its own watcher registry.
pub struct Pipeline<R, M, B = TcBpfBackend> {
    runtime: Arc<R>,
    monitor: Arc<M>,
    traffic: Option<B>,
    options: StreamOptions,
}

impl<R: ContainerRuntime, M: LinkMonitor> Pipeline<R, M> {
    pub fn new(runtime: Arc<R>, monitor: Arc<M>, options: StreamOptions) -> Self {
        Self {
            runtime,
            monitor,
            traffic: None,
            options,
        }
    }
}

impl<R: ContainerRuntime, M: LinkMonitor, B: TrafficBackend> Pipeline<R, M, B> {
    /// Counter backend used when traffic sampling is enabled.
    pub fn with_traffic<T: TrafficBackend>(self, backend: T) -> Pipeline<R, M, T> {
        Pipeline {
            runtime: self.runtime,
            monitor: self.monitor,
            traffic: Some(backend),
            options: self.options,
        }
    }

    /// Streams until `cancel` fires (clean return) or a fatal error occurs.
    #[instrument(skip_all, fields(runtime = %self.options.runtime, format = %self.options.format))]
    pub async fn run<W: Write + Send>(mut self, cancel: CancellationToken, mut sink: W) -> Result<(), EventsError> {
        let formatter = Formatter::from_name(&self.options.format)?;
        if !self.runtime.name().eq_ignore_ascii_case(&self.options.runtime) {
            return Err(EventsError::RuntimeNotInitialized(self.options.runtime.clone()));
        }
        if self.options.include_traffic && self.traffic.is_none() {
            return Err(EventsError::Config(
                "traffic sampling requested without a counter backend".to_string(),
            ));
        }

        let cancel = cancel.child_token();
        let _stop_tasks = cancel.clone().drop_guard();
        let (tx, mut rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let sender = EventSender::new(tx, cancel.clone());

        let lab_label = self.options.lab_label.clone();
        let registry = WatcherRegistry::new(
            self.runtime.clone(),
            self.monitor.clone(),
            sender.clone(),
            WatchOptions {
                lab_label: lab_label.clone(),
                include_initial_state: self.options.include_initial_state,
                stats_interval: self
                    .options
                    .include_interface_stats
                    .then_some(self.options.stats_interval),
            },
        );

        let containers = self
            .runtime
            .list_containers(&ContainerFilter::label_exists(&lab_label))
            .await?;
        info!(containers = containers.len(), "Listed lab containers");

        if self.options.include_initial_state {
            tokio::spawn(emit_container_snapshots(containers.clone(), sender.clone()));
        }
        for container in containers.iter().filter(|c| c.is_running()) {
            registry.start(container.clone()).await;
        }

        let events = self.runtime.events(&lab_label).await?;
        let mut forwarder: Option<JoinHandle<Result<(), RuntimeError>>> = Some(tokio::spawn(forward_runtime_events(
            self.runtime.clone(),
            registry.clone(),
            events,
            sender.clone(),
        )));

        let mut traffic: Option<JoinHandle<Result<(), TrafficError>>> = None;
        if self.options.include_traffic
            && let Some(backend) = self.traffic.take()
        {
            let services = ServiceTable::load(&self.options.services_file);
            let collector = TrafficCollector::init(backend, &containers, self.options.traffic_interval, services).await?;
            traffic = Some(tokio::spawn(collector.run(sender.clone())));
        }
        drop(sender);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Stream cancelled");
                    registry.shutdown().await;
                    if let Some(handle) = traffic.take()
                        && tokio::time::timeout(TRAFFIC_CLEANUP_GRACE, handle).await.is_err()
                    {
                        debug!("Traffic cleanup did not finish in time");
                    }
                    return Ok(());
                }
                Some(ev) = rx.recv() => {
                    if let Err(e) = formatter.write(&mut sink, &ev).and_then(|()| sink.flush()) {
                        debug!(error = %e, "Failed to write event");
                    }
                }
                res = join_task(&mut forwarder) => {
                    forwarder = None;
                    match res {
                        Ok(Ok(())) => debug!("Runtime event feed closed"),
                        Ok(Err(e)) => return Err(e.into()),
                        Err(e) => return Err(EventsError::Task(e)),
                    }
                }
                res = join_task(&mut traffic) => {
                    traffic = None;
                    match res {
                        Ok(Ok(())) => debug!("Traffic collector finished"),
                        Ok(Err(e)) => return Err(e.into()),
                        Err(e) => return Err(EventsError::Task(e)),
                    }
                }
            }
        }
    }
}

/// Resolves when the task finishes; pends forever when there is no task.
async fn join_task<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, tokio::task::JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn forward_runtime_events<R: ContainerRuntime, M: LinkMonitor>(
    runtime: Arc<R>,
    registry: WatcherRegistry<R, M>,
    mut events: RuntimeEventStream,
    sender: EventSender,
) -> Result<(), RuntimeError> {
    let cancel = sender.token().clone();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = events.next() => next,
        };
        let ev = match next {
            None => return Ok(()),
            Some(Err(e)) => return Err(e),
            Some(Ok(ev)) => ev,
        };

        registry.handle(&ev).await;
        let mut attributes: BTreeMap<String, String> = ev.attributes.clone().into_iter().collect();
        if ev.is_container() {
            enrich_container_attributes(runtime.as_ref(), &mut attributes, ev.full_id(), ev.name()).await;
        }
        if !sender.send(event_from_runtime(&ev, attributes)).await {
            return Ok(());
        }
    }
}

/// Builds the pipeline record for one runtime event.
pub fn event_from_runtime(ev: &RuntimeEvent, attributes: BTreeMap<String, String>) -> AggregatedEvent {
    let mut event = AggregatedEvent::new(EventKind::parse(&ev.kind), &ev.action)
        .actor(&ev.actor_id, ev.name(), ev.full_id())
        .attributes(attributes);
    if let Some(ts) = ev.timestamp {
        event = event.at(ts);
    }
    event
}

/// Fills in missing `mgmt_ipv4`, `mgmt_ipv6` and `ports` from the runtime's view of the container.
pub async fn enrich_container_attributes<R: ContainerRuntime>(
    runtime: &R,
    attributes: &mut BTreeMap<String, String>,
    full_id: &str,
    name: &str,
) {
    let missing = |key: &str| attributes.get(key).is_none_or(|v| v.is_empty());
    let (need_v4, need_v6, need_ports) = (missing("mgmt_ipv4"), missing("mgmt_ipv6"), missing("ports"));
    if !(need_v4 || need_v6 || need_ports) {
        return;
    }

    let filter = if !full_id.is_empty() {
        ContainerFilter {
            id: Some(full_id.to_string()),
            ..Default::default()
        }
    } else if !name.is_empty() {
        ContainerFilter {
            name: Some(name.to_string()),
            ..Default::default()
        }
    } else {
        return;
    };

    let containers = match runtime.list_containers(&filter).await {
        Ok(containers) => containers,
        Err(e) => {
            debug!(container = %name, error = %e, "Failed to resolve container for event");
            return;
        }
    };
    let Some(container) = select_container(&containers, full_id, name) else {
        return;
    };

    if need_v4 && !container.mgmt_ipv4.is_empty() {
        attributes.insert("mgmt_ipv4".to_string(), container.mgmt_ipv4.clone());
    }
    if need_v6 && !container.mgmt_ipv6.is_empty() {
        attributes.insert("mgmt_ipv6".to_string(), container.mgmt_ipv6.clone());
    }
    let ports = exposed_ports_value(&container.ports);
    if need_ports && !ports.is_empty() {
        attributes.insert("ports".to_string(), ports);
    }
}

fn select_container<'a>(containers: &'a [Container], full_id: &str, name: &str) -> Option<&'a Container> {
    if !full_id.is_empty()
        && let Some(c) = containers
            .iter()
            .find(|c| c.id == full_id || c.id.starts_with(full_id) || c.short_id == full_id)
    {
        return Some(c);
    }
    if !name.is_empty()
        && let Some(c) = containers.iter().find(|c| c.names.iter().any(|n| n == name))
    {
        return Some(c);
    }
    containers.first()
}

/// Snapshot record of a container listed before streaming started.
pub fn container_snapshot_event(container: &Container) -> AggregatedEvent {
    let state = container.state.as_str();
    let mut attributes: BTreeMap<String, String> = container
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    attributes
        .entry("origin".to_string())
        .or_insert_with(|| "snapshot".to_string());
    for (key, value) in [
        ("image", container.image.clone()),
        ("status", container.status.clone()),
        ("state", state.to_string()),
        ("network", container.network_name.clone()),
        ("mgmt_ipv4", container.mgmt_ipv4.clone()),
        ("mgmt_ipv6", container.mgmt_ipv6.clone()),
        ("ports", exposed_ports_value(&container.ports)),
    ] {
        if !value.is_empty() {
            attributes.insert(key.to_string(), value);
        }
    }

    let action = if state.is_empty() { "snapshot" } else { state };
    AggregatedEvent::new(EventKind::Container, action)
        .actor(&container.short_id, container.first_name(), &container.id)
        .attributes(attributes)
}

async fn emit_container_snapshots(containers: Vec<Container>, sender: EventSender) {
    for container in &containers {
        if !matches!(container.state, ContainerState::Running | ContainerState::Exited) {
            continue;
        }
        let event = container_snapshot_event(container);
        if event.actor_id.is_empty() && event.actor_name.is_empty() {
            continue;
        }
        if !sender.send(event).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PortBinding;

    #[test]
    fn runtime_event_keeps_timestamp_and_lowercases() {
        let ts = chrono::DateTime::from_timestamp(1_700_000_000, 5).unwrap();
        let mut ev = RuntimeEvent {
            kind: "Container".into(),
            action: "Start".into(),
            actor_full_id: "0123456789abcdef".into(),
            timestamp: Some(ts),
            ..Default::default()
        };
        ev.attributes.insert("name".into(), "r1".into());
        let out = event_from_runtime(&ev, BTreeMap::new());
        assert_eq!(out.kind, EventKind::Container);
        assert_eq!(out.action, "start");
        assert_eq!(out.actor_id, "0123456789ab");
        assert_eq!(out.actor_name, "r1");
        assert_eq!(out.timestamp, ts);
    }

    #[test]
    fn snapshot_event_carries_container_details() {
        let mut container = Container {
            id: "feedfacecafebeef".into(),
            short_id: "feedfacecafe".into(),
            names: vec!["clab-lab-r1".into()],
            state: ContainerState::Running,
            image: "ceos:4.32".into(),
            mgmt_ipv4: "172.20.20.2/24".into(),
            ports: vec![PortBinding {
                host_ip: String::new(),
                host_port: 0,
                container_port: 22,
                protocol: "tcp".into(),
            }],
            ..Default::default()
        };
        container.labels.insert("containerlab".into(), "lab".into());
        let ev = container_snapshot_event(&container);
        assert_eq!(ev.action, "running");
        assert_eq!(ev.attributes["origin"], "snapshot");
        assert_eq!(ev.attributes["state"], "running");
        assert_eq!(ev.attributes["ports"], "22/tcp");
        assert_eq!(ev.attributes["containerlab"], "lab");
        assert!(!ev.attributes.contains_key("network"));
    }

    #[test]
    fn select_prefers_id_then_name() {
        let a = Container {
            id: "aaaa1111".into(),
            names: vec!["r1".into()],
            ..Default::default()
        };
        let b = Container {
            id: "bbbb2222".into(),
            names: vec!["r2".into()],
            ..Default::default()
        };
        let list = vec![a, b];
        assert_eq!(select_container(&list, "bbbb", "").map(|c| c.id.as_str()), Some("bbbb2222"));
        assert_eq!(select_container(&list, "", "r2").map(|c| c.id.as_str()), Some("bbbb2222"));
        assert_eq!(select_container(&list, "zzzz", "").map(|c| c.id.as_str()), Some("aaaa1111"));
        assert!(select_container(&[], "x", "y").is_none());
    }
}
