// Docker runtime via bollard

use super::{ContainerFilter, ContainerRuntime, RuntimeError, RuntimeEventStream};
use crate::models::{Container, ContainerState, PortBinding, RuntimeEvent, short_id};
use bollard::Docker;
use bollard::query_parameters::{EventsOptions, InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerSummary, EventMessage};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::warn;

const EVENT_BUFFER: usize = 64;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to `socket`, or to the default unix socket when empty.
    pub fn connect(socket: &str, timeout_secs: u64) -> anyhow::Result<Self> {
        let docker = if socket.is_empty() {
            Docker::connect_with_unix_defaults()?.with_timeout(std::time::Duration::from_secs(timeout_secs))
        } else {
            Docker::connect_with_unix(socket, timeout_secs, bollard::API_DEFAULT_VERSION)?
        };
        Ok(Self { docker })
    }

    async fn pid_of(&self, id: &str) -> Result<Option<u32>, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        let pid = inspect
            .state
            .and_then(|s| s.pid)
            .filter(|pid| *pid > 0)
            .and_then(|pid| u32::try_from(pid).ok());
        Ok(pid)
    }
}

impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<Container>, RuntimeError> {
        let mut filters = HashMap::new();
        if let Some(label) = &filter.label {
            filters.insert("label".to_string(), vec![label.clone()]);
        }
        if let Some(id) = &filter.id {
            filters.insert("id".to_string(), vec![id.clone()]);
        }
        if let Some(name) = &filter.name {
            filters.insert("name".to_string(), vec![name.clone()]);
        }

        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };
        let summaries = self.docker.list_containers(Some(options)).await?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in &summaries {
            let mut container = container_from_summary(summary);
            if needs_pid(filter, &container) {
                match self.pid_of(&container.id).await {
                    Ok(pid) => container.pid = pid,
                    Err(e) => warn!(container = %container.first_name(), error = %e, "inspect failed"),
                }
            }
            containers.push(container);
        }
        Ok(containers)
    }

    async fn events(&self, label: &str) -> Result<RuntimeEventStream, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        let options = EventsOptions {
            filters: Some(filters),
            ..Default::default()
        };

        let docker = self.docker.clone();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            let mut stream = docker.events(Some(options));
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = stream.next() => {
                        let Some(item) = next else { break };
                        let item = item.map(event_from_message).map_err(RuntimeError::from);
                        let failed = item.is_err();
                        if tx.send(item).await.is_err() || failed {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Docker event stream ended");
        });

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn namespace_path(&self, id: &str) -> Result<PathBuf, RuntimeError> {
        match self.pid_of(id).await? {
            Some(pid) => Ok(PathBuf::from(format!("/proc/{pid}/ns/net"))),
            None => Err(RuntimeError::NoProcess { id: id.to_string() }),
        }
    }
}

fn needs_pid(filter: &ContainerFilter, container: &Container) -> bool {
    filter.with_pid && container.is_running()
}

pub(crate) fn container_from_summary(c: &ContainerSummary) -> Container {
    let id = c.id.clone().unwrap_or_default();
    let names = c
        .names
        .as_ref()
        .map(|names| {
            names
                .iter()
                .map(|n| n.trim_start_matches('/').to_string())
                .collect()
        })
        .unwrap_or_default();
    let state = c
        .state
        .as_ref()
        .map(|s| ContainerState::from_docker(&s.to_string()))
        .unwrap_or_default();

    let mut network_name = String::new();
    let mut mgmt_ipv4 = String::new();
    let mut mgmt_ipv6 = String::new();
    if let Some(networks) = c.network_settings.as_ref().and_then(|n| n.networks.as_ref()) {
        let mut names: Vec<&String> = networks.keys().collect();
        names.sort();
        if let Some(name) = names.first() {
            network_name = (*name).clone();
            let endpoint = &networks[*name];
            if let Some(ip) = endpoint.ip_address.as_ref().filter(|ip| !ip.is_empty()) {
                mgmt_ipv4 = format!("{}/{}", ip, endpoint.ip_prefix_len.unwrap_or(0));
            }
            if let Some(ip) = endpoint.global_ipv6_address.as_ref().filter(|ip| !ip.is_empty()) {
                mgmt_ipv6 = format!("{}/{}", ip, endpoint.global_ipv6_prefix_len.unwrap_or(0));
            }
        }
    }

    let ports = c
        .ports
        .as_ref()
        .map(|ports| {
            ports
                .iter()
                .map(|p| PortBinding {
                    host_ip: p.ip.clone().unwrap_or_default(),
                    host_port: p.public_port.unwrap_or(0),
                    container_port: p.private_port,
                    protocol: p.typ.as_ref().map(|t| t.to_string()).unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    Container {
        short_id: short_id(&id).to_string(),
        id,
        names,
        labels: c.labels.clone().unwrap_or_default(),
        state,
        status: c.status.clone().unwrap_or_default(),
        image: c.image.clone().unwrap_or_default(),
        pid: None,
        network_name,
        mgmt_ipv4,
        mgmt_ipv6,
        ports,
    }
}

pub(crate) fn event_from_message(msg: EventMessage) -> RuntimeEvent {
    let timestamp = msg
        .time_nano
        .filter(|ns| *ns > 0)
        .map(DateTime::<Utc>::from_timestamp_nanos)
        .or_else(|| {
            msg.time
                .filter(|s| *s > 0)
                .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        });
    let (actor_full_id, attributes) = match msg.actor {
        Some(actor) => (
            actor.id.unwrap_or_default(),
            actor.attributes.unwrap_or_default(),
        ),
        None => (String::new(), HashMap::new()),
    };
    let actor_name = attributes.get("name").cloned().unwrap_or_default();

    RuntimeEvent {
        kind: msg.typ.map(|t| t.to_string()).unwrap_or_default(),
        action: msg.action.unwrap_or_default(),
        actor_id: short_id(&actor_full_id).to_string(),
        actor_full_id,
        actor_name,
        attributes,
        timestamp,
    }
}
