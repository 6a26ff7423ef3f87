// Container and runtime event records handed over by the container runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Container state; serializes to lowercase JSON (e.g. "running").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Paused,
    Restarting,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Parse from a runtime state string (e.g. "running", "exited").
    pub fn from_docker(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "exited" => ContainerState::Exited,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

impl PortBinding {
    fn render(&self) -> Option<String> {
        let proto = self.protocol.trim().to_lowercase();
        let suffix = if proto.is_empty() {
            String::new()
        } else {
            format!("/{proto}")
        };

        if self.host_port > 0 {
            let host_ip = match self.host_ip.as_str() {
                "" => "0.0.0.0".to_string(),
                ip if ip.contains(':') => format!("[{ip}]"),
                ip => ip.to_string(),
            };
            return Some(if self.container_port > 0 {
                format!("{host_ip}:{}{suffix}->{}", self.host_port, self.container_port)
            } else {
                format!("{host_ip}:{}{suffix}", self.host_port)
            });
        }

        if self.container_port == 0 {
            return None;
        }
        Some(format!("{}{suffix}", self.container_port))
    }
}

/// Renders exposed ports as one `;`-joined attribute value, in a stable order.
pub fn exposed_ports_value(ports: &[PortBinding]) -> String {
    let mut sorted: Vec<&PortBinding> = ports.iter().collect();
    sorted.sort_by(|a, b| {
        a.container_port
            .cmp(&b.container_port)
            .then_with(|| a.protocol.cmp(&b.protocol))
            .then_with(|| a.host_port.cmp(&b.host_port))
            .then_with(|| a.host_ip.cmp(&b.host_ip))
    });
    sorted
        .into_iter()
        .filter_map(PortBinding::render)
        .collect::<Vec<_>>()
        .join(";")
}

/// A container as listed by the runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    pub id: String,
    pub short_id: String,
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
    pub state: ContainerState,
    pub status: String,
    pub image: String,
    /// Init process id, when the container is running.
    pub pid: Option<u32>,
    pub network_name: String,
    pub mgmt_ipv4: String,
    pub mgmt_ipv6: String,
    pub ports: Vec<PortBinding>,
}

impl Container {
    pub fn first_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or_default()
    }

    /// Registry key: the full id, or the short id when the full one is unknown.
    pub fn identity(&self) -> &str {
        if self.id.is_empty() {
            &self.short_id
        } else {
            &self.id
        }
    }

    pub fn label(&self, key: &str) -> &str {
        self.labels.get(key).map(String::as_str).unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}

/// One message from the runtime's event feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeEvent {
    pub kind: String,
    pub action: String,
    pub actor_id: String,
    pub actor_full_id: String,
    pub actor_name: String,
    pub attributes: HashMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl RuntimeEvent {
    pub fn is_container(&self) -> bool {
        self.kind.eq_ignore_ascii_case("container")
    }

    /// Full id if present, else the short actor id.
    pub fn full_id(&self) -> &str {
        if self.actor_full_id.is_empty() {
            &self.actor_id
        } else {
            &self.actor_full_id
        }
    }

    /// Actor name, falling back to the `name` attribute runtimes attach to container events.
    pub fn name(&self) -> &str {
        if self.actor_name.is_empty() {
            self.attributes
                .get("name")
                .map(String::as_str)
                .unwrap_or_default()
        } else {
            &self.actor_name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(host_ip: &str, host_port: u16, container_port: u16, protocol: &str) -> PortBinding {
        PortBinding {
            host_ip: host_ip.into(),
            host_port,
            container_port,
            protocol: protocol.into(),
        }
    }

    #[test]
    fn ports_render_sorted_and_bracketed() {
        let ports = vec![
            port("::", 8443, 443, "tcp"),
            port("", 2222, 22, "TCP"),
            port("", 0, 161, "udp"),
            port("", 0, 0, "tcp"),
        ];
        assert_eq!(
            exposed_ports_value(&ports),
            "0.0.0.0:2222/tcp->22;161/udp;[::]:8443/tcp->443"
        );
    }

    #[test]
    fn state_parse_roundtrip() {
        assert_eq!(ContainerState::from_docker("Running"), ContainerState::Running);
        assert_eq!(ContainerState::from_docker("weird"), ContainerState::Unknown);
        assert_eq!(ContainerState::Exited.as_str(), "exited");
    }

    #[test]
    fn event_name_falls_back_to_attribute() {
        let mut ev = RuntimeEvent::default();
        ev.attributes.insert("name".into(), "clab-lab-r1".into());
        assert_eq!(ev.name(), "clab-lab-r1");
        ev.actor_id = "abc".into();
        assert_eq!(ev.full_id(), "abc");
    }
}
