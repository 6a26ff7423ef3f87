// Well-known service names by port, from an /etc/services-style file

use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    tcp: HashMap<u16, String>,
    udp: HashMap<u16, String>,
}

impl ServiceTable {
    /// Reads `path`; a missing or unreadable file gives an empty table.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => Self::parse(&s),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Service table not loaded");
                Self::default()
            }
        }
    }

    /// The first entry for a port/protocol pair wins.
    pub fn parse(s: &str) -> Self {
        let mut table = Self::default();
        for line in s.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let (Some(name), Some(port_proto)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Some((port, proto)) = port_proto.split_once('/') else {
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                continue;
            };
            let map = match proto {
                "tcp" => &mut table.tcp,
                "udp" => &mut table.udp,
                _ => continue,
            };
            map.entry(port).or_insert_with(|| name.to_string());
        }
        table
    }

    pub fn tcp(&self, port: u16) -> Option<&str> {
        self.tcp.get(&port).map(String::as_str)
    }

    pub fn udp(&self, port: u16) -> Option<&str> {
        self.udp.get(&port).map(String::as_str)
    }
}
