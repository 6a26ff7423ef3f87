// Counter keys, protocol buckets, differencing and row aggregation

use super::ServiceTable;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

pub const BUCKET_IPV4: u8 = 1;
pub const BUCKET_IPV6: u8 = 2;
pub const BUCKET_ARP: u8 = 3;
pub const BUCKET_ICMP: u8 = 4;
pub const BUCKET_ICMPV6: u8 = 5;
pub const BUCKET_TCP: u8 = 6;
pub const BUCKET_UDP: u8 = 7;
pub const BUCKET_BGP: u8 = 8;
pub const BUCKET_STP: u8 = 9;
pub const BUCKET_LLDP: u8 = 10;
pub const BUCKET_OTHER_L2: u8 = 11;

pub const DIRECTION_INGRESS: u8 = 0;
pub const DIRECTION_EGRESS: u8 = 1;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Key of the kernel `proto_counters` map. Layout matches the classifier program.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtoCounterKey {
    pub ifindex: u32,
    pub direction: u8,
    pub bucket: u8,
    pub port: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtoCounterValue {
    pub packets: u64,
    pub bytes: u64,
}

impl ProtoCounterValue {
    pub fn new(packets: u64, bytes: u64) -> Self {
        Self { packets, bytes }
    }

    pub fn add(&mut self, other: ProtoCounterValue) {
        self.packets += other.packets;
        self.bytes += other.bytes;
    }
}

pub type CounterSnapshot = HashMap<ProtoCounterKey, ProtoCounterValue>;

/// Per-key growth from `previous` to `current`. A counter that went down counts
/// as zero; keys with no growth at all are left out.
pub fn diff_counters(previous: &CounterSnapshot, current: &CounterSnapshot) -> CounterSnapshot {
    current
        .iter()
        .filter_map(|(key, now)| {
            let then = previous.get(key).copied().unwrap_or_default();
            let delta = ProtoCounterValue {
                packets: now.packets.saturating_sub(then.packets),
                bytes: now.bytes.saturating_sub(then.bytes),
            };
            (delta.packets > 0 || delta.bytes > 0).then_some((*key, delta))
        })
        .collect()
}

/// Human label of a bucket; `None` for buckets the collector does not know.
pub fn protocol_label(bucket: u8, port: u16, services: &ServiceTable) -> Option<String> {
    let label = match bucket {
        BUCKET_IPV4 => "ipv4".to_string(),
        BUCKET_IPV6 => "ipv6".to_string(),
        BUCKET_ARP => "arp".to_string(),
        BUCKET_ICMP => "icmp".to_string(),
        BUCKET_ICMPV6 => "icmpv6".to_string(),
        BUCKET_BGP => "bgp/tcp".to_string(),
        BUCKET_STP => "stp".to_string(),
        BUCKET_LLDP => "lldp".to_string(),
        BUCKET_OTHER_L2 => "other_l2".to_string(),
        BUCKET_TCP => match services.tcp(port) {
            Some(svc) => format!("{svc}/tcp"),
            None => format!("tcp/{port}/tcp"),
        },
        BUCKET_UDP => match services.udp(port) {
            Some(svc) => format!("{svc}/udp"),
            None => format!("udp/{port}/udp"),
        },
        _ => return None,
    };
    Some(label)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolRow {
    pub protocol: String,
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRow {
    pub interface: String,
    pub protocol: String,
    pub packets: u64,
    pub bytes: u64,
}

/// One tick's roll-up across scopes.
#[derive(Debug, Default)]
pub struct Aggregation {
    global: BTreeMap<String, ProtoCounterValue>,
    interfaces: BTreeMap<(String, String), ProtoCounterValue>,
}

impl Aggregation {
    /// Adds one scope's delta. Interface names are qualified with `qualifier`
    /// when one is given.
    pub fn add_scope(
        &mut self,
        qualifier: Option<&str>,
        ifnames: &HashMap<u32, String>,
        delta: &CounterSnapshot,
        services: &ServiceTable,
    ) {
        for (key, value) in delta {
            let Some(protocol) = protocol_label(key.bucket, key.port, services) else {
                continue;
            };
            self.global.entry(protocol.clone()).or_default().add(*value);

            let ifname = match ifnames.get(&key.ifindex) {
                Some(name) if !name.is_empty() => name.clone(),
                _ => format!("ifindex-{}", key.ifindex),
            };
            let ifname = match qualifier {
                Some(q) => format!("{q}:{ifname}"),
                None => ifname,
            };
            self.interfaces
                .entry((ifname, protocol))
                .or_default()
                .add(*value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.interfaces.is_empty()
    }

    /// Rows sorted by bytes desc, packets desc, then names.
    pub fn into_rows(self) -> (Vec<ProtocolRow>, Vec<InterfaceRow>) {
        let mut global: Vec<ProtocolRow> = self
            .global
            .into_iter()
            .map(|(protocol, v)| ProtocolRow {
                protocol,
                packets: v.packets,
                bytes: v.bytes,
            })
            .collect();
        global.sort_by(|a, b| {
            b.bytes
                .cmp(&a.bytes)
                .then_with(|| b.packets.cmp(&a.packets))
                .then_with(|| a.protocol.cmp(&b.protocol))
        });

        let mut interfaces: Vec<InterfaceRow> = self
            .interfaces
            .into_iter()
            .map(|((interface, protocol), v)| InterfaceRow {
                interface,
                protocol,
                packets: v.packets,
                bytes: v.bytes,
            })
            .collect();
        interfaces.sort_by(|a, b| {
            b.bytes
                .cmp(&a.bytes)
                .then_with(|| b.packets.cmp(&a.packets))
                .then_with(|| a.interface.cmp(&b.interface))
                .then_with(|| a.protocol.cmp(&b.protocol))
        });
        (global, interfaces)
    }
}

/// Zero means the default; anything under a second is raised to one second.
pub fn normalize_interval(interval: Duration) -> Duration {
    if interval.is_zero() {
        DEFAULT_INTERVAL
    } else {
        interval.max(MIN_INTERVAL)
    }
}

/// Compact duration text: "5s", "1m30s", "1.5s", "250ms".
pub fn format_window(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", fraction(nanos, 1_000));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", fraction(nanos, 1_000_000));
    }

    let secs = d.as_secs();
    let (hours, minutes) = (secs / 3600, (secs % 3600) / 60);
    let seconds = fraction(u128::from(secs % 60) * 1_000_000_000 + u128::from(d.subsec_nanos()), 1_000_000_000);
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h{minutes}m"));
    } else if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    out.push_str(&seconds);
    out.push('s');
    out
}

fn fraction(value: u128, unit: u128) -> String {
    let whole = value / unit;
    let rest = value % unit;
    if rest == 0 {
        return whole.to_string();
    }
    let width = unit.ilog10() as usize;
    let digits = format!("{rest:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}
