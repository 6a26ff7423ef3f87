// Network interface snapshots used for diffing link state

/// Observable state of one interface at one instant. Equality is field-wise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSnapshot {
    pub index: u32,
    pub name: String,
    pub alias: String,
    pub mtu: u32,
    pub mac: String,
    pub oper_state: String,
    /// Link kind as reported by the kernel ("veth", "bridge", "device", ...).
    pub kind: String,
}

/// Cumulative link counters as reported by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

/// A snapshot plus the link details that are not part of its identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkState {
    pub snapshot: InterfaceSnapshot,
    pub counters: Option<LinkCounters>,
    /// Index of the bridge/bond this link is enslaved to.
    pub controller: Option<u32>,
}

impl From<InterfaceSnapshot> for LinkState {
    fn from(snapshot: InterfaceSnapshot) -> Self {
        Self {
            snapshot,
            counters: None,
            controller: None,
        }
    }
}
