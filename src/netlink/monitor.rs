// Link inventory and change notifications inside one network namespace

use super::WatchError;
use crate::models::{InterfaceSnapshot, LinkCounters, LinkState};
use crate::netns;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage, State};
use netlink_sys::{AsyncSocket, SocketAddr};
use std::future::Future;
use std::path::PathBuf;
use tokio::task::JoinHandle;

/// A change reported by the kernel for one link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkUpdate {
    /// Link created or changed.
    Upsert(LinkState),
    Removed(LinkState),
}

/// An open view into one namespace's links. Dropping it releases the namespace.
pub trait NamespaceLinks: Send + 'static {
    /// Full inventory, including loopback.
    fn list(&mut self) -> impl Future<Output = Result<Vec<LinkState>, WatchError>> + Send;

    /// Next link notification; `None` once the subscription is closed.
    /// Must be cancel-safe.
    fn next_update(&mut self) -> impl Future<Output = Option<LinkUpdate>> + Send;
}

pub trait LinkMonitor: Send + Sync + 'static {
    type Links: NamespaceLinks;

    /// Opens the namespace at `netns` and subscribes to its link notifications.
    fn open(&self, netns: PathBuf) -> impl Future<Output = Result<Self::Links, WatchError>> + Send;
}

/// rtnetlink-backed monitor. The socket is created inside the target namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetlinkMonitor;

pub struct NetlinkLinks {
    handle: rtnetlink::Handle,
    messages: BoxStream<'static, (NetlinkMessage<RouteNetlinkMessage>, SocketAddr)>,
    connection: JoinHandle<()>,
}

impl LinkMonitor for NetlinkMonitor {
    type Links = NetlinkLinks;

    async fn open(&self, netns: PathBuf) -> Result<NetlinkLinks, WatchError> {
        let (connection, handle, messages) =
            netns::run_in_netns_with_runtime(Some(netns), || {
                let (mut connection, handle, messages) = rtnetlink::new_connection()?;
                let groups = rtnetlink::constants::RTMGRP_LINK;
                connection
                    .socket_mut()
                    .socket_mut()
                    .bind(&SocketAddr::new(0, groups))?;
                Ok((connection, handle, messages))
            })
            .await?;
        let connection = tokio::spawn(connection);
        Ok(NetlinkLinks {
            handle,
            messages: messages.boxed(),
            connection,
        })
    }
}

impl NamespaceLinks for NetlinkLinks {
    async fn list(&mut self) -> Result<Vec<LinkState>, WatchError> {
        dump_links(&self.handle).await
    }

    async fn next_update(&mut self) -> Option<LinkUpdate> {
        while let Some((msg, _)) = self.messages.next().await {
            if let Some(update) = link_update(msg) {
                return Some(update);
            }
        }
        None
    }
}

impl Drop for NetlinkLinks {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

/// One-shot link dump of the namespace at `netns` (`None` = the host).
pub async fn list_links(netns: Option<PathBuf>) -> Result<Vec<LinkState>, WatchError> {
    let (connection, handle, _) =
        netns::run_in_netns_with_runtime(netns, rtnetlink::new_connection).await?;
    let connection = tokio::spawn(connection);
    let links = dump_links(&handle).await;
    connection.abort();
    links
}

async fn dump_links(handle: &rtnetlink::Handle) -> Result<Vec<LinkState>, WatchError> {
    let mut links = std::pin::pin!(handle.link().get().execute());
    let mut out = Vec::new();
    while let Some(msg) = links.try_next().await? {
        out.push(link_state(&msg));
    }
    Ok(out)
}

fn link_update(msg: NetlinkMessage<RouteNetlinkMessage>) -> Option<LinkUpdate> {
    match msg.payload {
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
            Some(LinkUpdate::Upsert(link_state(&link)))
        }
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
            Some(LinkUpdate::Removed(link_state(&link)))
        }
        _ => None,
    }
}

/// Converts a kernel link message into a snapshot plus counters.
pub fn link_state(msg: &LinkMessage) -> LinkState {
    let mut snapshot = InterfaceSnapshot {
        index: msg.header.index,
        oper_state: "unknown".to_string(),
        kind: "device".to_string(),
        ..Default::default()
    };
    let mut counters = None;
    let mut controller = None;

    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => snapshot.name = name.clone(),
            LinkAttribute::IfAlias(alias) => snapshot.alias = alias.clone(),
            LinkAttribute::Mtu(mtu) => snapshot.mtu = *mtu,
            LinkAttribute::Address(addr) => snapshot.mac = format_mac(addr),
            LinkAttribute::OperState(state) => snapshot.oper_state = oper_state(state).to_string(),
            LinkAttribute::Controller(idx) => controller = Some(*idx),
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    if let LinkInfo::Kind(kind) = info {
                        snapshot.kind = link_kind(kind);
                    }
                }
            }
            LinkAttribute::Stats64(stats) => {
                counters = Some(LinkCounters {
                    rx_bytes: stats.rx_bytes,
                    tx_bytes: stats.tx_bytes,
                    rx_packets: stats.rx_packets,
                    tx_packets: stats.tx_packets,
                });
            }
            LinkAttribute::Stats(stats) if counters.is_none() => {
                counters = Some(LinkCounters {
                    rx_bytes: u64::from(stats.rx_bytes),
                    tx_bytes: u64::from(stats.tx_bytes),
                    rx_packets: u64::from(stats.rx_packets),
                    tx_packets: u64::from(stats.tx_packets),
                });
            }
            _ => {}
        }
    }

    LinkState {
        snapshot,
        counters,
        controller,
    }
}

fn oper_state(state: &State) -> &'static str {
    match state {
        State::Up => "up",
        State::Down => "down",
        State::Dormant => "dormant",
        State::NotPresent => "not-present",
        State::LowerLayerDown => "lower-layer-down",
        State::Testing => "testing",
        _ => "unknown",
    }
}

fn link_kind(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Bridge => "bridge".to_string(),
        InfoKind::Veth => "veth".to_string(),
        InfoKind::Vxlan => "vxlan".to_string(),
        InfoKind::Vlan => "vlan".to_string(),
        InfoKind::Bond => "bond".to_string(),
        InfoKind::Dummy => "dummy".to_string(),
        InfoKind::Tun => "tuntap".to_string(),
        InfoKind::MacVlan => "macvlan".to_string(),
        InfoKind::IpVlan => "ipvlan".to_string(),
        InfoKind::Wireguard => "wireguard".to_string(),
        InfoKind::Other(name) => name.to_lowercase(),
        other => format!("{other:?}").to_lowercase(),
    }
}

fn format_mac(addr: &[u8]) -> String {
    addr.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(index: u32, attrs: Vec<LinkAttribute>) -> LinkMessage {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        msg.attributes = attrs;
        msg
    }

    #[test]
    fn link_state_reads_attributes() {
        let msg = message(
            7,
            vec![
                LinkAttribute::IfName("eth1".into()),
                LinkAttribute::Mtu(9500),
                LinkAttribute::Address(vec![0xaa, 0xc1, 0xab, 0x00, 0x01, 0x02]),
                LinkAttribute::OperState(State::Up),
                LinkAttribute::Controller(3),
                LinkAttribute::LinkInfo(vec![LinkInfo::Kind(InfoKind::Veth)]),
            ],
        );
        let state = link_state(&msg);
        assert_eq!(state.snapshot.index, 7);
        assert_eq!(state.snapshot.name, "eth1");
        assert_eq!(state.snapshot.mtu, 9500);
        assert_eq!(state.snapshot.mac, "aa:c1:ab:00:01:02");
        assert_eq!(state.snapshot.oper_state, "up");
        assert_eq!(state.snapshot.kind, "veth");
        assert_eq!(state.controller, Some(3));
        assert!(state.counters.is_none());
    }

    #[test]
    fn link_state_defaults_for_plain_device() {
        let state = link_state(&message(1, vec![LinkAttribute::IfName("lo".into())]));
        assert_eq!(state.snapshot.kind, "device");
        assert_eq!(state.snapshot.oper_state, "unknown");
        assert!(state.snapshot.mac.is_empty());
    }
}
