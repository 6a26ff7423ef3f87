// Domain models shared by every producer in the pipeline

mod container;
mod event;
mod interface;

pub use container::{Container, ContainerState, PortBinding, RuntimeEvent, exposed_ports_value};
pub use event::{AggregatedEvent, EventKind, short_id};
pub use interface::{InterfaceSnapshot, LinkCounters, LinkState};
