use slicerd_core::{ConfigError, ConfigUpdate, Endpoint};
use slicerd_openflow::{Match, PortNo, TableId};
use tokio::sync::oneshot;

use crate::DatapathLink;

/// A packet delivered to the controller by a to-controller ingress rule.
///
/// The match fields of the rule that punted the packet identify the ingress
/// endpoint; the payload is only inspected for its Ethernet addresses.
#[derive(Debug)]
pub struct PacketIn {
    pub table: TableId,
    pub matcher: Match,
    pub buffer_id: u32,
    pub data: Vec<u8>,
}

/// Notification that a flow entry went away.
#[derive(Debug)]
pub struct FlowRemoved {
    pub table: TableId,
    pub matcher: Match,
    pub reason: RemovalReason,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RemovalReason {
    IdleTimeout,
    HardTimeout,
    Delete,
    GroupDelete,
}

/// Everything that can happen to one switch, from either side of the
/// controller. Consumed by the switch's single worker task.
pub enum Event {
    /// The session layer completed a handshake; `ports` are the physical
    /// ports from the features/port-description exchange.
    DatapathEnter {
        ports: Vec<PortNo>,
        link: Box<dyn DatapathLink>,
    },
    DatapathLeave,
    PortAdded(PortNo),
    PortRemoved(PortNo),
    PacketIn(PacketIn),
    FlowRemoved(FlowRemoved),
    /// A REST mutation; answered with the resulting configuration once the
    /// revalidation it triggered has been enqueued toward the switch.
    RestMutation {
        update: ConfigUpdate,
        reply: oneshot::Sender<Result<Vec<Vec<Endpoint>>, ConfigError>>,
    },
    /// A REST configuration read, serialized with the mutations.
    RestQuery {
        reply: oneshot::Sender<Vec<Vec<Endpoint>>>,
    },
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DatapathEnter { ports, .. } => {
                f.debug_struct("DatapathEnter").field("ports", ports).finish_non_exhaustive()
            }
            Self::DatapathLeave => f.write_str("DatapathLeave"),
            Self::PortAdded(p) => write!(f, "PortAdded({p})"),
            Self::PortRemoved(p) => write!(f, "PortRemoved({p})"),
            Self::PacketIn(pkt) => pkt.fmt(f),
            Self::FlowRemoved(fr) => fr.fmt(f),
            Self::RestMutation { update, .. } => {
                f.debug_struct("RestMutation").field("update", update).finish_non_exhaustive()
            }
            Self::RestQuery { .. } => f.write_str("RestQuery"),
        }
    }
}
