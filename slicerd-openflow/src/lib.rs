//! Typed OpenFlow 1.3 message intents.
//!
//! The reconciliation engine never builds wire-format OpenFlow messages.
//! Instead it emits values of [`Message`] into a [`MessageSink`]; a transport
//! adapter serialises them onto an actual switch session. This keeps the
//! engine testable against a plain `Vec<Message>`.
//!
//! Only the fields the slicer actually uses are modelled: three flow tables,
//! `ALL`-type groups, drop-band meters, and the handful of match fields and
//! actions needed to push/pop VLAN stacks and steer packets between tables.

mod mac;
mod message;

pub use self::{
    mac::{MacAddr, ParseMacError},
    message::{
        Action, ActionList, Bucket, CookieFilter, FlowAdd, FlowDelete, Instruction,
        InstructionList, Match, Message, MeterBand, MeterMod, MeterUnit, PacketOut,
    },
};

pub type PortNo = u32;
pub type TableId = u8;
pub type GroupId = u32;
pub type MeterId = u32;
pub type VlanId = u16;

/// Reserved port numbers (`OFPP_*`).
pub mod port {
    use super::PortNo;

    /// Send the packet back out its ingress port. Required in group buckets
    /// and output actions whose target equals the ingress port; the switch
    /// silently drops those otherwise.
    pub const IN_PORT: PortNo = 0xffff_fff8;
    /// Send to the controller as a packet-in.
    pub const CONTROLLER: PortNo = 0xffff_fffd;
    /// Wildcard for flow-delete filters.
    pub const ANY: PortNo = 0xffff_ffff;
    /// Largest port number treated as a physical port; anything above is in
    /// the reserved OpenFlow range and is ignored by the engine.
    pub const MAX_PHYSICAL: PortNo = 0x7fff_ffff;
}

/// Reserved group identifiers (`OFPG_*`).
pub mod group {
    use super::GroupId;

    /// Wildcard for flow-delete filters.
    pub const ANY: GroupId = 0xffff_ffff;
    /// All groups; a delete of this wipes the group table.
    pub const ALL: GroupId = 0xffff_fffc;
}

/// Reserved meter identifiers (`OFPM_*`).
pub mod meter {
    use super::MeterId;

    /// All meters; a delete of this wipes the meter table.
    pub const ALL: MeterId = 0xffff_ffff;
}

/// The `OFPVID_PRESENT` bit, set in every `vlan_vid` match or set-field value
/// that refers to a tagged packet.
pub const VLAN_PRESENT: u16 = 0x1000;

/// `vlan_vid` match value for untagged packets.
pub const VLAN_NONE: u16 = 0x0000;

/// Customer VLAN tag ethertype (802.1Q).
pub const ETH_TYPE_CTAG: u16 = 0x8100;
/// Service VLAN tag ethertype (802.1ad).
pub const ETH_TYPE_STAG: u16 = 0x88a8;
/// LLDP ethertype.
pub const ETH_TYPE_LLDP: u16 = 0x88cc;

/// `OFP_NO_BUFFER`: the packet-in carries the full frame and the packet-out
/// must supply the payload.
pub const NO_BUFFER: u32 = 0xffff_ffff;

/// `max_len` for controller output actions: send the whole packet.
pub const CONTROLLER_MAX_LEN: u16 = 0xffff;

/// Cookie carried by flood rules so that bulk-deletes of learned rules,
/// which filter on an endpoint's group id, can never touch them.
pub const FLOOD_COOKIE: u64 = u64::MAX;

/// Consumer of the engine's outbound message stream.
///
/// The engine itself is infallible: failures to deliver are a transport
/// concern and surface as a datapath-leave event, after which the engine
/// rebuilds the pipeline from scratch on reattach.
pub trait MessageSink {
    fn send(&mut self, msg: Message);
}

impl MessageSink for Vec<Message> {
    fn send(&mut self, msg: Message) {
        self.push(msg);
    }
}
