use core::fmt;

use smallvec::SmallVec;

use crate::{GroupId, MacAddr, MeterId, PortNo, TableId, group, port};

/// The match fields the slicer pipeline uses. `None` means wildcard.
///
/// `vlan_vid` values carry the `OFPVID_PRESENT` bit for tagged matches, or
/// [`crate::VLAN_NONE`] to match untagged packets only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Match {
    pub in_port: Option<PortNo>,
    pub eth_src: Option<MacAddr>,
    pub eth_dst: Option<MacAddr>,
    pub eth_type: Option<u16>,
    pub vlan_vid: Option<u16>,
    pub metadata: Option<u64>,
}

impl Match {
    pub fn in_port(port: PortNo) -> Self {
        Match {
            in_port: Some(port),
            ..Default::default()
        }
    }

    pub fn metadata(metadata: u64) -> Self {
        Match {
            metadata: Some(metadata),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: u64) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_vlan_vid(mut self, vlan_vid: u16) -> Self {
        self.vlan_vid = Some(vlan_vid);
        self
    }

    pub fn with_eth_src(mut self, mac: MacAddr) -> Self {
        self.eth_src = Some(mac);
        self
    }

    pub fn with_eth_dst(mut self, mac: MacAddr) -> Self {
        self.eth_dst = Some(mac);
        self
    }

    pub fn with_eth_type(mut self, eth_type: u16) -> Self {
        self.eth_type = Some(eth_type);
        self
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        let mut field = |f: &mut fmt::Formatter<'_>, name: &str, value: String| {
            let r = write!(f, "{sep}{name}={value}");
            sep = ",";
            r
        };
        if let Some(p) = self.in_port {
            field(f, "in_port", p.to_string())?;
        }
        if let Some(m) = self.metadata {
            field(f, "metadata", m.to_string())?;
        }
        if let Some(v) = self.vlan_vid {
            field(f, "vlan_vid", format!("{v:#06x}"))?;
        }
        if let Some(t) = self.eth_type {
            field(f, "eth_type", format!("{t:#06x}"))?;
        }
        if let Some(mac) = self.eth_src {
            field(f, "eth_src", mac.to_string())?;
        }
        if let Some(mac) = self.eth_dst {
            field(f, "eth_dst", mac.to_string())?;
        }
        if sep.is_empty() {
            f.write_str("any")?;
        }
        Ok(())
    }
}

/// A single apply-action. Tag pushes take the ethertype of the tag to push;
/// the VLAN id is set by a following [`Action::SetVlanVid`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Output to a port, including reserved values such as [`port::IN_PORT`].
    Output(PortNo),
    /// Output to the controller with [`crate::CONTROLLER_MAX_LEN`].
    OutputController,
    PushVlan(u16),
    PopVlan,
    /// Set `vlan_vid`; the value carries the present bit.
    SetVlanVid(u16),
    SetMetadata(u64),
    Group(GroupId),
}

pub type ActionList = SmallVec<[Action; 5]>;

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Output(p) if *p == port::IN_PORT => f.write_str("output(IN_PORT)"),
            Self::Output(p) => write!(f, "output({p})"),
            Self::OutputController => f.write_str("output(CONTROLLER)"),
            Self::PushVlan(ty) => write!(f, "push_vlan({ty:#06x})"),
            Self::PopVlan => f.write_str("pop_vlan"),
            Self::SetVlanVid(v) => write!(f, "set_vlan_vid({v:#06x})"),
            Self::SetMetadata(m) => write!(f, "set_metadata({m})"),
            Self::Group(g) => write!(f, "group({g})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Meter(MeterId),
    Apply(ActionList),
    GotoTable(TableId),
}

pub type InstructionList = SmallVec<[Instruction; 3]>;

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meter(id) => write!(f, "meter:{id}"),
            Self::Apply(actions) => {
                f.write_str("apply[")?;
                for (i, action) in actions.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{action}")?;
                }
                f.write_str("]")
            }
            Self::GotoTable(t) => write!(f, "goto:{t}"),
        }
    }
}

/// Exact-cookie filter for flow deletion (`cookie_mask` all ones).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CookieFilter {
    pub cookie: u64,
    pub mask: u64,
}

impl CookieFilter {
    pub fn exact(cookie: u64) -> Self {
        CookieFilter {
            cookie,
            mask: u64::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowAdd {
    pub table: TableId,
    pub priority: u16,
    pub cookie: u64,
    /// Zero means no timeout.
    pub idle_timeout: u16,
    /// Request a flow-removed message when the entry expires.
    pub send_flow_removed: bool,
    pub matcher: Match,
    pub instructions: InstructionList,
}

impl Default for FlowAdd {
    fn default() -> Self {
        FlowAdd {
            table: 0,
            priority: 0,
            cookie: 0,
            idle_timeout: 0,
            send_flow_removed: false,
            matcher: Match::default(),
            instructions: InstructionList::new(),
        }
    }
}

/// Non-strict flow deletion: removes every flow in `table` whose match is at
/// least as specific as `matcher`, further filtered by cookie and by output
/// port/group references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowDelete {
    pub table: TableId,
    pub matcher: Match,
    pub cookie: Option<CookieFilter>,
    pub out_port: PortNo,
    pub out_group: GroupId,
}

impl Default for FlowDelete {
    fn default() -> Self {
        FlowDelete {
            table: 0,
            matcher: Match::default(),
            cookie: None,
            out_port: port::ANY,
            out_group: group::ANY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub actions: ActionList,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MeterUnit {
    Kbps,
    Pktps,
}

/// A single drop band; packets beyond `rate` are discarded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MeterBand {
    pub rate: u32,
    pub burst: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterMod {
    pub meter: MeterId,
    pub unit: MeterUnit,
    pub band: MeterBand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOut {
    /// Switch-side buffer holding the frame, or [`crate::NO_BUFFER`].
    pub buffer_id: u32,
    pub in_port: PortNo,
    pub actions: ActionList,
    /// The frame payload; consulted only when `buffer_id` is
    /// [`crate::NO_BUFFER`].
    pub data: Vec<u8>,
}

/// One outbound OpenFlow message, in the order it must reach the switch.
///
/// All groups the slicer installs are of type `ALL` (every bucket executes),
/// so [`Message::GroupAdd`]/[`Message::GroupModify`] carry no type field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    FlowAdd(FlowAdd),
    FlowDelete(FlowDelete),
    GroupAdd { group: GroupId, buckets: Vec<Bucket> },
    GroupModify { group: GroupId, buckets: Vec<Bucket> },
    /// Deleting a group also removes every flow that references the group in
    /// its actions. [`group::ALL`] wipes the table.
    GroupDelete { group: GroupId },
    MeterAdd(MeterMod),
    MeterModify(MeterMod),
    /// [`meter::ALL`](crate::meter::ALL) wipes the meter table.
    MeterDelete { meter: MeterId },
    PacketOut(PacketOut),
    /// Fence between the delete and add passes of a revalidation, for
    /// switches with weak in-order guarantees.
    Barrier,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlowAdd(m) => {
                write!(
                    f,
                    "flow-add t{} p{} cookie={:#x} ({})",
                    m.table, m.priority, m.cookie, m.matcher
                )?;
                for inst in m.instructions.iter() {
                    write!(f, " {inst}")?;
                }
                if m.idle_timeout != 0 {
                    write!(f, " idle={}s", m.idle_timeout)?;
                }
                Ok(())
            }
            Self::FlowDelete(m) => {
                write!(f, "flow-del t{} ({})", m.table, m.matcher)?;
                if let Some(ck) = m.cookie {
                    write!(f, " cookie={:#x}/{:#x}", ck.cookie, ck.mask)?;
                }
                if m.out_port != port::ANY {
                    write!(f, " out_port={}", m.out_port)?;
                }
                Ok(())
            }
            Self::GroupAdd { group, buckets } => {
                write!(f, "group-add {} ({} buckets)", group, buckets.len())
            }
            Self::GroupModify { group, buckets } => {
                write!(f, "group-mod {} ({} buckets)", group, buckets.len())
            }
            Self::GroupDelete { group: g } if *g == group::ALL => f.write_str("group-del ALL"),
            Self::GroupDelete { group } => write!(f, "group-del {group}"),
            Self::MeterAdd(m) => write!(f, "meter-add {} rate={}", m.meter, m.band.rate),
            Self::MeterModify(m) => write!(f, "meter-mod {} rate={}", m.meter, m.band.rate),
            Self::MeterDelete { meter: m } if *m == crate::meter::ALL => {
                f.write_str("meter-del ALL")
            }
            Self::MeterDelete { meter } => write!(f, "meter-del {meter}"),
            Self::PacketOut(m) => {
                write!(f, "packet-out in_port={} actions[", m.in_port)?;
                for (i, action) in m.actions.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{action}")?;
                }
                f.write_str("]")
            }
            Self::Barrier => f.write_str("barrier"),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use smallvec::smallvec;

    use super::*;

    #[test]
    fn match_display_orders_fields() {
        let m = Match::in_port(3)
            .with_metadata(100)
            .with_vlan_vid(0x1064)
            .with_eth_src("aa:bb:cc:dd:ee:ff".parse().unwrap());
        assert_eq!(
            m.to_string(),
            "in_port=3,metadata=100,vlan_vid=0x1064,eth_src=aa:bb:cc:dd:ee:ff"
        );
        assert_eq!(Match::default().to_string(), "any");
    }

    #[test]
    fn message_display_summarises() {
        let msg = Message::FlowAdd(FlowAdd {
            table: 2,
            priority: 1,
            cookie: crate::FLOOD_COOKIE,
            matcher: Match::metadata(7),
            instructions: smallvec![Instruction::Apply(smallvec![Action::Group(7)])],
            ..Default::default()
        });
        assert_eq!(
            msg.to_string(),
            "flow-add t2 p1 cookie=0xffffffffffffffff (metadata=7) apply[group(7)]"
        );
    }
}
