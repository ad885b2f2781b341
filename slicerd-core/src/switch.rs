use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;
use slicerd_openflow::{
    Action, ActionList, CookieFilter, ETH_TYPE_LLDP, FlowAdd, FlowDelete, GroupId, Instruction,
    InstructionList, MacAddr, Match, Message, MessageSink, PacketOut, PortNo, TableId, VLAN_NONE,
    VlanId, group, meter, port,
};
use smallvec::smallvec;

use crate::{
    config::{CircuitRequest, ConfigError, validate_endpoint_set},
    endpoint::Endpoint,
    pipeline::{PRIO_LLDP_DROP, TABLE_FORWARD, TABLE_UNTAGGED},
    resources::Resources,
    slice::Slice,
};

/// Stable identity of a slice within one switch. Slices and the endpoint
/// index refer to each other through these rather than through ownership.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SliceId(u64);

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Everything the engine knows about one switch: the desired slice
/// configuration, the realised resources, and the set of slices whose
/// installed rules may be out of date.
///
/// All methods are synchronous and must be called from a single writer; the
/// controller serialises events per switch.
pub struct SwitchState {
    dpid: u64,
    attached: bool,
    slices: BTreeMap<SliceId, Slice>,
    index: FxHashMap<Endpoint, SliceId>,
    invalid: BTreeSet<SliceId>,
    next_slice: u64,
    res: Resources,
    default_idle_timeout: u16,
}

impl SwitchState {
    pub fn new(dpid: u64) -> Self {
        SwitchState {
            dpid,
            attached: false,
            slices: BTreeMap::new(),
            index: FxHashMap::default(),
            invalid: BTreeSet::new(),
            next_slice: 0,
            res: Resources::new(dpid),
            default_idle_timeout: crate::pipeline::DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: u16) -> Self {
        self.default_idle_timeout = timeout;
        self
    }

    pub fn dpid(&self) -> u64 {
        self.dpid
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn known_ports(&self) -> &BTreeSet<PortNo> {
        &self.res.known_ports
    }

    pub fn slice(&self, id: SliceId) -> Option<&Slice> {
        self.slices.get(&id)
    }

    pub fn slices(&self) -> impl Iterator<Item = (SliceId, &Slice)> {
        self.slices.iter().map(|(id, slice)| (*id, slice))
    }

    /// The slice currently targeting an endpoint.
    pub fn slice_of(&self, ep: &Endpoint) -> Option<SliceId> {
        self.index.get(ep).copied()
    }

    pub fn group_of(&self, ep: &Endpoint) -> Option<GroupId> {
        self.res.group_of(ep)
    }

    /// Total group ids currently allocated on this switch.
    pub fn groups_held(&self) -> usize {
        self.res.groups_held()
    }

    /// The current configuration: one endpoint set per live slice.
    pub fn config(&self) -> Vec<Vec<Endpoint>> {
        self.slices
            .values()
            .filter(|slice| !slice.target().is_empty())
            .map(|slice| slice.target().iter().copied().collect())
            .collect()
    }

    // ------------------------------------------------------------------
    // Datapath lifecycle

    /// A datapath joined: wipe its pipeline, install the static LLDP drop,
    /// register its ports, and rebuild every slice from the retained
    /// configuration.
    pub fn attach<I>(&mut self, ports: I, out: &mut dyn MessageSink)
    where
        I: IntoIterator<Item = PortNo>,
    {
        log::info!("{:016x}: new switch", self.dpid);
        self.reset_realized();
        self.attached = true;

        out.send(Message::MeterDelete { meter: meter::ALL });
        for table in [TABLE_UNTAGGED, crate::pipeline::TABLE_TAGGED, TABLE_FORWARD] {
            out.send(Message::FlowDelete(FlowDelete {
                table,
                ..Default::default()
            }));
        }
        out.send(Message::GroupDelete { group: group::ALL });

        // Untagged LLDP is dropped outright; everything else falls through
        // to the slice rules.
        let mut instructions = InstructionList::new();
        instructions.push(Instruction::Apply(ActionList::new()));
        out.send(Message::FlowAdd(FlowAdd {
            table: TABLE_UNTAGGED,
            priority: PRIO_LLDP_DROP,
            matcher: Match::default().with_vlan_vid(VLAN_NONE).with_eth_type(ETH_TYPE_LLDP),
            instructions,
            ..Default::default()
        }));

        for p in ports {
            self.port_added(p);
        }
        for (&sid, _) in self.slices.iter() {
            self.invalid.insert(sid);
        }
        self.revalidate(out);
    }

    /// The datapath left. Desired configuration is retained; everything
    /// realised on the switch is forgotten, so a reattach starts clean.
    pub fn detach(&mut self) {
        log::info!("{:016x}: switch detached", self.dpid);
        self.attached = false;
        self.reset_realized();
    }

    fn reset_realized(&mut self) {
        for slice in self.slices.values_mut() {
            slice.reset_realized();
        }
        self.res.reset_realized();
        self.invalid.clear();
    }

    pub fn port_added(&mut self, port: PortNo) {
        // Reserved OpenFlow port range; not a physical port.
        if port > port::MAX_PHYSICAL {
            return;
        }
        log::info!("{:016x}: gained port {}", self.dpid, port);
        self.res.known_ports.insert(port);
        for (ep, &sid) in self.index.iter() {
            if ep.port() == port {
                self.invalid.insert(sid);
            }
        }
    }

    pub fn port_removed(&mut self, port: PortNo) {
        log::info!("{:016x}: lost port {}", self.dpid, port);
        self.res.known_ports.remove(&port);
        for (ep, &sid) in self.index.iter() {
            if ep.port() == port {
                self.invalid.insert(sid);
            }
        }
    }

    // ------------------------------------------------------------------
    // Slice configuration

    /// Create or reshape a slice from a requested endpoint set.
    ///
    /// The request is validated as a whole; any conflict within it rejects
    /// it without touching state. The realised slice is the existing slice
    /// with the greatest target overlap, if any, reshaped to the request;
    /// endpoints it loses move to a fresh sibling slice. Endpoints owned by
    /// other slices, or conflicting with the request, are abandoned by their
    /// owners.
    pub fn create_slice(
        &mut self,
        circuits: &[CircuitRequest],
    ) -> Result<Option<SliceId>, ConfigError> {
        let requested: BTreeSet<Endpoint> = circuits.iter().map(|c| c.endpoint).collect();
        if requested.is_empty() {
            return Ok(None);
        }
        validate_endpoint_set(&requested)?;
        log::info!(
            "{:016x}: creating {}",
            self.dpid,
            crate::endpoint::endpoints_text(&requested)
        );

        // Maximum-overlap policy: reshape the slice sharing the most
        // endpoints with the request, first match winning ties.
        let mut best: Option<(SliceId, usize)> = None;
        for ep in &requested {
            let Some(&sid) = self.index.get(ep) else {
                continue;
            };
            let overlap = self.slices[&sid].target().intersection(&requested).count();
            if best.is_none_or(|(_, most)| overlap > most) {
                best = Some((sid, overlap));
            }
        }

        let sid = match best {
            Some((sid, _)) => {
                let current = self.slices[&sid].target().clone();
                for ep in requested.difference(&current) {
                    self.adopt(sid, *ep);
                }
                // Endpoints the slice no longer wants continue life in a
                // sibling slice rather than being dropped. Computed after
                // the adoptions: a conflict victim they evicted must not
                // come back through the sibling.
                let abandoned: Vec<Endpoint> = self.slices[&sid]
                    .target()
                    .difference(&requested)
                    .copied()
                    .collect();
                if !abandoned.is_empty() {
                    let sibling = self.new_slice();
                    for ep in abandoned {
                        self.adopt(sibling, ep);
                    }
                }
                sid
            }
            None => {
                let sid = self.new_slice();
                for ep in &requested {
                    self.adopt(sid, *ep);
                }
                sid
            }
        };

        // Rate limits may change even when the membership did not; a changed
        // rate invalidates the owner so revalidation reprograms the meters.
        for circuit in circuits {
            let changed = self.res.set_ingress_rate(&circuit.endpoint, circuit.ingress_bw)
                | self.res.set_egress_rate(&circuit.endpoint, circuit.egress_bw);
            if changed {
                if let Some(&owner) = self.index.get(&circuit.endpoint) {
                    self.invalid.insert(owner);
                }
            }
        }

        Ok(Some(sid))
    }

    /// The operator no longer wants this endpoint connected anywhere.
    pub fn discard_endpoint(&mut self, ep: &Endpoint) {
        if let Some(&sid) = self.index.get(ep) {
            self.abandon(sid, *ep);
        }
    }

    fn new_slice(&mut self) -> SliceId {
        let sid = SliceId(self.next_slice);
        self.next_slice += 1;
        self.slices.insert(sid, Slice::default());
        sid
    }

    /// Make `sid` own `ep`. Every endpoint anywhere on the switch that
    /// conflicts with `ep` (including an equal one under another owner) is
    /// abandoned first.
    fn adopt(&mut self, sid: SliceId, ep: Endpoint) {
        if self.slices[&sid].target().contains(&ep) {
            return;
        }
        let conflicting: Vec<(SliceId, Endpoint)> = self
            .index
            .iter()
            .filter(|(other, _)| ep.conflicts_with(other))
            .map(|(other, &owner)| (owner, *other))
            .collect();
        for (owner, victim) in conflicting {
            self.abandon(owner, victim);
        }
        self.slices
            .get_mut(&sid)
            .expect("adopting into unknown slice")
            .insert_target(ep);
        self.index.insert(ep, sid);
        self.invalid.insert(sid);
    }

    fn abandon(&mut self, sid: SliceId, ep: Endpoint) {
        let slice = self.slices.get_mut(&sid).expect("abandoning from unknown slice");
        if !slice.remove_target(&ep) {
            return;
        }
        let owner = self.index.remove(&ep);
        assert_eq!(owner, Some(sid), "endpoint index out of sync with slice targets");
        self.invalid.insert(sid);
    }

    // ------------------------------------------------------------------
    // Revalidation

    /// Bring the switch's installed rules into agreement with the desired
    /// configuration. Idempotent: with no intervening mutation a second
    /// call emits nothing.
    pub fn revalidate(&mut self, out: &mut dyn MessageSink) {
        if !self.attached {
            // Nothing can be realised; just keep the slice map tidy.
            self.gc_empty_slices();
            return;
        }
        log::info!("{:016x}: revalidating...", self.dpid);

        // Endpoints removed from their slice lose all their rules, learned
        // ones included, and give their group back.
        let mut lost: BTreeSet<Endpoint> = BTreeSet::new();
        for sid in &self.invalid {
            lost.extend(self.slices[sid].lost_endpoints().copied());
        }
        for ep in &lost {
            self.delete_dynamic_rules(ep, out);
        }

        let invalid: Vec<SliceId> = self.invalid.iter().copied().collect();
        for &sid in &invalid {
            self.slices.get_mut(&sid).expect("invalid slice id").sanitize(&self.res.known_ports);
        }

        // Strictly deletes before adds: additions may reuse group ids freed
        // by the delete pass.
        for &sid in &invalid {
            self.slices[&sid].delete_static_rules(&mut self.res, out);
        }
        if !invalid.is_empty() {
            out.send(Message::Barrier);
        }
        for &sid in &invalid {
            self.slices[&sid].add_static_rules(&mut self.res, out);
        }

        for &sid in &invalid {
            self.slices.get_mut(&sid).expect("invalid slice id").commit();
        }
        self.invalid.clear();

        // First-tag rules whose last referencing endpoint went away.
        let in_use: BTreeSet<(PortNo, VlanId)> = self
            .slices
            .values()
            .flat_map(|slice| slice.target().iter().filter_map(Endpoint::first_tag))
            .collect();
        self.res.sweep_first_tag_rules(&in_use, out);

        self.gc_empty_slices();

        // Meters for endpoints no longer in any slice.
        let owned: BTreeSet<Endpoint> = self.index.keys().copied().collect();
        self.res.sweep_meters(&owned, out);

        log::info!("{:016x}: revalidating complete", self.dpid);
    }

    fn gc_empty_slices(&mut self) {
        let empty: Vec<SliceId> = self
            .slices
            .iter()
            .filter(|(_, slice)| slice.target().is_empty())
            .map(|(&sid, _)| sid)
            .collect();
        for sid in empty {
            self.slices.remove(&sid);
            self.invalid.remove(&sid);
        }
    }

    /// Tear down everything installed for one endpoint: its ingress rules,
    /// its group (which takes the flood rule with it), and the learned
    /// unicast rules to and from it.
    fn delete_dynamic_rules(&mut self, ep: &Endpoint, out: &mut dyn MessageSink) {
        self.res.invalidate_first_tag_rule(ep);
        let (matcher, table, _) = ep.ingress_match(None);
        out.send(Message::FlowDelete(FlowDelete {
            table,
            matcher,
            ..Default::default()
        }));

        if let Some(released) = self.res.release_group(ep) {
            out.send(Message::GroupDelete { group: released });
            // Rules delivering to this endpoint carry its group as cookie;
            // rules from it match its group in the metadata.
            out.send(Message::FlowDelete(FlowDelete {
                table: TABLE_FORWARD,
                cookie: Some(CookieFilter::exact(released as u64)),
                ..Default::default()
            }));
            out.send(Message::FlowDelete(FlowDelete {
                table: TABLE_FORWARD,
                matcher: Match::metadata(released as u64),
                ..Default::default()
            }));
        }
    }

    // ------------------------------------------------------------------
    // MAC learning

    /// Install the binding `mac -> ep` and the rules that keep its traffic
    /// off the controller: per-member unicast rules in the forwarding table
    /// and a source-qualified ingress rule with an idle timeout.
    ///
    /// Returns the owning slice, or `None` when the endpoint is not part of
    /// a learning (multi-endpoint) slice.
    pub fn learn(
        &mut self,
        ep: Endpoint,
        mac: MacAddr,
        timeout: u16,
        out: &mut dyn MessageSink,
    ) -> Option<SliceId> {
        if !self.attached {
            return None;
        }
        log::info!("{:016x}: {} new on {}", self.dpid, mac, ep);
        self.revalidate(out);

        let sid = *self.index.get(&ep)?;
        let group = self.res.group_of(&ep)?;
        let slice = self.slices.get_mut(&sid).expect("indexed slice missing");
        slice.see(mac, ep);

        // Deterministic member order; every member holds a group once the
        // slice is revalidated.
        let members: Vec<(Endpoint, GroupId)> = slice
            .established()
            .iter()
            .filter_map(|member| self.res.group_of(member).map(|g| (*member, g)))
            .collect();

        // Unicast rules: traffic for this MAC entering on any member is
        // delivered straight to `ep`, or dropped if it would hairpin onto
        // the endpoint it came from. Cookie-labelled with `ep`'s group so
        // they can be swept when the MAC ages out or moves.
        let egress_meter = self.res.egress_meter(&ep);
        for (member, member_group) in &members {
            let actions = if member == &ep {
                ActionList::new()
            } else {
                ep.egress_action(member.port())
            };
            let mut instructions = InstructionList::new();
            if let Some(m) = egress_meter {
                instructions.push(Instruction::Meter(m));
            }
            instructions.push(Instruction::Apply(actions));
            out.send(Message::FlowAdd(FlowAdd {
                table: TABLE_FORWARD,
                priority: crate::pipeline::PRIO_UNICAST,
                cookie: group as u64,
                matcher: Match::metadata(*member_group as u64).with_eth_dst(mac),
                instructions,
                ..Default::default()
            }));
        }

        // If the MAC moved within the slice, stale source rules on the old
        // endpoint must go so the controller sees it again. The cookie
        // filter spares equal-MAC rules belonging to other slices.
        for (member, member_group) in &members {
            if member == &ep {
                continue;
            }
            let (_, table, _) = member.ingress_match(Some(mac));
            out.send(Message::FlowDelete(FlowDelete {
                table,
                matcher: Match::default().with_eth_src(mac),
                cookie: Some(CookieFilter::exact(*member_group as u64)),
                ..Default::default()
            }));
        }

        // The source-qualified ingress rule: stamp the group into metadata,
        // shed the inner tag if present, and skip straight to forwarding.
        let (matcher, table, priority) = ep.ingress_match(Some(mac));
        let mut actions: ActionList = smallvec![Action::SetMetadata(group as u64)];
        if ep.inner_vlan().is_some() {
            actions.push(Action::PopVlan);
        }
        let mut instructions = InstructionList::new();
        if let Some(m) = self.res.ingress_meter(&ep) {
            instructions.push(Instruction::Meter(m));
        }
        instructions.push(Instruction::Apply(actions));
        instructions.push(Instruction::GotoTable(TABLE_FORWARD));
        out.send(Message::FlowAdd(FlowAdd {
            table,
            priority,
            cookie: group as u64,
            idle_timeout: timeout,
            send_flow_removed: true,
            matcher,
            instructions,
            ..Default::default()
        }));

        Some(sid)
    }

    /// The idle timeout applied to learned ingress rules when the caller
    /// does not supply one.
    pub fn default_idle_timeout(&self) -> u16 {
        self.default_idle_timeout
    }

    /// Handle a packet sent to the controller by an ingress rule: learn the
    /// source, then forward to the learned destination or flood to the
    /// slice's group.
    pub fn packet_in(
        &mut self,
        table: TableId,
        matcher: &Match,
        buffer_id: u32,
        data: &[u8],
        out: &mut dyn MessageSink,
    ) {
        let Some((dst, src)) = MacAddr::from_frame(data) else {
            return;
        };
        let Some(ep) = endpoint_from_match(table, matcher) else {
            return;
        };
        // The ingress rule that sent us this packet already popped the
        // outer tag; the inner one is still on the wire.
        let pop_vlan = ep.inner_vlan().is_some();

        let Some(sid) = self.learn(ep, src, self.default_idle_timeout, out) else {
            // Endpoint not in any slice: drop, no output.
            return;
        };

        let mut actions: ActionList = match self.slices[&sid].lookup(&dst) {
            None => {
                // Unknown destination: flood via the source's group. The
                // group buckets exclude the source by IN_PORT suppression.
                let Some(group) = self.res.group_of(&ep) else {
                    return;
                };
                smallvec![Action::Group(group)]
            }
            // Never loop a packet straight back.
            Some(dest) if dest == ep => return,
            Some(dest) => dest.egress_action(ep.port()),
        };
        if pop_vlan {
            actions.insert(0, Action::PopVlan);
        }
        out.send(Message::PacketOut(PacketOut {
            buffer_id,
            in_port: ep.port(),
            actions,
            data: data.to_vec(),
        }));
    }

    /// Handle an idle-timeout flow removal for a learned ingress rule:
    /// unlearn the MAC and sweep its unicast rules out of the forwarding
    /// table. Unknown endpoints or slices are races with a reshape and are
    /// ignored.
    pub fn flow_removed(&mut self, table: TableId, matcher: &Match, out: &mut dyn MessageSink) {
        let Some(mac) = matcher.eth_src else {
            return;
        };
        let Some(ep) = endpoint_from_match(table, matcher) else {
            return;
        };
        let Some(&sid) = self.index.get(&ep) else {
            return;
        };
        let Some(group) = self.res.group_of(&ep) else {
            return;
        };
        log::info!("{:016x}: {}/g{} {} not heard from", self.dpid, ep, group, mac);

        self.slices.get_mut(&sid).expect("indexed slice missing").unsee(mac, &ep);
        out.send(Message::FlowDelete(FlowDelete {
            table: TABLE_FORWARD,
            matcher: Match::default().with_eth_dst(mac),
            cookie: Some(CookieFilter::exact(group as u64)),
            ..Default::default()
        }));
    }
}

/// Rebuild the ingress endpoint from the match fields the switch reported:
/// table 0 means a bare port; in table 1 the metadata register holds the
/// popped outer tag and a present `vlan_vid` is the inner tag.
fn endpoint_from_match(table: TableId, matcher: &Match) -> Option<Endpoint> {
    let in_port = matcher.in_port?;
    if table == TABLE_UNTAGGED {
        return Some(Endpoint::Port(in_port));
    }
    let outer = matcher.metadata? as VlanId;
    Some(match matcher.vlan_vid {
        Some(vid) => Endpoint::DoubleTagged(in_port, outer, vid & 0x0fff),
        None => Endpoint::Tagged(in_port, outer),
    })
}
