use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;
use slicerd_openflow::{
    Action, FlowAdd, FlowDelete, GroupId, Instruction, InstructionList, Match, Message, MessageSink,
    MeterBand, MeterId, MeterMod, MeterUnit, PortNo, VLAN_PRESENT, VlanId,
};
use smallvec::smallvec;

use crate::{
    alloc::IdAllocator,
    endpoint::Endpoint,
    pipeline::{PRIO_ENDPOINT, TABLE_TAGGED, TABLE_UNTAGGED},
};

/// What a meter is currently programmed to, per direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Band {
    Limited(u32),
    /// A placeholder band so the meter id survives a rate being cleared.
    Unlimited,
}

impl Band {
    fn to_mod(self, meter: MeterId) -> MeterMod {
        match self {
            Band::Limited(rate) => MeterMod {
                meter,
                unit: MeterUnit::Kbps,
                band: MeterBand {
                    rate,
                    burst: rate / 10,
                },
            },
            Band::Unlimited => MeterMod {
                meter,
                unit: MeterUnit::Pktps,
                band: MeterBand {
                    rate: 0x7fff_ffff,
                    burst: 0x7fff_ffff,
                },
            },
        }
    }
}

#[derive(Debug, Default, Clone)]
struct MeterState {
    pair: u32,
    ingress: Option<Band>,
    egress: Option<Band>,
}

/// Switch-scoped realised resources: the ports known to exist, group and
/// meter allocations, and the table-0 first-tag rule bookkeeping. All of it
/// is discarded on datapath leave; only the desired rate maps survive.
#[derive(Debug)]
pub(crate) struct Resources {
    pub dpid: u64,
    pub known_ports: BTreeSet<PortNo>,
    groups: IdAllocator,
    group_of: FxHashMap<Endpoint, GroupId>,
    endpoint_of: FxHashMap<GroupId, Endpoint>,
    meter_pairs: IdAllocator,
    meters: BTreeMap<Endpoint, MeterState>,
    ingress_rates: BTreeMap<Endpoint, u32>,
    egress_rates: BTreeMap<Endpoint, u32>,
    /// `(port, outer-vlan)` first-tag rules present in table 0.
    installed_first_tag: BTreeSet<(PortNo, VlanId)>,
    /// First-tag rules that may have lost their last referencing endpoint;
    /// swept during revalidation.
    invalid_first_tag: BTreeSet<(PortNo, VlanId)>,
}

impl Resources {
    pub fn new(dpid: u64) -> Self {
        Resources {
            dpid,
            known_ports: BTreeSet::new(),
            groups: IdAllocator::new(),
            group_of: FxHashMap::default(),
            endpoint_of: FxHashMap::default(),
            meter_pairs: IdAllocator::new(),
            meters: BTreeMap::new(),
            ingress_rates: BTreeMap::new(),
            egress_rates: BTreeMap::new(),
            installed_first_tag: BTreeSet::new(),
            invalid_first_tag: BTreeSet::new(),
        }
    }

    /// Forget everything realised on the switch, keeping only the desired
    /// rate configuration. Used on datapath leave, and on enter just before
    /// the pipeline wipe, so reattachment starts from a clean allocator.
    pub fn reset_realized(&mut self) {
        self.known_ports.clear();
        self.groups = IdAllocator::new();
        self.group_of.clear();
        self.endpoint_of.clear();
        self.meter_pairs = IdAllocator::new();
        self.meters.clear();
        self.installed_first_tag.clear();
        self.invalid_first_tag.clear();
    }

    // ------------------------------------------------------------------
    // Groups

    pub fn group_of(&self, ep: &Endpoint) -> Option<GroupId> {
        self.group_of.get(ep).copied()
    }

    pub fn groups_held(&self) -> usize {
        self.group_of.len()
    }

    /// Get or allocate the group id for an endpoint. The boolean is true
    /// when the id was freshly claimed.
    pub fn claim_group(&mut self, ep: &Endpoint) -> (GroupId, bool) {
        if let Some(group) = self.group_of.get(ep) {
            return (*group, false);
        }
        let group = self.groups.claim();
        log::info!("{:016x}: claiming group {} for {}", self.dpid, group, ep);
        self.group_of.insert(*ep, group);
        self.endpoint_of.insert(group, *ep);
        (group, true)
    }

    /// Release the group held by an endpoint, if any.
    pub fn release_group(&mut self, ep: &Endpoint) -> Option<GroupId> {
        let group = self.group_of.remove(ep)?;
        log::info!("{:016x}: releasing group {} for {}", self.dpid, group, ep);
        self.endpoint_of.remove(&group);
        self.groups.release(group);
        Some(group)
    }

    // ------------------------------------------------------------------
    // First-tag rules
    //
    // Tagged endpoints need a table-0 rule that pops the outer tag into the
    // metadata register and resubmits to table 1. The rule is shared by
    // every endpoint with the same (port, outer) prefix, so installs and
    // deletes are tracked here rather than per slice.

    pub fn ensure_first_tag_rule(&mut self, ep: &Endpoint, out: &mut dyn MessageSink) {
        let Some((port, vlan)) = ep.first_tag() else {
            return;
        };
        if !self.installed_first_tag.insert((port, vlan)) {
            return;
        }
        let mut instructions = InstructionList::new();
        instructions.push(Instruction::Apply(smallvec![
            Action::PopVlan,
            Action::SetMetadata(vlan as u64),
        ]));
        instructions.push(Instruction::GotoTable(TABLE_TAGGED));
        out.send(Message::FlowAdd(FlowAdd {
            table: TABLE_UNTAGGED,
            priority: PRIO_ENDPOINT,
            matcher: Match::in_port(port).with_vlan_vid(VLAN_PRESENT | vlan),
            instructions,
            ..Default::default()
        }));
    }

    /// Mark an endpoint's first-tag rule as possibly unreferenced.
    pub fn invalidate_first_tag_rule(&mut self, ep: &Endpoint) {
        if let Some(tag) = ep.first_tag() {
            self.invalid_first_tag.insert(tag);
        }
    }

    /// Delete marked first-tag rules that no endpoint in `in_use` still
    /// needs.
    pub fn sweep_first_tag_rules(
        &mut self,
        in_use: &BTreeSet<(PortNo, VlanId)>,
        out: &mut dyn MessageSink,
    ) {
        for tag in std::mem::take(&mut self.invalid_first_tag) {
            if in_use.contains(&tag) || !self.installed_first_tag.remove(&tag) {
                continue;
            }
            let (port, vlan) = tag;
            out.send(Message::FlowDelete(FlowDelete {
                table: TABLE_UNTAGGED,
                matcher: Match::in_port(port).with_vlan_vid(VLAN_PRESENT | vlan),
                ..Default::default()
            }));
        }
    }

    // ------------------------------------------------------------------
    // Meters
    //
    // An endpoint with any configured rate owns a meter pair n; ingress
    // traffic is metered by id 2n+1, egress by 2n+2 (meter ids start at 1).
    // Clearing a rate keeps the meter with an effectively unlimited band so
    // ids stay stable; the pair is only released when the endpoint leaves
    // the configuration.

    /// Record the desired ingress rate. Returns true if reprogramming is
    /// needed.
    pub fn set_ingress_rate(&mut self, ep: &Endpoint, rate: Option<u32>) -> bool {
        Self::set_rate(&mut self.ingress_rates, &self.meters, ep, rate, |m| {
            m.ingress
        })
    }

    /// Record the desired egress rate. Returns true if reprogramming is
    /// needed.
    pub fn set_egress_rate(&mut self, ep: &Endpoint, rate: Option<u32>) -> bool {
        Self::set_rate(&mut self.egress_rates, &self.meters, ep, rate, |m| m.egress)
    }

    fn set_rate(
        rates: &mut BTreeMap<Endpoint, u32>,
        meters: &BTreeMap<Endpoint, MeterState>,
        ep: &Endpoint,
        rate: Option<u32>,
        programmed: impl Fn(&MeterState) -> Option<Band>,
    ) -> bool {
        match rate {
            Some(rate) => rates.insert(*ep, rate) != Some(rate),
            // No rate requested: reprogramming is only needed if a previous
            // rate is still in force.
            None => {
                rates.remove(ep).is_some()
                    || meters
                        .get(ep)
                        .and_then(&programmed)
                        .is_some_and(|band| band != Band::Unlimited)
            }
        }
    }

    /// Bring the endpoint's meters in line with the desired rates, emitting
    /// meter mods only for genuine changes.
    pub fn ensure_meters(&mut self, ep: &Endpoint, out: &mut dyn MessageSink) {
        let want_ingress = self.desired_band(&self.ingress_rates, ep, |m| m.ingress);
        let want_egress = self.desired_band(&self.egress_rates, ep, |m| m.egress);
        if want_ingress.is_none() && want_egress.is_none() {
            return;
        }
        let pair = match self.meters.get(ep) {
            Some(state) => state.pair,
            None => self.meter_pairs.claim(),
        };
        let state = self.meters.entry(*ep).or_insert_with(|| MeterState {
            pair,
            ..Default::default()
        });
        if let Some(want) = want_ingress {
            if state.ingress != Some(want) {
                let msg = want.to_mod(ingress_meter_id(pair));
                out.send(if state.ingress.is_none() {
                    Message::MeterAdd(msg)
                } else {
                    Message::MeterModify(msg)
                });
                state.ingress = Some(want);
            }
        }
        if let Some(want) = want_egress {
            if state.egress != Some(want) {
                let msg = want.to_mod(egress_meter_id(pair));
                out.send(if state.egress.is_none() {
                    Message::MeterAdd(msg)
                } else {
                    Message::MeterModify(msg)
                });
                state.egress = Some(want);
            }
        }
    }

    fn desired_band(
        &self,
        rates: &BTreeMap<Endpoint, u32>,
        ep: &Endpoint,
        programmed: impl Fn(&MeterState) -> Option<Band>,
    ) -> Option<Band> {
        match rates.get(ep) {
            Some(rate) => Some(Band::Limited(*rate)),
            // Keep an existing meter alive with an unlimited band.
            None => self.meters.get(ep).and_then(programmed).map(|_| Band::Unlimited),
        }
    }

    pub fn ingress_meter(&self, ep: &Endpoint) -> Option<MeterId> {
        let state = self.meters.get(ep)?;
        state.ingress.map(|_| ingress_meter_id(state.pair))
    }

    pub fn egress_meter(&self, ep: &Endpoint) -> Option<MeterId> {
        let state = self.meters.get(ep)?;
        state.egress.map(|_| egress_meter_id(state.pair))
    }

    /// Delete meters whose endpoint is no longer part of any slice, and
    /// forget their desired rates.
    pub fn sweep_meters(&mut self, owned: &BTreeSet<Endpoint>, out: &mut dyn MessageSink) {
        let stale: Vec<Endpoint> =
            self.meters.keys().filter(|ep| !owned.contains(*ep)).copied().collect();
        for ep in stale {
            let state = self.meters.remove(&ep).expect("stale meter key");
            log::info!("{:016x}: dropping meters for {}", self.dpid, ep);
            if state.ingress.is_some() {
                out.send(Message::MeterDelete {
                    meter: ingress_meter_id(state.pair),
                });
            }
            if state.egress.is_some() {
                out.send(Message::MeterDelete {
                    meter: egress_meter_id(state.pair),
                });
            }
            self.meter_pairs.release(state.pair);
            self.ingress_rates.remove(&ep);
            self.egress_rates.remove(&ep);
        }
        self.ingress_rates.retain(|ep, _| owned.contains(ep));
        self.egress_rates.retain(|ep, _| owned.contains(ep));
    }
}

fn ingress_meter_id(pair: u32) -> MeterId {
    2 * pair + 1
}

fn egress_meter_id(pair: u32) -> MeterId {
    2 * pair + 2
}
