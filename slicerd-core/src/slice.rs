use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use slicerd_openflow::{
    Action, Bucket, CookieFilter, FLOOD_COOKIE, FlowAdd, FlowDelete, Instruction, InstructionList,
    MacAddr, Match, Message, MessageSink, port,
};
use smallvec::smallvec;

use crate::{
    endpoint::{Endpoint, endpoints_text},
    pipeline::{PRIO_FLOOD, TABLE_FORWARD},
    resources::Resources,
};

/// One logically isolated mini-switch.
///
/// `target` is what the operator asked for; `established` is what the switch
/// currently implements; `sanitized` is the subset of the target whose ports
/// actually exist, computed during revalidation. The realised behaviour
/// depends on the sanitized cardinality: one endpoint drops, two form an
/// E-Line, three or more run as a learning switch backed by one ALL-group
/// per endpoint.
#[derive(Debug, Default)]
pub struct Slice {
    target: BTreeSet<Endpoint>,
    established: BTreeSet<Endpoint>,
    sanitized: BTreeSet<Endpoint>,
    macs: FxHashMap<MacAddr, Endpoint>,
}

impl Slice {
    pub fn target(&self) -> &BTreeSet<Endpoint> {
        &self.target
    }

    pub fn established(&self) -> &BTreeSet<Endpoint> {
        &self.established
    }

    pub(crate) fn insert_target(&mut self, ep: Endpoint) -> bool {
        self.target.insert(ep)
    }

    pub(crate) fn remove_target(&mut self, ep: &Endpoint) -> bool {
        self.target.remove(ep)
    }

    /// Record where a MAC was last seen; returns the previous binding.
    pub(crate) fn see(&mut self, mac: MacAddr, ep: Endpoint) -> Option<Endpoint> {
        self.macs.insert(mac, ep)
    }

    /// Forget a MAC binding that aged out on `ep`.
    pub(crate) fn unsee(&mut self, mac: MacAddr, ep: &Endpoint) {
        if self.target.contains(ep) {
            self.macs.remove(&mac);
        }
    }

    /// Look up the endpoint a MAC was learned on, if it is still realised.
    pub fn lookup(&self, mac: &MacAddr) -> Option<Endpoint> {
        self.macs.get(mac).filter(|ep| self.established.contains(*ep)).copied()
    }

    /// Reduce the target to endpoints whose port is currently present.
    pub(crate) fn sanitize(&mut self, known_ports: &BTreeSet<u32>) {
        self.sanitized = self
            .target
            .iter()
            .filter(|ep| known_ports.contains(&ep.port()))
            .copied()
            .collect();
    }

    /// Adopt the sanitized set as established, dropping MAC bindings that
    /// now point outside the slice.
    pub(crate) fn commit(&mut self) {
        self.established = self.sanitized.clone();
        let established = &self.established;
        self.macs.retain(|_, ep| established.contains(&*ep));
    }

    /// Discard all realised state (datapath gone); the target survives.
    pub(crate) fn reset_realized(&mut self) {
        self.established.clear();
        self.sanitized.clear();
        self.macs.clear();
    }

    /// Endpoints that fell out of the target but still have rules installed.
    pub(crate) fn lost_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.established.difference(&self.target)
    }

    /// The set of endpoints whose rules are stale for the coming transition.
    ///
    /// Any transition away from exactly two endpoints rewrites both E-Line
    /// rules, and any transition down to two or fewer tears the whole slice
    /// down; only a large slice staying large can shrink incrementally.
    fn stale_endpoints(&self) -> BTreeSet<Endpoint> {
        if self.established.len() == 2 || self.sanitized.len() <= 2 {
            self.established.clone()
        } else {
            &self.established - &self.sanitized
        }
    }

    /// Delete-phase of the static-rule delta: remove rules and release
    /// groups for stale endpoints. Never installs anything.
    pub(crate) fn delete_static_rules(&self, res: &mut Resources, out: &mut dyn MessageSink) {
        if self.sanitized == self.established {
            return;
        }
        log::info!(
            "{:016x}: {} -> {}",
            res.dpid,
            endpoints_text(&self.established),
            endpoints_text(&self.sanitized)
        );

        let stale = self.stale_endpoints();
        for ep in &stale {
            log::info!("{:016x}: deleting rules for {}", res.dpid, ep);

            // One wildcard-cookie delete removes both the priority-5
            // learning rules and the priority-4 endpoint rule; the cookie
            // filter keeps rules of other slices for the same MACs intact.
            res.invalidate_first_tag_rule(ep);
            let (matcher, table, _) = ep.ingress_match(None);
            let group = res.group_of(ep);
            out.send(Message::FlowDelete(FlowDelete {
                table,
                matcher,
                cookie: group.map(|g| CookieFilter::exact(g as u64)),
                out_port: if group.is_some() {
                    port::CONTROLLER
                } else {
                    port::ANY
                },
                ..Default::default()
            }));
        }

        // A stale endpoint's group goes away with it: the group delete takes
        // the flood rule along (it references the group in its actions), the
        // cookie filter sweeps learned rules delivering to the endpoint, and
        // the metadata match sweeps learned rules sourced from it. Groups
        // exist exactly for the sanitized members of multi-endpoint slices.
        for ep in &stale {
            let Some(group) = res.release_group(ep) else {
                continue;
            };
            log::info!("{:016x}: deleting group {} for {}", res.dpid, group, ep);
            out.send(Message::GroupDelete { group });
            out.send(Message::FlowDelete(FlowDelete {
                table: TABLE_FORWARD,
                cookie: Some(CookieFilter::exact(group as u64)),
                ..Default::default()
            }));
            out.send(Message::FlowDelete(FlowDelete {
                table: TABLE_FORWARD,
                matcher: Match::metadata(group as u64),
                ..Default::default()
            }));
        }
    }

    /// Add-phase of the static-rule delta: allocate groups and install rules
    /// for the sanitized set. Never deletes anything.
    pub(crate) fn add_static_rules(&self, res: &mut Resources, out: &mut dyn MessageSink) {
        // Meters first so flow instructions can reference fresh ids.
        for ep in &self.sanitized {
            res.ensure_meters(ep, out);
        }

        if self.sanitized == self.established {
            return;
        }

        // Below two endpoints the switch's default drop applies.
        if self.sanitized.len() < 2 {
            return;
        }

        if self.sanitized.len() == 2 {
            let pair: Vec<Endpoint> = self.sanitized.iter().copied().collect();
            for i in 0..2 {
                let (ep, other) = (pair[i], pair[1 - i]);
                res.ensure_first_tag_rule(&ep, out);
                log::info!("{:016x}: adding e-line for {}->{}", res.dpid, ep, other);
                let (matcher, table, priority) = ep.ingress_match(None);
                let mut instructions = InstructionList::new();
                if let Some(meter) = res.ingress_meter(&ep) {
                    instructions.push(Instruction::Meter(meter));
                }
                if let Some(meter) = res.egress_meter(&other) {
                    instructions.push(Instruction::Meter(meter));
                }
                instructions.push(Instruction::Apply(other.egress_action(ep.port())));
                out.send(Message::FlowAdd(FlowAdd {
                    table,
                    priority,
                    matcher,
                    instructions,
                    ..Default::default()
                }));
            }
            return;
        }

        // Learning-switch behaviour. Anything that was small before gets
        // every endpoint treated as new; a large slice only grows by the
        // difference.
        let fresh = if self.established.len() <= 2 {
            self.sanitized.clone()
        } else {
            &self.sanitized - &self.established
        };

        for ep in &self.sanitized {
            let (group, added) = res.claim_group(ep);
            log::info!(
                "{:016x}: updating group {} for {} -> {}",
                res.dpid,
                group,
                ep,
                endpoints_text(self.sanitized.iter().filter(|d| *d != ep))
            );
            let buckets: Vec<Bucket> = self
                .sanitized
                .iter()
                .filter(|dest| *dest != ep)
                .map(|dest| Bucket {
                    actions: dest.egress_action(ep.port()),
                })
                .collect();
            out.send(if added {
                Message::GroupAdd { group, buckets }
            } else {
                Message::GroupModify { group, buckets }
            });

            if added {
                // Flood unknown destinations to the group. The rule dies
                // with the group since it references it in its actions; the
                // sentinel cookie keeps MAC unlearning away from it.
                let mut instructions = InstructionList::new();
                for dest in self.sanitized.iter().filter(|dest| *dest != ep) {
                    if let Some(meter) = res.egress_meter(dest) {
                        instructions.push(Instruction::Meter(meter));
                    }
                }
                instructions.push(Instruction::Apply(smallvec![Action::Group(group)]));
                out.send(Message::FlowAdd(FlowAdd {
                    table: TABLE_FORWARD,
                    priority: PRIO_FLOOD,
                    cookie: FLOOD_COOKIE,
                    matcher: Match::metadata(group as u64),
                    instructions,
                    ..Default::default()
                }));
            }
        }

        for ep in &fresh {
            // Unknown source MACs go to the controller for learning.
            let group = res.group_of(ep).expect("sanitized endpoint lost its group");
            let (matcher, table, priority) = ep.ingress_match(None);
            let mut instructions = InstructionList::new();
            if let Some(meter) = res.ingress_meter(ep) {
                instructions.push(Instruction::Meter(meter));
            }
            instructions.push(Instruction::Apply(smallvec![Action::OutputController]));
            out.send(Message::FlowAdd(FlowAdd {
                table,
                priority,
                cookie: group as u64,
                matcher,
                instructions,
                ..Default::default()
            }));
            res.ensure_first_tag_rule(ep, out);
        }
    }
}
