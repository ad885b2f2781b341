use core::fmt;

use slicerd_openflow::{
    Action, ActionList, ETH_TYPE_CTAG, ETH_TYPE_STAG, MacAddr, Match, PortNo, TableId,
    VLAN_PRESENT, VlanId, port,
};
use smallvec::smallvec;

use crate::pipeline::{PRIO_ENDPOINT, PRIO_LEARNED_SRC, TABLE_TAGGED, TABLE_UNTAGGED};

/// One traffic class on a physical port: the whole port, one outer VLAN on
/// it, or one inner VLAN within an outer one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Endpoint {
    Port(PortNo),
    Tagged(PortNo, VlanId),
    DoubleTagged(PortNo, VlanId, VlanId),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("an endpoint has 1 to 3 components, got {0}")]
    Arity(usize),
    #[error("port {0} is out of range")]
    Port(u64),
    #[error("vlan {0} is out of range")]
    Vlan(u64),
}

impl Endpoint {
    /// Build an endpoint from raw request components, validating arity and
    /// field ranges.
    pub fn from_components(components: &[u64]) -> Result<Endpoint, EndpointError> {
        let port = |v: u64| {
            PortNo::try_from(v)
                .ok()
                .filter(|p| *p <= port::MAX_PHYSICAL)
                .ok_or(EndpointError::Port(v))
        };
        // The 0x1000 present-bit encoding leaves 12 bits for the id.
        let vlan = |v: u64| {
            if v <= 0x0fff {
                Ok(v as VlanId)
            } else {
                Err(EndpointError::Vlan(v))
            }
        };
        match *components {
            [p] => Ok(Endpoint::Port(port(p)?)),
            [p, v] => Ok(Endpoint::Tagged(port(p)?, vlan(v)?)),
            [p, v, i] => Ok(Endpoint::DoubleTagged(port(p)?, vlan(v)?, vlan(i)?)),
            _ => Err(EndpointError::Arity(components.len())),
        }
    }

    pub fn port(&self) -> PortNo {
        match *self {
            Endpoint::Port(p) | Endpoint::Tagged(p, _) | Endpoint::DoubleTagged(p, _, _) => p,
        }
    }

    pub fn outer_vlan(&self) -> Option<VlanId> {
        match *self {
            Endpoint::Port(_) => None,
            Endpoint::Tagged(_, v) | Endpoint::DoubleTagged(_, v, _) => Some(v),
        }
    }

    pub fn inner_vlan(&self) -> Option<VlanId> {
        match *self {
            Endpoint::DoubleTagged(_, _, i) => Some(i),
            _ => None,
        }
    }

    /// The `(port, outer-vlan)` pair served by a table-0 first-tag rule, for
    /// endpoints that have one.
    pub fn first_tag(&self) -> Option<(PortNo, VlanId)> {
        self.outer_vlan().map(|v| (self.port(), v))
    }

    pub fn components(&self) -> Vec<u64> {
        match *self {
            Endpoint::Port(p) => vec![p as u64],
            Endpoint::Tagged(p, v) => vec![p as u64, v as u64],
            Endpoint::DoubleTagged(p, v, i) => vec![p as u64, v as u64, i as u64],
        }
    }

    /// Two endpoints conflict when their ports match and every position both
    /// carry agrees. A bare port therefore conflicts with every tagged
    /// endpoint on the same port: the switch cannot tell system tags from
    /// user tags, so overlapping tag depths are mutually exclusive.
    pub fn conflicts_with(&self, other: &Endpoint) -> bool {
        if self.port() != other.port() {
            return false;
        }
        match (self.outer_vlan(), other.outer_vlan()) {
            (Some(a), Some(b)) if a != b => return false,
            (None, _) | (_, None) => return true,
            _ => {}
        }
        match (self.inner_vlan(), other.inner_vlan()) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    /// The ingress classification rule for this endpoint: its match, the
    /// table it lives in, and its priority. With a MAC the match becomes the
    /// source-qualified learning rule at the higher priority.
    ///
    /// Bare ports classify in table 0; tagged endpoints classify in table 1,
    /// where the popped outer tag is found in the metadata register.
    pub fn ingress_match(&self, mac: Option<MacAddr>) -> (Match, TableId, u16) {
        let mut matcher = Match::in_port(self.port());
        let mut table = TABLE_UNTAGGED;
        if let Some(outer) = self.outer_vlan() {
            matcher = matcher.with_metadata(outer as u64);
            table = TABLE_TAGGED;
        }
        if let Some(inner) = self.inner_vlan() {
            matcher = matcher.with_vlan_vid(VLAN_PRESENT | inner);
        }
        match mac {
            Some(mac) => (matcher.with_eth_src(mac), table, PRIO_LEARNED_SRC),
            None => (matcher, table, PRIO_ENDPOINT),
        }
    }

    /// The action list that delivers a packet to this endpoint, rebuilding
    /// its tag stack. If the output port equals `from_port` the reserved
    /// IN_PORT port is used; the switch drops the output otherwise.
    pub fn egress_action(&self, from_port: PortNo) -> ActionList {
        let out = if self.port() == from_port {
            port::IN_PORT
        } else {
            self.port()
        };
        match *self {
            Endpoint::Port(_) => smallvec![Action::Output(out)],
            Endpoint::Tagged(_, v) => smallvec![
                Action::PushVlan(ETH_TYPE_CTAG),
                Action::SetVlanVid(VLAN_PRESENT | v),
                Action::Output(out),
            ],
            Endpoint::DoubleTagged(_, v, i) => smallvec![
                Action::PushVlan(ETH_TYPE_CTAG),
                Action::SetVlanVid(VLAN_PRESENT | i),
                Action::PushVlan(ETH_TYPE_STAG),
                Action::SetVlanVid(VLAN_PRESENT | v),
                Action::Output(out),
            ],
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Endpoint::Port(p) => write!(f, "{p}"),
            Endpoint::Tagged(p, v) => write!(f, "{p}.{v}"),
            Endpoint::DoubleTagged(p, v, i) => write!(f, "{p}.{v}.{i}"),
        }
    }
}

/// Render a set of endpoints for log lines: `1, 2.100, 3.100.200`.
pub fn endpoints_text<'a, I>(endpoints: I) -> String
where
    I: IntoIterator<Item = &'a Endpoint>,
{
    let mut text = String::new();
    for ep in endpoints {
        if !text.is_empty() {
            text.push_str(", ");
        }
        text.push_str(&ep.to_string());
    }
    text
}
