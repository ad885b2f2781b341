use std::collections::BTreeSet;

use slicerd_openflow::MacAddr;

use crate::endpoint::{Endpoint, EndpointError};

/// One endpoint of a requested slice, with optional rate limits in kbit/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitRequest {
    pub endpoint: Endpoint,
    pub ingress_bw: Option<u32>,
    pub egress_bw: Option<u32>,
}

impl CircuitRequest {
    pub fn new(endpoint: Endpoint) -> Self {
        CircuitRequest {
            endpoint,
            ingress_bw: None,
            egress_bw: None,
        }
    }
}

/// A forced MAC binding, as installed by a packet-in but without the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LearnRequest {
    pub mac: MacAddr,
    pub endpoint: Endpoint,
    /// Idle timeout for the installed ingress rule; the engine default
    /// applies when absent.
    pub timeout: Option<u16>,
}

/// A full REST mutation, already parsed and range-checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub slices: Vec<Vec<CircuitRequest>>,
    pub disused: Vec<Endpoint>,
    pub learn: Option<LearnRequest>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("endpoints {0} and {1} conflict within one slice")]
    Conflict(Endpoint, Endpoint),
}

/// Reject a requested endpoint set whose members conflict with each other.
/// Duplicates have already collapsed in the set; only distinct conflicting
/// pairs are errors.
pub fn validate_endpoint_set(endpoints: &BTreeSet<Endpoint>) -> Result<(), ConfigError> {
    for a in endpoints {
        for b in endpoints.range(..*a) {
            if a.conflicts_with(b) {
                return Err(ConfigError::Conflict(*b, *a));
            }
        }
    }
    Ok(())
}
