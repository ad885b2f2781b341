//! The slice reconciliation engine.
//!
//! A [`SwitchState`] holds the desired configuration of one switch (a set of
//! [`Slice`]s, each a set of [`Endpoint`]s) together with the realised state:
//! which endpoints currently have rules installed, which group and meter ids
//! are allocated to them, and which MACs have been learned where. Mutations
//! mark slices invalid; [`SwitchState::revalidate`] drains the invalid set in
//! two strict passes (deletes, then adds) and emits the difference as a
//! stream of typed OpenFlow messages.
//!
//! Nothing here talks to a switch. Callers hand in a
//! [`MessageSink`](slicerd_openflow::MessageSink) and ship the result.

mod alloc;
mod config;
mod endpoint;
mod resources;
mod slice;
mod switch;

pub use self::{
    alloc::IdAllocator,
    config::{CircuitRequest, ConfigError, ConfigUpdate, LearnRequest, validate_endpoint_set},
    endpoint::{Endpoint, EndpointError, endpoints_text},
    slice::Slice,
    switch::{SliceId, SwitchState},
};

/// Pipeline layout: table ids and rule priorities, shared by the engine and
/// by anything that inspects the emitted flow mods.
pub mod pipeline {
    use slicerd_openflow::TableId;

    /// Ingress table for untagged traffic and first-tag extraction.
    pub const TABLE_UNTAGGED: TableId = 0;
    /// Ingress table for traffic whose outer tag was popped into metadata.
    pub const TABLE_TAGGED: TableId = 1;
    /// Learned-forwarding and flood table.
    pub const TABLE_FORWARD: TableId = 2;

    /// Untagged-LLDP drop in table 0.
    pub const PRIO_LLDP_DROP: u16 = 6;
    /// MAC-qualified ingress rules installed by learning.
    pub const PRIO_LEARNED_SRC: u16 = 5;
    /// Endpoint ingress rules: E-Line, to-controller, and first-tag pop.
    pub const PRIO_ENDPOINT: u16 = 4;
    /// Learned unicast rules in the forwarding table.
    pub const PRIO_UNICAST: u16 = 2;
    /// Per-group flood rules in the forwarding table.
    pub const PRIO_FLOOD: u16 = 1;

    /// Idle timeout applied to learned ingress rules unless overridden.
    pub const DEFAULT_IDLE_TIMEOUT: u16 = 600;
}
