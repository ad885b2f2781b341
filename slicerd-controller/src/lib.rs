//! Event multiplexing across switches.
//!
//! The OpenFlow session layer and the REST server both funnel their traffic
//! into [`Event`] values keyed by datapath id. A [`Controller`] owns one
//! spawned worker task per switch; each worker drains its queue serially, so
//! all engine state is single-writer and message order toward a given switch
//! is exactly the order revalidation produced. The transport must preserve
//! that order on the wire.
//!
//! Outbound messages leave through a [`DatapathLink`]. A failed send is
//! transport-fatal for that switch: the worker drops the link and detaches
//! the engine state, which keeps the desired configuration and rebuilds the
//! whole pipeline on the next datapath enter.

mod controller;
mod event;

pub use self::{
    controller::{Controller, LogLink},
    event::{Event, FlowRemoved, PacketIn, RemovalReason},
};

use std::io;

use slicerd_openflow::Message;

/// Outbound boundary toward one switch's OpenFlow session.
pub trait DatapathLink: Send {
    fn send(&mut self, msg: &Message) -> io::Result<()>;
}
