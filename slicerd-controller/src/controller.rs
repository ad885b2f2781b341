use std::{io, sync::Arc};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use slicerd_core::{ConfigError, ConfigUpdate, Endpoint, SwitchState, validate_endpoint_set};
use slicerd_openflow::Message;
use tokio::sync::{mpsc, oneshot};

use crate::{DatapathLink, Event, RemovalReason};

/// The switch registry: hands each event to the per-switch worker, creating
/// the worker (and its retained configuration) on first contact.
///
/// Cloning is cheap; all clones share the registry.
#[derive(Clone)]
pub struct Controller {
    switches: Arc<Mutex<FxHashMap<u64, mpsc::UnboundedSender<Event>>>>,
    idle_timeout: u16,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    pub fn new() -> Self {
        Controller {
            switches: Arc::new(Mutex::new(FxHashMap::default())),
            idle_timeout: slicerd_core::pipeline::DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Override the idle timeout applied to learned ingress rules.
    pub fn with_idle_timeout(mut self, timeout: u16) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enqueue an event for a switch, creating its worker if this is the
    /// first contact. Must be called within a tokio runtime.
    pub fn dispatch(&self, dpid: u64, event: Event) {
        let _ = self.sender(dpid).send(event);
    }

    /// The current configuration of a switch, or `None` if the switch has
    /// never been configured or seen. Never creates state.
    pub async fn get_config(&self, dpid: u64) -> Option<Vec<Vec<Endpoint>>> {
        let tx = self.switches.lock().get(&dpid).cloned()?;
        let (reply, rx) = oneshot::channel();
        tx.send(Event::RestQuery { reply }).ok()?;
        rx.await.ok()
    }

    /// Apply a REST mutation and return the resulting configuration. An
    /// unknown switch is created so the configuration can be buffered until
    /// it attaches.
    pub async fn apply(
        &self,
        dpid: u64,
        update: ConfigUpdate,
    ) -> Result<Vec<Vec<Endpoint>>, ConfigError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(dpid, Event::RestMutation { update, reply });
        rx.await.expect("switch worker dropped a pending reply")
    }

    fn sender(&self, dpid: u64) -> mpsc::UnboundedSender<Event> {
        let mut switches = self.switches.lock();
        switches
            .entry(dpid)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let timeout = self.idle_timeout;
                tokio::spawn(run_switch(dpid, timeout, rx));
                tx
            })
            .clone()
    }
}

/// One switch's worker: owns the engine state and the outbound link, and
/// applies events strictly in order.
async fn run_switch(dpid: u64, idle_timeout: u16, mut rx: mpsc::UnboundedReceiver<Event>) {
    let mut state = SwitchState::new(dpid).with_idle_timeout(idle_timeout);
    let mut link: Option<Box<dyn DatapathLink>> = None;

    while let Some(event) = rx.recv().await {
        let mut out: Vec<Message> = Vec::new();
        match event {
            Event::DatapathEnter { ports, link: l } => {
                link = Some(l);
                state.attach(ports, &mut out);
            }
            Event::DatapathLeave => {
                link = None;
                state.detach();
            }
            Event::PortAdded(port) => {
                state.port_added(port);
                state.revalidate(&mut out);
            }
            Event::PortRemoved(port) => {
                state.port_removed(port);
                state.revalidate(&mut out);
            }
            Event::PacketIn(pkt) => {
                state.packet_in(pkt.table, &pkt.matcher, pkt.buffer_id, &pkt.data, &mut out);
            }
            Event::FlowRemoved(removed) => {
                // Only idle aging unlearns; explicit deletes are our own.
                if removed.reason == RemovalReason::IdleTimeout {
                    state.flow_removed(removed.table, &removed.matcher, &mut out);
                }
            }
            Event::RestMutation { update, reply } => {
                let result = apply_update(&mut state, update, &mut out);
                let _ = reply.send(result.map(|()| state.config()));
            }
            Event::RestQuery { reply } => {
                let _ = reply.send(state.config());
            }
        }

        if let Some(l) = link.as_mut() {
            if let Err(err) = deliver(l.as_mut(), &out) {
                // Transport-fatal: forget the link and the realised state;
                // the retained configuration is reinstalled on reattach.
                log::error!("{dpid:016x}: send failed, detaching: {err}");
                link = None;
                state.detach();
            }
        }
    }
}

/// One REST mutation against the engine. All requested slice sets are
/// validated before any is applied, so a bad request leaves no partial
/// state.
fn apply_update(
    state: &mut SwitchState,
    update: ConfigUpdate,
    out: &mut Vec<Message>,
) -> Result<(), ConfigError> {
    for circuits in &update.slices {
        let endpoints = circuits.iter().map(|c| c.endpoint).collect();
        validate_endpoint_set(&endpoints)?;
    }

    for ep in &update.disused {
        state.discard_endpoint(ep);
    }
    for circuits in &update.slices {
        state.create_slice(circuits)?;
    }
    state.revalidate(out);

    if let Some(learn) = update.learn {
        let timeout = learn.timeout.unwrap_or(state.default_idle_timeout());
        state.learn(learn.endpoint, learn.mac, timeout, out);
    }
    Ok(())
}

fn deliver(link: &mut dyn DatapathLink, messages: &[Message]) -> io::Result<()> {
    for msg in messages {
        link.send(msg)?;
    }
    Ok(())
}

/// A link that narrates the outbound stream instead of delivering it; used
/// by the replay driver and in development against no real switch.
pub struct LogLink {
    pub dpid: u64,
}

impl DatapathLink for LogLink {
    fn send(&mut self, msg: &Message) -> io::Result<()> {
        log::info!(target: "wire", "{:016x}: {}", self.dpid, msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use slicerd_core::{CircuitRequest, Endpoint};
    use slicerd_openflow::Message;

    use super::*;

    /// Captures everything sent toward the switch.
    struct RecordingLink(Arc<Mutex<Vec<Message>>>);

    impl DatapathLink for RecordingLink {
        fn send(&mut self, msg: &Message) -> io::Result<()> {
            self.0.lock().push(msg.clone());
            Ok(())
        }
    }

    /// A link that fails on first use, simulating a dead session.
    struct BrokenLink;

    impl DatapathLink for BrokenLink {
        fn send(&mut self, _msg: &Message) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }
    }

    fn ep(components: &[u64]) -> Endpoint {
        Endpoint::from_components(components).unwrap()
    }

    fn eline_update(a: &[u64], b: &[u64]) -> ConfigUpdate {
        ConfigUpdate {
            slices: vec![vec![
                CircuitRequest::new(ep(a)),
                CircuitRequest::new(ep(b)),
            ]],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mutations_are_buffered_until_attach() {
        let controller = Controller::new();

        // Configure a switch that has not attached yet.
        let config = controller.apply(0x1, eline_update(&[1], &[2])).await.unwrap();
        assert_eq!(config, vec![vec![ep(&[1]), ep(&[2])]]);

        // Nothing was sent anywhere; now attach and watch the E-Line appear.
        let wire = Arc::new(Mutex::new(Vec::new()));
        controller.dispatch(
            0x1,
            Event::DatapathEnter {
                ports: vec![1, 2],
                link: Box::new(RecordingLink(wire.clone())),
            },
        );
        // The query is serialized behind the enter event.
        let config = controller.get_config(0x1).await.unwrap();
        assert_eq!(config, vec![vec![ep(&[1]), ep(&[2])]]);

        let sent = wire.lock();
        let elines = sent
            .iter()
            .filter(|m| matches!(m, Message::FlowAdd(f) if f.priority == 4))
            .count();
        assert_eq!(elines, 2);
    }

    #[tokio::test]
    async fn unknown_switch_reads_as_absent() {
        let controller = Controller::new();
        assert_eq!(controller.get_config(0xdead).await, None);
    }

    #[tokio::test]
    async fn conflicting_update_is_rejected() {
        let controller = Controller::new();
        let result = controller.apply(0x1, eline_update(&[1], &[1, 100])).await;
        assert!(result.is_err());
        assert_eq!(controller.get_config(0x1).await, Some(vec![]));
    }

    #[tokio::test]
    async fn send_failure_detaches_but_keeps_config() {
        let controller = Controller::new();
        controller.apply(0x1, eline_update(&[1], &[2])).await.unwrap();

        controller.dispatch(
            0x1,
            Event::DatapathEnter {
                ports: vec![1, 2],
                link: Box::new(BrokenLink),
            },
        );

        // The worker survived the dead link and still serves the retained
        // configuration.
        let config = controller.get_config(0x1).await.unwrap();
        assert_eq!(config, vec![vec![ep(&[1]), ep(&[2])]]);

        // A healthy reattach rebuilds the pipeline.
        let wire = Arc::new(Mutex::new(Vec::new()));
        controller.dispatch(
            0x1,
            Event::DatapathEnter {
                ports: vec![1, 2],
                link: Box::new(RecordingLink(wire.clone())),
            },
        );
        controller.get_config(0x1).await.unwrap();
        assert!(wire.lock().iter().any(|m| matches!(m, Message::FlowAdd(_))));
    }
}
