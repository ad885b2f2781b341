use std::{fs, path::Path};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use slicerd_controller::{Controller, Event, FlowRemoved, LogLink, PacketIn, RemovalReason};
use slicerd_openflow::{MacAddr, Match, NO_BUFFER, VLAN_PRESENT};
use slicerd_rest::{Api, parse_dpid};

/// One step of a scenario file. A scenario is a JSON array of steps, e.g.
///
/// ```json
/// [
///   {"enter": {"dpid": "00000000000000ab", "ports": [1, 2, 3]}},
///   {"post": {"dpid": "00000000000000ab",
///             "body": {"slices": [[{"circuit": [1]}, {"circuit": [2]}]]}}},
///   {"packet-in": {"dpid": "00000000000000ab", "table": 0, "in-port": 1,
///                  "src": "0a:00:00:00:00:01", "dst": "ff:ff:ff:ff:ff:ff"}},
///   {"get": {"dpid": "00000000000000ab"}}
/// ]
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", rename_all_fields = "kebab-case")]
enum Step {
    Enter {
        dpid: String,
        ports: Vec<u32>,
    },
    Leave {
        dpid: String,
    },
    PortUp {
        dpid: String,
        port: u32,
    },
    PortDown {
        dpid: String,
        port: u32,
    },
    PacketIn {
        dpid: String,
        table: u8,
        in_port: u32,
        metadata: Option<u64>,
        vlan: Option<u16>,
        src: String,
        dst: String,
    },
    FlowRemoved {
        dpid: String,
        table: u8,
        in_port: u32,
        metadata: Option<u64>,
        vlan: Option<u16>,
        src: String,
    },
    Post {
        dpid: String,
        body: serde_json::Value,
    },
    Get {
        dpid: String,
    },
}

pub async fn run(path: &Path, idle_timeout: u16) -> Result<()> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read scenario '{}'", path.display()))?;
    let steps: Vec<Step> = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse scenario '{}'", path.display()))?;

    let controller = Controller::new().with_idle_timeout(idle_timeout);
    let api = Api::new(controller.clone());

    for step in steps {
        match step {
            Step::Enter { dpid, ports } => {
                let dpid = dpid_of(&dpid)?;
                controller.dispatch(
                    dpid,
                    Event::DatapathEnter {
                        ports,
                        link: Box::new(LogLink { dpid }),
                    },
                );
                fence(&controller, dpid).await;
            }
            Step::Leave { dpid } => {
                let dpid = dpid_of(&dpid)?;
                controller.dispatch(dpid, Event::DatapathLeave);
                fence(&controller, dpid).await;
            }
            Step::PortUp { dpid, port } => {
                let dpid = dpid_of(&dpid)?;
                controller.dispatch(dpid, Event::PortAdded(port));
                fence(&controller, dpid).await;
            }
            Step::PortDown { dpid, port } => {
                let dpid = dpid_of(&dpid)?;
                controller.dispatch(dpid, Event::PortRemoved(port));
                fence(&controller, dpid).await;
            }
            Step::PacketIn {
                dpid,
                table,
                in_port,
                metadata,
                vlan,
                src,
                dst,
            } => {
                let dpid = dpid_of(&dpid)?;
                let src: MacAddr = src.parse()?;
                let dst: MacAddr = dst.parse()?;
                controller.dispatch(
                    dpid,
                    Event::PacketIn(PacketIn {
                        table,
                        matcher: matcher(in_port, metadata, vlan),
                        buffer_id: NO_BUFFER,
                        data: frame(dst, src),
                    }),
                );
                fence(&controller, dpid).await;
            }
            Step::FlowRemoved {
                dpid,
                table,
                in_port,
                metadata,
                vlan,
                src,
            } => {
                let dpid = dpid_of(&dpid)?;
                let src: MacAddr = src.parse()?;
                controller.dispatch(
                    dpid,
                    Event::FlowRemoved(FlowRemoved {
                        table,
                        matcher: matcher(in_port, metadata, vlan).with_eth_src(src),
                        reason: RemovalReason::IdleTimeout,
                    }),
                );
                fence(&controller, dpid).await;
            }
            Step::Post { dpid, body } => {
                let dpid = dpid_of(&dpid)?;
                let response = api.apply(dpid, &body.to_string()).await;
                println!("POST {:016x} -> {}", dpid, response.status.code());
                print!("{}", response.body);
            }
            Step::Get { dpid } => {
                let dpid = dpid_of(&dpid)?;
                let response = api.get_config(dpid).await;
                println!("GET {:016x} -> {}", dpid, response.status.code());
                print!("{}", response.body);
            }
        }
    }
    Ok(())
}

fn dpid_of(text: &str) -> Result<u64> {
    match parse_dpid(text) {
        Some(dpid) => Ok(dpid),
        None => bail!("'{text}' is not a 16-hex-digit dpid"),
    }
}

fn matcher(in_port: u32, metadata: Option<u64>, vlan: Option<u16>) -> Match {
    let mut m = Match::in_port(in_port);
    m.metadata = metadata;
    m.vlan_vid = vlan.map(|v| VLAN_PRESENT | v);
    m
}

/// A 64-byte frame carrying just the two addresses; the engine reads
/// nothing past them.
fn frame(dst: MacAddr, src: MacAddr) -> Vec<u8> {
    let mut data = vec![0u8; 64];
    data[0..6].copy_from_slice(&dst.octets());
    data[6..12].copy_from_slice(&src.octets());
    data
}

/// Wait for the switch's queue to drain so the narrated wire traffic stays
/// in step order.
async fn fence(controller: &Controller, dpid: u64) {
    let _ = controller.get_config(dpid).await;
}
