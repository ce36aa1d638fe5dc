//! Flight wiring for the control node.
//!
//! Everything here is configuration: the flight Data Vector layout, the
//! network topology, the command slots, and the flight state graph. The
//! runtime itself lives in the library; this binary builds the configs,
//! installs a logger, and hands off to [`flightcore::cn::entry`], which does
//! not return on success.

use std::collections::HashMap;
use std::sync::Arc;

use flightcore::cmd::{CmdConfig, Command};
use flightcore::cn;
use flightcore::ctrl::Controller;
use flightcore::dv::{DataVector, DvConfig, DvElem, DvRegion, ElemConfig, RegionConfig};
use flightcore::net::{ChannelConfig, NetConfig, Node};
use flightcore::sm::{Action, ActionBatch, CompareOp, SmConfig, SmState, StateConfig, Transition};
use flightcore::time::NS_IN_S;
use flightcore::Error;

/// Chamber pressure (kPa) above which the motor counts as lit.
const CHAMBER_PRESSURE_LIT: f64 = 150.0;
/// Chamber pressure (kPa) below which the burn counts as over.
const CHAMBER_PRESSURE_BURNOUT: f64 = 20.0;

#[derive(clap::Parser)]
#[command(name = "control_node", about = "Flight-control stack control node")]
struct Args {
    /// IP of the control node (this machine).
    #[arg(long, default_value = "10.0.1.1")]
    control_ip: String,
    /// IP of device node 0.
    #[arg(long, default_value = "10.0.1.2")]
    device0_ip: String,
    /// IP of device node 1.
    #[arg(long, default_value = "10.0.1.3")]
    device1_ip: String,
    /// IP of device node 2.
    #[arg(long, default_value = "10.0.1.4")]
    device2_ip: String,
    /// IP of the ground station.
    #[arg(long, default_value = "10.0.1.5")]
    ground_ip: String,
    /// Log filter, e.g. "info" or "flightcore=debug".
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() {
    let args = <Args as clap::Parser>::parse();
    env_logger::Builder::new().parse_filters(&args.log).init();

    let err = match cn::entry(
        nm_config(&args),
        dv_config(),
        cmd_config(),
        sm_config(),
        init_controllers,
    ) {
        Err(err) => err,
        Ok(never) => match never {},
    };

    log::error!("control node failed: {err}");
    std::process::exit(1);
}

/// Concrete controller implementations (igniter sequencing, guidance, status
/// lamps) live in their own crates and register here; the state graph below
/// drives the actuator lines directly in the meantime.
fn init_controllers(_dv: &Arc<DataVector>) -> Result<Vec<Box<dyn Controller>>, Error> {
    Ok(Vec::new())
}

fn nm_config(args: &Args) -> NetConfig {
    NetConfig {
        node_to_ip: HashMap::from([
            (Node::Control, args.control_ip.clone()),
            (Node::Device0, args.device0_ip.clone()),
            (Node::Device1, args.device1_ip.clone()),
            (Node::Device2, args.device2_ip.clone()),
            (Node::Ground, args.ground_ip.clone()),
        ]),
        channels: vec![
            ChannelConfig { node_a: Node::Control, node_b: Node::Device0, port: 2200 },
            ChannelConfig { node_a: Node::Control, node_b: Node::Device1, port: 2201 },
            ChannelConfig { node_a: Node::Control, node_b: Node::Device2, port: 2202 },
            ChannelConfig { node_a: Node::Control, node_b: Node::Ground, port: 2203 },
        ],
        me: Node::Control,
        msg_tx_count_elem: DvElem::CnMsgTxCount,
        msg_rx_count_elem: DvElem::CnMsgRxCount,
    }
}

fn dv_config() -> DvConfig {
    vec![
        // Control node bookkeeping, visible to ground via the telemetry
        // snapshot.
        RegionConfig {
            region: DvRegion::Cn,
            elems: vec![
                ElemConfig::u32(DvElem::State, SmState::Init as u32),
                ElemConfig::u64(DvElem::CnTimeNs, 0),
                ElemConfig::u32(DvElem::CnLoopCount, 0),
                ElemConfig::u32(DvElem::CnErrorCount, 0),
                ElemConfig::u32(DvElem::Dn0RxMissCount, 0),
                ElemConfig::u32(DvElem::Dn1RxMissCount, 0),
                ElemConfig::u32(DvElem::Dn2RxMissCount, 0),
                ElemConfig::u32(DvElem::CnMsgTxCount, 0),
                ElemConfig::u32(DvElem::CnMsgRxCount, 0),
                ElemConfig::u8(DvElem::Cmd, Command::None as u8),
                ElemConfig::u32(DvElem::CmdProcessedSeq, 0),
            ],
        },
        // Actuator lines, one region per device so each gets exactly its
        // slice on the wire.
        RegionConfig {
            region: DvRegion::CnToDn0,
            elems: vec![ElemConfig::bool(DvElem::Dn0ActuatorCmd, false)],
        },
        RegionConfig {
            region: DvRegion::CnToDn1,
            elems: vec![ElemConfig::bool(DvElem::Dn1ActuatorCmd, false)],
        },
        RegionConfig {
            region: DvRegion::CnToDn2,
            elems: vec![ElemConfig::bool(DvElem::Dn2ActuatorCmd, false)],
        },
        // Device telemetry.
        RegionConfig {
            region: DvRegion::Dn0ToCn,
            elems: vec![
                ElemConfig::f64(DvElem::Dn0SensorReading, 0.0),
                ElemConfig::u32(DvElem::Dn0LoopCount, 0),
            ],
        },
        RegionConfig {
            region: DvRegion::Dn1ToCn,
            elems: vec![
                ElemConfig::f64(DvElem::Dn1SensorReading, 0.0),
                ElemConfig::u32(DvElem::Dn1LoopCount, 0),
            ],
        },
        RegionConfig {
            region: DvRegion::Dn2ToCn,
            elems: vec![
                ElemConfig::f64(DvElem::Dn2SensorReading, 0.0),
                ElemConfig::u32(DvElem::Dn2LoopCount, 0),
            ],
        },
        // Ground uplink: the command request slots.
        RegionConfig {
            region: DvRegion::GndToCn,
            elems: vec![
                ElemConfig::u8(DvElem::CmdReq, Command::None as u8),
                ElemConfig::u32(DvElem::CmdReqSeq, 0),
                ElemConfig::u32(DvElem::CmdWriteElem, 0),
                ElemConfig::u64(DvElem::CmdWriteVal, 0),
            ],
        },
    ]
}

fn cmd_config() -> CmdConfig {
    CmdConfig {
        cmd_req_elem: DvElem::CmdReq,
        cmd_req_seq_elem: DvElem::CmdReqSeq,
        cmd_write_elem: DvElem::CmdWriteElem,
        cmd_write_val_elem: DvElem::CmdWriteVal,
        cmd_elem: DvElem::Cmd,
        cmd_processed_seq_elem: DvElem::CmdProcessedSeq,
    }
}

/// The flight state graph.
///
/// Device 0 carries the motor igniter and the chamber pressure transducer;
/// device 2 carries the recovery charge. Ground can abort any time before
/// burnout.
fn sm_config() -> SmConfig {
    vec![
        StateConfig {
            id: SmState::Init,
            actions: vec![],
            transitions: vec![
                Transition::u8(DvElem::Cmd, CompareOp::Eq, Command::Launch as u8, SmState::Ignition),
                Transition::u8(DvElem::Cmd, CompareOp::Eq, Command::Abort as u8, SmState::Safed),
            ],
        },
        StateConfig {
            id: SmState::Ignition,
            actions: vec![
                ActionBatch {
                    offset_ns: 0,
                    actions: vec![Action::bool(DvElem::Dn0ActuatorCmd, true)],
                },
                // The igniter line never stays hot past the light window.
                ActionBatch {
                    offset_ns: 3 * NS_IN_S,
                    actions: vec![Action::bool(DvElem::Dn0ActuatorCmd, false)],
                },
            ],
            transitions: vec![
                Transition::u8(DvElem::Cmd, CompareOp::Eq, Command::Abort as u8, SmState::Safed),
                Transition::f64(
                    DvElem::Dn0SensorReading,
                    CompareOp::Gt,
                    CHAMBER_PRESSURE_LIT,
                    SmState::Ascent,
                ),
            ],
        },
        StateConfig {
            id: SmState::Ascent,
            actions: vec![ActionBatch {
                offset_ns: 0,
                actions: vec![Action::bool(DvElem::Dn0ActuatorCmd, false)],
            }],
            transitions: vec![Transition::f64(
                DvElem::Dn0SensorReading,
                CompareOp::Lt,
                CHAMBER_PRESSURE_BURNOUT,
                SmState::Recovery,
            )],
        },
        StateConfig {
            id: SmState::Recovery,
            actions: vec![ActionBatch {
                offset_ns: 0,
                actions: vec![Action::bool(DvElem::Dn2ActuatorCmd, true)],
            }],
            transitions: vec![],
        },
        StateConfig {
            id: SmState::Safed,
            actions: vec![ActionBatch {
                offset_ns: 0,
                actions: vec![
                    Action::bool(DvElem::Dn0ActuatorCmd, false),
                    Action::bool(DvElem::Dn1ActuatorCmd, false),
                    Action::bool(DvElem::Dn2ActuatorCmd, false),
                ],
            }],
            transitions: vec![],
        },
    ]
}
