//! Control node: boot sequence and the 10 ms periodic loop.
//!
//! Network topology and data flow:
//!
//! ```text
//!                       Device Node 0
//!                         /
//!                        /
//! Ground --- Control Node --- Device Node 1
//!                        \
//!                         \
//!                       Device Node 2
//! ```
//!
//! Every loop tick the control node sends a copy of `CnToDn0/1/2` to the
//! matching device node and a copy of the entire Data Vector to ground, then
//! attempts to receive `Dn0ToCn/Dn1ToCn/Dn2ToCn/GndToCn` images back. The
//! outbound send doubles as the loop synchronizer: device nodes start their
//! own loop on receiving it.
//!
//! The Network Manager config must contain these five nodes and four
//! channels; the Data Vector config must contain the eight regions above
//! plus the control node bookkeeping elements. Both are verified before
//! anything comes up.
//!
//! A device that stays silent through the receive window costs one tick of
//! its data and bumps its dedicated miss counter. Ground is sporadic by
//! design and has no miss counter. No step failure aborts the loop; every
//! failure bumps the error counter and the loop continues.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use crate::clock_sync;
use crate::cmd::{CmdConfig, CommandHandler};
use crate::ctrl::Controller;
use crate::dv::{increment_on_error, DataVector, DvConfig, DvElem, DvRegion};
use crate::errors::Error;
use crate::net::{NetConfig, NetworkManager, Node};
use crate::sched::{Affinity, ThreadManager, MAX_NEW_THREAD_PRIORITY};
use crate::sm::{SmConfig, StateMachine};
use crate::time::{Time, NS_IN_MS};

/// Loop period.
pub const LOOP_PERIOD_NS: u64 = 10 * NS_IN_MS;
/// Wait for device and ground messages at the top of the loop.
pub const DATA_RX_TIMEOUT_NS: u64 = 2 * NS_IN_MS;

/// Nodes received from each tick, in receive-buffer order.
const RECV_NODES: [Node; 4] = [Node::Device0, Node::Device1, Node::Device2, Node::Ground];

/// Controller initialization hook. Controllers have per-type configs, so the
/// caller builds them; the entry function only wires them into the loop.
pub type InitControllers =
    fn(&Arc<DataVector>) -> Result<Vec<Box<dyn Controller>>, Error>;

/// Everything the loop touches, owned by the periodic thread.
pub(crate) struct ControlNode {
    dv: Arc<DataVector>,
    nm: NetworkManager,
    cmd_handler: CommandHandler,
    sm: StateMachine,
    controllers: Vec<Box<dyn Controller>>,
    dn_send_bufs: [Vec<u8>; 3],
    gnd_send_buf: Vec<u8>,
    recv_bufs: Vec<Vec<u8>>,
    recv_counts: Vec<u32>,
    /// Last good clock reading, reused if a tick's read fails.
    last_time_ns: u64,
}

/// Bring up every subsystem, install the loop as a periodic thread, and block
/// on it. Returns only on failure; the process should exit non-zero with it.
pub fn entry(
    nm_config: NetConfig,
    dv_config: DvConfig,
    cmd_config: CmdConfig,
    sm_config: SmConfig,
    init_controllers: InitControllers,
) -> Result<Infallible, Error> {
    // Reject a bad config before anything touches kernel scheduling state or
    // the network.
    verify_nm_config(&nm_config)?;
    verify_dv_config(&dv_config)?;

    // Thread manager next, so the scheduling environment is in place before
    // the subsystems come up.
    let tm = ThreadManager::instance()?;

    let mut node = ControlNode::new(nm_config, dv_config, cmd_config, sm_config, init_controllers)?;
    log::info!("control node up, entering {}ms loop", LOOP_PERIOD_NS / NS_IN_MS);

    let handle = tm.create_periodic_thread(
        move || node.loop_once(),
        MAX_NEW_THREAD_PRIORITY,
        Affinity::Core0,
        LOOP_PERIOD_NS,
        |err| {
            // Flight policy: a deadline miss or body failure ends the node.
            log::error!("loop thread fatal: {err}");
            Err(err)
        },
    )?;

    match tm.wait(handle) {
        Err(err) => Err(err),
        Ok(()) => Err(Error::UnexpectedExit),
    }
}

impl ControlNode {
    /// Configs must have passed [`verify_nm_config`] and [`verify_dv_config`]
    /// before this runs.
    pub(crate) fn new(
        nm_config: NetConfig,
        dv_config: DvConfig,
        cmd_config: CmdConfig,
        sm_config: SmConfig,
        init_controllers: InitControllers,
    ) -> Result<ControlNode, Error> {
        let dv = Arc::new(DataVector::new(&dv_config)?);

        let dn_send_bufs = [
            vec![0; dv.region_size_bytes(DvRegion::CnToDn0)?],
            vec![0; dv.region_size_bytes(DvRegion::CnToDn1)?],
            vec![0; dv.region_size_bytes(DvRegion::CnToDn2)?],
        ];
        let gnd_send_buf = vec![0; dv.total_size_bytes()];
        let mut recv_bufs = Vec::with_capacity(RECV_NODES.len());
        for node in RECV_NODES {
            let region = match node {
                Node::Device0 => DvRegion::Dn0ToCn,
                Node::Device1 => DvRegion::Dn1ToCn,
                Node::Device2 => DvRegion::Dn2ToCn,
                _ => DvRegion::GndToCn,
            };
            recv_bufs.push(vec![0; dv.region_size_bytes(region)?]);
        }
        let recv_counts = vec![0; RECV_NODES.len()];

        let nm = NetworkManager::new(&nm_config, Arc::clone(&dv))?;

        // Device clocks adjust against ours; all must confirm before the
        // time source comes up.
        clock_sync::sync_server(&nm, &[Node::Device0, Node::Device1, Node::Device2])?;

        let cmd_handler = CommandHandler::new(cmd_config, Arc::clone(&dv))?;
        let controllers = init_controllers(&dv)?;

        let time = Time::instance()?;
        let now_ns = time.now_ns()?;
        dv.write(DvElem::CnTimeNs, now_ns)?;

        // Last, so in-state time starts counting right as the loop does.
        let sm = StateMachine::new(&sm_config, Arc::clone(&dv), now_ns, DvElem::State)?;

        Ok(ControlNode {
            dv,
            nm,
            cmd_handler,
            sm,
            controllers,
            dn_send_bufs,
            gnd_send_buf,
            recv_bufs,
            recv_counts,
            last_time_ns: now_ns,
        })
    }

    /// One loop tick. Always returns success: step failures are surfaced
    /// through the error counter, never by aborting the loop.
    pub(crate) fn loop_once(&mut self) -> Result<(), Error> {
        // 1) Send Data Vector snapshots to every peer.
        let sent = self.send_data_vector_data();
        increment_on_error(sent, &self.dv, DvElem::CnErrorCount);

        // 2) Collect peer regions for up to the comms budget.
        let received = self.recv_data_vector_data();
        increment_on_error(received, &self.dv, DvElem::CnErrorCount);

        // 3) Stamp the tick time.
        let now_ns = match Time::instance().and_then(Time::now_ns) {
            Ok(now_ns) => {
                self.last_time_ns = now_ns;
                now_ns
            }
            Err(err) => {
                increment_on_error(Err(err), &self.dv, DvElem::CnErrorCount);
                self.last_time_ns
            }
        };
        let stamped = self.dv.write(DvElem::CnTimeNs, now_ns);
        increment_on_error(stamped, &self.dv, DvElem::CnErrorCount);

        // 4) Commands before the state machine: transitions may hinge on a
        //    ground command from this very tick.
        let commanded = self.cmd_handler.run();
        increment_on_error(commanded, &self.dv, DvElem::CnErrorCount);

        // 5) Step the state machine.
        let stepped = self.sm.step(now_ns);
        increment_on_error(stepped, &self.dv, DvElem::CnErrorCount);

        // 6) Run the controllers in configured order. A failing controller
        //    only loses its own step.
        for controller in &mut self.controllers {
            let ran = controller.run();
            increment_on_error(ran, &self.dv, DvElem::CnErrorCount);
        }

        // 7) Count the tick.
        let counted = self.dv.increment(DvElem::CnLoopCount);
        increment_on_error(counted, &self.dv, DvElem::CnErrorCount);

        Ok(())
    }

    fn send_data_vector_data(&mut self) -> Result<(), Error> {
        self.dv.read_region(DvRegion::CnToDn0, &mut self.dn_send_bufs[0])?;
        self.dv.read_region(DvRegion::CnToDn1, &mut self.dn_send_bufs[1])?;
        self.dv.read_region(DvRegion::CnToDn2, &mut self.dn_send_bufs[2])?;
        self.dv.read_all(&mut self.gnd_send_buf)?;

        self.nm.send(Node::Device0, &self.dn_send_bufs[0])?;
        self.nm.send(Node::Device1, &self.dn_send_bufs[1])?;
        self.nm.send(Node::Device2, &self.dn_send_bufs[2])?;
        self.nm.send(Node::Ground, &self.gnd_send_buf)?;
        Ok(())
    }

    fn recv_data_vector_data(&mut self) -> Result<(), Error> {
        self.nm.recv_many(
            DATA_RX_TIMEOUT_NS,
            &RECV_NODES,
            &mut self.recv_bufs,
            &mut self.recv_counts,
        )?;

        for (index, node) in RECV_NODES.iter().enumerate() {
            let received = self.recv_counts[index] > 0;
            match node {
                Node::Device0 if received => {
                    self.dv.write_region(DvRegion::Dn0ToCn, &self.recv_bufs[index])?
                }
                Node::Device1 if received => {
                    self.dv.write_region(DvRegion::Dn1ToCn, &self.recv_bufs[index])?
                }
                Node::Device2 if received => {
                    self.dv.write_region(DvRegion::Dn2ToCn, &self.recv_bufs[index])?
                }
                Node::Device0 => self.dv.increment(DvElem::Dn0RxMissCount)?,
                Node::Device1 => self.dv.increment(DvElem::Dn1RxMissCount)?,
                Node::Device2 => self.dv.increment(DvElem::Dn2RxMissCount)?,
                // Ground traffic is sporadic; silence is not a miss.
                Node::Ground if received => {
                    self.dv.write_region(DvRegion::GndToCn, &self.recv_bufs[index])?
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// The loop depends on this exact topology.
fn verify_nm_config(config: &NetConfig) -> Result<(), Error> {
    for node in [
        Node::Control,
        Node::Device0,
        Node::Device1,
        Node::Device2,
        Node::Ground,
    ] {
        if !config.node_to_ip.contains_key(&node) {
            return Err(Error::InvalidConfig);
        }
    }

    let mut expected: HashSet<(Node, Node)> = HashSet::from([
        (Node::Control, Node::Device0),
        (Node::Control, Node::Device1),
        (Node::Control, Node::Device2),
        (Node::Control, Node::Ground),
    ]);
    for channel in &config.channels {
        let pair = if (channel.node_a as u8) < (channel.node_b as u8) {
            (channel.node_a, channel.node_b)
        } else {
            (channel.node_b, channel.node_a)
        };
        expected.remove(&pair);
    }
    if !expected.is_empty() {
        return Err(Error::InvalidConfig);
    }
    Ok(())
}

/// The loop depends on these regions and elements existing: the eight wire
/// regions, the control node bookkeeping elements, and the six command
/// handler slots.
fn verify_dv_config(config: &DvConfig) -> Result<(), Error> {
    let mut required_regions: HashSet<DvRegion> = HashSet::from([
        DvRegion::Cn,
        DvRegion::CnToDn0,
        DvRegion::CnToDn1,
        DvRegion::CnToDn2,
        DvRegion::Dn0ToCn,
        DvRegion::Dn1ToCn,
        DvRegion::Dn2ToCn,
        DvRegion::GndToCn,
    ]);
    let mut required_elems: HashSet<DvElem> = HashSet::from([
        DvElem::State,
        DvElem::CnTimeNs,
        DvElem::CnLoopCount,
        DvElem::CnErrorCount,
        DvElem::Dn0RxMissCount,
        DvElem::Dn1RxMissCount,
        DvElem::Dn2RxMissCount,
        DvElem::CmdReq,
        DvElem::CmdReqSeq,
        DvElem::CmdWriteElem,
        DvElem::CmdWriteVal,
        DvElem::Cmd,
        DvElem::CmdProcessedSeq,
    ]);

    for region_config in config {
        required_regions.remove(&region_config.region);
        for elem_config in &region_config.elems {
            required_elems.remove(&elem_config.elem);
        }
    }

    if !required_regions.is_empty() || !required_elems.is_empty() {
        return Err(Error::InvalidConfig);
    }
    Ok(())
}
