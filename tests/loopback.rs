//! Cross-module scenarios over the public API: region images on the wire,
//! miss detection, and command replay.

use std::collections::HashMap;
use std::sync::Arc;

use flightcore::cmd::{CmdConfig, Command, CommandHandler};
use flightcore::dv::{DataVector, DvElem, DvRegion, ElemConfig, RegionConfig};
use flightcore::net::{ChannelConfig, NetConfig, NetworkManager, Node};
use flightcore::time::NS_IN_MS;
use flightcore::Error;

fn counter_dv() -> Arc<DataVector> {
    Arc::new(
        DataVector::new(&[RegionConfig {
            region: DvRegion::Test2,
            elems: vec![
                ElemConfig::u32(DvElem::Test14, 0),
                ElemConfig::u32(DvElem::Test15, 0),
            ],
        }])
        .unwrap(),
    )
}

fn nm_config(me: Node, peers: &[(Node, u16)]) -> NetConfig {
    NetConfig {
        node_to_ip: HashMap::from([
            (Node::Control, "127.0.0.1".to_string()),
            (Node::Device0, "127.0.0.2".to_string()),
            (Node::Device1, "127.0.0.3".to_string()),
        ]),
        channels: peers
            .iter()
            .map(|&(peer, port)| ChannelConfig { node_a: me, node_b: peer, port })
            .collect(),
        me,
        msg_tx_count_elem: DvElem::Test14,
        msg_rx_count_elem: DvElem::Test15,
    }
}

/// A region image sent over a channel arrives bit-identical and lands in the
/// receiving node's vector via `write_region`.
#[test]
fn region_image_travels_between_vectors() {
    let sender_dv = Arc::new(
        DataVector::new(&[
            RegionConfig {
                region: DvRegion::Test0,
                elems: vec![
                    ElemConfig::u16(DvElem::Test0, 0),
                    ElemConfig::f32(DvElem::Test1, 0.0),
                ],
            },
            RegionConfig {
                region: DvRegion::Test2,
                elems: vec![
                    ElemConfig::u32(DvElem::Test14, 0),
                    ElemConfig::u32(DvElem::Test15, 0),
                ],
            },
        ])
        .unwrap(),
    );
    // The receiver carries the same region shape; both ends are built from
    // the same config, which is the whole wire contract.
    let receiver_dv = Arc::new(
        DataVector::new(&[
            RegionConfig {
                region: DvRegion::Test0,
                elems: vec![
                    ElemConfig::u16(DvElem::Test0, 0),
                    ElemConfig::f32(DvElem::Test1, 0.0),
                ],
            },
            RegionConfig {
                region: DvRegion::Test2,
                elems: vec![
                    ElemConfig::u32(DvElem::Test14, 0),
                    ElemConfig::u32(DvElem::Test15, 0),
                ],
            },
        ])
        .unwrap(),
    );

    let sender = NetworkManager::new(
        &nm_config(Node::Control, &[(Node::Device0, 2280)]),
        Arc::clone(&sender_dv),
    )
    .unwrap();
    let receiver = NetworkManager::new(
        &nm_config(Node::Device0, &[(Node::Control, 2280)]),
        Arc::clone(&receiver_dv),
    )
    .unwrap();

    sender_dv.write::<u16>(DvElem::Test0, 0xBEEF).unwrap();
    sender_dv.write::<f32>(DvElem::Test1, -2.75).unwrap();

    let size = sender_dv.region_size_bytes(DvRegion::Test0).unwrap();
    let mut image = vec![0u8; size];
    sender_dv.read_region(DvRegion::Test0, &mut image).unwrap();
    sender.send(Node::Device0, &image).unwrap();

    let mut incoming = vec![0u8; size];
    receiver.recv_block(Node::Control, &mut incoming).unwrap();
    receiver_dv.write_region(DvRegion::Test0, &incoming).unwrap();

    assert_eq!(receiver_dv.read::<u16>(DvElem::Test0).unwrap(), 0xBEEF);
    assert_eq!(receiver_dv.read::<f32>(DvElem::Test1).unwrap(), -2.75);
}

/// One silent peer and one chatty peer through a single bounded receive.
#[test]
fn timed_receive_separates_silent_and_chatty_peers() {
    let hub_dv = counter_dv();
    let hub = NetworkManager::new(
        &nm_config(Node::Control, &[(Node::Device0, 2281), (Node::Device1, 2282)]),
        Arc::clone(&hub_dv),
    )
    .unwrap();
    let chatty = NetworkManager::new(
        &nm_config(Node::Device1, &[(Node::Control, 2282)]),
        counter_dv(),
    )
    .unwrap();

    chatty.send(Node::Control, &[0xAA]).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));

    let nodes = [Node::Device0, Node::Device1];
    let mut bufs = vec![vec![0u8; 1], vec![0u8; 1]];
    let mut counts = vec![0u32; 2];
    hub.recv_many(2 * NS_IN_MS, &nodes, &mut bufs, &mut counts)
        .unwrap();

    assert_eq!(counts, [0, 1]);
    assert_eq!(bufs[1], [0xAA]);
    assert_eq!(hub_dv.read::<u32>(DvElem::Test15).unwrap(), 1);
}

/// The ground uplink path end to end: a region image carrying a request is
/// written into the vector, the handler publishes it once, and the replayed
/// image does nothing.
#[test]
fn command_replay_through_region_image() {
    let dv = Arc::new(
        DataVector::new(&[
            RegionConfig {
                region: DvRegion::GndToCn,
                elems: vec![
                    ElemConfig::u8(DvElem::CmdReq, Command::None as u8),
                    ElemConfig::u32(DvElem::CmdReqSeq, 0),
                    ElemConfig::u32(DvElem::CmdWriteElem, 0),
                    ElemConfig::u64(DvElem::CmdWriteVal, 0),
                ],
            },
            RegionConfig {
                region: DvRegion::Cn,
                elems: vec![
                    ElemConfig::u8(DvElem::Cmd, Command::None as u8),
                    ElemConfig::u32(DvElem::CmdProcessedSeq, 0),
                ],
            },
        ])
        .unwrap(),
    );
    let handler = CommandHandler::new(
        CmdConfig {
            cmd_req_elem: DvElem::CmdReq,
            cmd_req_seq_elem: DvElem::CmdReqSeq,
            cmd_write_elem: DvElem::CmdWriteElem,
            cmd_write_val_elem: DvElem::CmdWriteVal,
            cmd_elem: DvElem::Cmd,
            cmd_processed_seq_elem: DvElem::CmdProcessedSeq,
        },
        Arc::clone(&dv),
    )
    .unwrap();

    // Ground's serialized uplink: LAUNCH with sequence number 5, exactly as
    // it would arrive off the wire.
    let mut request = vec![0u8; dv.region_size_bytes(DvRegion::GndToCn).unwrap()];
    request[0] = Command::Launch as u8;
    request[1..5].copy_from_slice(&5u32.to_le_bytes());

    dv.write_region(DvRegion::GndToCn, &request).unwrap();
    handler.run().unwrap();
    assert_eq!(dv.read::<u8>(DvElem::Cmd).unwrap(), Command::Launch as u8);
    assert_eq!(dv.read::<u32>(DvElem::CmdProcessedSeq).unwrap(), 5);

    // Replay: the identical image lands again; nothing double-counts.
    dv.write_region(DvRegion::GndToCn, &request).unwrap();
    handler.run().unwrap();
    assert_eq!(dv.read::<u32>(DvElem::CmdProcessedSeq).unwrap(), 5);
    assert_eq!(dv.read::<u8>(DvElem::Cmd).unwrap(), Command::Launch as u8);
}

/// Unknown-node and empty-buffer failures surface as typed errors without
/// touching the counters.
#[test]
fn error_paths_leave_counters_alone() {
    let dv = counter_dv();
    let nm = NetworkManager::new(
        &nm_config(Node::Control, &[(Node::Device0, 2283)]),
        Arc::clone(&dv),
    )
    .unwrap();

    assert_eq!(nm.send(Node::Device1, &[1]).err(), Some(Error::UnknownNode));
    assert_eq!(nm.send(Node::Device0, &[]).err(), Some(Error::EmptyBuffer));
    let mut buf: [u8; 0] = [];
    assert_eq!(
        nm.recv_noblock(Node::Device0, &mut buf).err(),
        Some(Error::EmptyBuffer)
    );

    assert_eq!(dv.read::<u32>(DvElem::Test14).unwrap(), 0);
    assert_eq!(dv.read::<u32>(DvElem::Test15).unwrap(), 0);
}
