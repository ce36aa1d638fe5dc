//! Boot-time clock-sync handshake.
//!
//! The actual clock adjustment (NTP against the control node) is an external
//! collaborator; what the runtime owns is the gate around it. Before the
//! control node may initialize its time source, every device node must
//! confirm that its adjustment finished, over a single-byte sub-protocol on
//! the ordinary data channels:
//!
//! - control node → device: [`SERVER_READY`]
//! - device → control node: [`CLIENT_SYNC_SUCCESS`] or [`CLIENT_SYNC_FAIL`]
//!
//! Both sides block; this runs once at boot, before any periodic thread
//! exists.

use crate::errors::Error;
use crate::net::{NetworkManager, Node};

/// Control node is up and devices may start adjusting their clocks.
pub const SERVER_READY: u8 = 0x00;
/// Device adjusted its clock.
pub const CLIENT_SYNC_SUCCESS: u8 = 0x01;
/// Device failed to adjust its clock.
pub const CLIENT_SYNC_FAIL: u8 = 0x02;

/// Control-node side: tell every client to sync, then collect one
/// confirmation byte from each.
pub fn sync_server(nm: &NetworkManager, clients: &[Node]) -> Result<(), Error> {
    for &client in clients {
        nm.send(client, &[SERVER_READY])?;
    }

    for &client in clients {
        let mut response = [0u8; 1];
        nm.recv_block(client, &mut response)?;
        if response[0] != CLIENT_SYNC_SUCCESS {
            log::error!("{client:?} reported clock sync failure ({:#04x})", response[0]);
            return Err(Error::ClockSyncFailed);
        }
        log::info!("{client:?} clock synchronized");
    }

    Ok(())
}

/// Device side: wait for the go-ahead, run the adjustment, report the
/// outcome. The adjustment error, if any, is returned after the failure
/// byte has been sent.
pub fn sync_client(
    nm: &NetworkManager,
    server: Node,
    adjust: impl FnOnce() -> Result<(), Error>,
) -> Result<(), Error> {
    let mut ready = [0u8; 1];
    nm.recv_block(server, &mut ready)?;
    if ready[0] != SERVER_READY {
        return Err(Error::ClockSyncFailed);
    }

    match adjust() {
        Ok(()) => nm.send(server, &[CLIENT_SYNC_SUCCESS]),
        Err(err) => {
            nm.send(server, &[CLIENT_SYNC_FAIL])?;
            Err(err)
        }
    }
}
