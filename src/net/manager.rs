//! Channel bookkeeping, send with the noop unsticker, and the receive
//! variants.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::dv::{DataVector, DvElem};
use crate::errors::{Errno, Error};
use crate::net::{
    NetConfig, Node, SocketFd, MAX_PORT, MAX_RECV_BYTES, MAX_TIMEOUT_NS, MIN_PORT, NOOP_PORT,
};
use crate::time;

/// A live channel: the bound socket plus the precomputed destination.
struct Channel {
    sock: SocketFd,
    peer_ip: u32,
    peer_port: u16,
}

/// Maps peers to channels and counts traffic into the Data Vector.
pub struct NetworkManager {
    channels: HashMap<Node, Channel>,
    dv: Arc<DataVector>,
    msg_tx_count_elem: DvElem,
    msg_rx_count_elem: DvElem,
}

impl NetworkManager {
    /// Build the manager: validate the config, then create and bind one
    /// socket per channel that involves `me`. Channels between other nodes
    /// are legal in a shared config and simply ignored here.
    pub fn new(config: &NetConfig, dv: Arc<DataVector>) -> Result<NetworkManager, Error> {
        Self::verify_config(config, &dv)?;

        let me_ip = ip_to_u32(&config.node_to_ip[&config.me])?;
        let mut channels = HashMap::new();

        for channel in &config.channels {
            let peer = match (channel.node_a == config.me, channel.node_b == config.me) {
                (true, _) => channel.node_b,
                (_, true) => channel.node_a,
                _ => continue,
            };

            let sock = SocketFd::new_udp()?;
            sock.bind(me_ip, channel.port)?;
            channels.insert(
                peer,
                Channel {
                    sock,
                    peer_ip: ip_to_u32(&config.node_to_ip[&peer])?,
                    peer_port: channel.port,
                },
            );
        }

        log::info!(
            "network manager up for {:?} with {} channel(s)",
            config.me,
            channels.len()
        );

        Ok(NetworkManager {
            channels,
            dv,
            msg_tx_count_elem: config.msg_tx_count_elem,
            msg_rx_count_elem: config.msg_rx_count_elem,
        })
    }

    /// Validate a config without creating sockets.
    pub fn verify_config(config: &NetConfig, dv: &DataVector) -> Result<(), Error> {
        if config.node_to_ip.is_empty() || config.channels.is_empty() {
            return Err(Error::InvalidConfig);
        }

        let mut seen_ips = HashSet::new();
        for ip in config.node_to_ip.values() {
            ip_to_u32(ip)?;
            if !seen_ips.insert(ip.as_str()) {
                return Err(Error::InvalidConfig);
            }
        }

        let mut seen_pairs = HashSet::new();
        for channel in &config.channels {
            if channel.port < MIN_PORT || channel.port > MAX_PORT {
                return Err(Error::InvalidPort);
            }
            if channel.node_a == channel.node_b {
                return Err(Error::InvalidConfig);
            }
            if !config.node_to_ip.contains_key(&channel.node_a)
                || !config.node_to_ip.contains_key(&channel.node_b)
            {
                return Err(Error::InvalidConfig);
            }
            // One channel per node pair, regardless of orientation.
            let pair = if (channel.node_a as u8) < (channel.node_b as u8) {
                (channel.node_a, channel.node_b)
            } else {
                (channel.node_b, channel.node_a)
            };
            if !seen_pairs.insert(pair) {
                return Err(Error::InvalidConfig);
            }
        }

        if !config.node_to_ip.contains_key(&config.me) {
            return Err(Error::InvalidConfig);
        }

        dv.element_exists(config.msg_tx_count_elem)?;
        dv.element_exists(config.msg_rx_count_elem)?;

        Ok(())
    }

    /// Send `buf` to a peer as one datagram, then poke the noop port, then
    /// count the send.
    pub fn send(&self, node: Node, buf: &[u8]) -> Result<(), Error> {
        if buf.is_empty() {
            return Err(Error::EmptyBuffer);
        }
        let channel = self.channels.get(&node).ok_or(Error::UnknownNode)?;

        let sent = channel.sock.send_to(buf, channel.peer_ip, channel.peer_port)?;
        if sent != buf.len() {
            return Err(Error::NetUnexpectedSize);
        }

        // RX-FIFO unsticker, see the module docs.
        channel.sock.send_to(&[], channel.peer_ip, NOOP_PORT)?;

        self.dv.increment(self.msg_tx_count_elem)
    }

    /// Block until a datagram arrives from `node`, filling `buf` exactly.
    pub fn recv_block(&self, node: Node, buf: &mut [u8]) -> Result<(), Error> {
        let channel = self.recv_channel(node, buf)?;
        let received = channel.sock.recv(buf, true)?;
        self.finish_recv(buf.len(), received.unwrap_or(0))
    }

    /// Like [`Self::recv_block`] but returns immediately; the flag reports
    /// whether a datagram was consumed.
    pub fn recv_noblock(&self, node: Node, buf: &mut [u8]) -> Result<bool, Error> {
        let channel = self.recv_channel(node, buf)?;
        match channel.sock.recv(buf, false)? {
            None => Ok(false),
            Some(received) => {
                self.finish_recv(buf.len(), received)?;
                Ok(true)
            }
        }
    }

    /// For `timeout_ns`, collect datagrams from each listed peer.
    ///
    /// All three slices must have the same length. Every queued datagram on a
    /// readable channel is drained; the most recent payload per peer is kept
    /// and `counts[i]` is bumped per datagram, so `0` means the peer was
    /// silent and `> 1` means catch-up traffic. Returns when the timeout
    /// elapses, or immediately on a hard receive failure. The timeout clock
    /// is monotonic; the underlying `select` works in microseconds, rounded
    /// up.
    pub fn recv_many(
        &self,
        timeout_ns: u64,
        nodes: &[Node],
        bufs: &mut [Vec<u8>],
        counts: &mut [u32],
    ) -> Result<(), Error> {
        if timeout_ns > MAX_TIMEOUT_NS {
            return Err(Error::TimeoutTooLarge);
        }
        if nodes.len() != bufs.len() || nodes.len() != counts.len() {
            return Err(Error::VectorSizeMismatch);
        }

        let mut channels = Vec::with_capacity(nodes.len());
        for (node, buf) in nodes.iter().zip(bufs.iter()) {
            channels.push(self.recv_channel(*node, buf)?);
        }
        for count in counts.iter_mut() {
            *count = 0;
        }

        let deadline = time::monotonic_ns()?.saturating_add(timeout_ns);
        loop {
            let now = time::monotonic_ns()?;
            if now >= deadline {
                return Ok(());
            }
            let remaining_ns = deadline - now;

            let mut readfds: libc::fd_set = unsafe { core::mem::zeroed() };
            unsafe { libc::FD_ZERO(&mut readfds) };
            let mut maxfd = -1;
            for channel in &channels {
                let fd = channel.sock.raw();
                unsafe { libc::FD_SET(fd, &mut readfds) };
                maxfd = maxfd.max(fd);
            }

            let remaining_us = (remaining_ns + time::NS_IN_US - 1) / time::NS_IN_US;
            let mut tv = libc::timeval {
                tv_sec: (remaining_us / 1_000_000) as libc::time_t,
                tv_usec: (remaining_us % 1_000_000) as libc::suseconds_t,
            };

            let ready = unsafe {
                libc::select(
                    maxfd + 1,
                    &mut readfds,
                    core::ptr::null_mut(),
                    core::ptr::null_mut(),
                    &mut tv,
                )
            };
            if ready < 0 {
                return Err(Error::Select(Errno::last()));
            }
            if ready == 0 {
                return Ok(());
            }

            for (index, channel) in channels.iter().enumerate() {
                if !unsafe { libc::FD_ISSET(channel.sock.raw(), &readfds) } {
                    continue;
                }
                // Drain; the last payload wins.
                while let Some(received) = channel.sock.recv(&mut bufs[index], false)? {
                    if received != bufs[index].len() {
                        return Err(Error::NetUnexpectedSize);
                    }
                    counts[index] += 1;
                    self.dv.increment(self.msg_rx_count_elem)?;
                }
            }
        }
    }

    fn recv_channel(&self, node: Node, buf: &[u8]) -> Result<&Channel, Error> {
        if buf.is_empty() {
            return Err(Error::EmptyBuffer);
        }
        if buf.len() > MAX_RECV_BYTES {
            return Err(Error::SizeMismatch);
        }
        self.channels.get(&node).ok_or(Error::UnknownNode)
    }

    fn finish_recv(&self, expected: usize, received: usize) -> Result<(), Error> {
        if received != expected {
            return Err(Error::NetUnexpectedSize);
        }
        self.dv.increment(self.msg_rx_count_elem)
    }
}

fn ip_to_u32(ip: &str) -> Result<u32, Error> {
    ip.parse::<std::net::Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| Error::InvalidIp)
}
