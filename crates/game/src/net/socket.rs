use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::rc::Rc;

use super::error::NetError;
use super::stats::NetworkStats;

/// Non-blocking datagram primitive the networking system polls once per tick.
pub trait Socket {
    fn local_addr(&self) -> SocketAddr;

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// `Ok(None)` when nothing is pending. Never blocks.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn stats(&self) -> NetworkStats;
}

pub struct UdpEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    stats: NetworkStats,
}

impl UdpEndpoint {
    pub fn bind(addr: SocketAddr) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(addr).map_err(|source| NetError::Bind { addr, source })?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            stats: NetworkStats::default(),
        })
    }

    /// Binds the group's port on every interface and joins the group, for
    /// hearing LAN discovery probes.
    pub fn bind_multicast(group: SocketAddr) -> Result<Self, NetError> {
        let endpoint = Self::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            group.port(),
        ))?;
        endpoint.join_multicast(group)?;
        Ok(endpoint)
    }

    pub fn join_multicast(&self, group: SocketAddr) -> Result<(), NetError> {
        let IpAddr::V4(ip) = group.ip() else {
            return Err(NetError::Multicast {
                group,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "only IPv4 groups are supported",
                ),
            });
        };
        self.socket
            .join_multicast_v4(&ip, &Ipv4Addr::UNSPECIFIED)
            .map_err(|source| NetError::Multicast { group, source })
    }
}

impl Socket for UdpEndpoint {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let bytes = self.socket.send_to(data, addr)?;
        self.stats.record_sent(bytes);
        Ok(bytes)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((size, addr)) => {
                self.stats.record_received(size);
                Ok(Some((size, addr)))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn stats(&self) -> NetworkStats {
        self.stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    InOrder,
    Reversed,
}

#[derive(Debug, Default)]
struct Link {
    dropping: bool,
    holding: bool,
    held: Vec<Vec<u8>>,
    dropped: u64,
}

#[derive(Debug, Default)]
struct Switchboard {
    inboxes: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    links: HashMap<(SocketAddr, SocketAddr), Link>,
}

impl Switchboard {
    fn deliver(&mut self, from: SocketAddr, to: SocketAddr, data: Vec<u8>) {
        if let Some(inbox) = self.inboxes.get_mut(&to) {
            inbox.push_back((from, data));
        }
    }
}

/// In-process datagram network for deterministic tests. Every socket bound
/// through the same handle can reach the others; links between two addresses
/// can drop or hold back datagrams.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    inner: Rc<RefCell<Switchboard>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, addr: SocketAddr) -> LoopbackSocket {
        self.inner
            .borrow_mut()
            .inboxes
            .entry(addr)
            .or_default();
        LoopbackSocket {
            addr,
            network: self.clone(),
            stats: NetworkStats::default(),
        }
    }

    pub fn set_dropping(&self, from: SocketAddr, to: SocketAddr, dropping: bool) {
        self.inner
            .borrow_mut()
            .links
            .entry((from, to))
            .or_default()
            .dropping = dropping;
    }

    /// Queue datagrams on the link instead of delivering them.
    pub fn hold(&self, from: SocketAddr, to: SocketAddr) {
        self.inner
            .borrow_mut()
            .links
            .entry((from, to))
            .or_default()
            .holding = true;
    }

    /// Stop holding and deliver whatever was held. Returns how many went out.
    pub fn release(&self, from: SocketAddr, to: SocketAddr, order: Release) -> usize {
        let mut board = self.inner.borrow_mut();
        let mut held = match board.links.get_mut(&(from, to)) {
            Some(link) => {
                link.holding = false;
                std::mem::take(&mut link.held)
            }
            None => return 0,
        };
        if order == Release::Reversed {
            held.reverse();
        }
        let count = held.len();
        for data in held {
            board.deliver(from, to, data);
        }
        count
    }

    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.inner
            .borrow()
            .inboxes
            .get(&addr)
            .map_or(0, VecDeque::len)
    }

    pub fn dropped(&self, from: SocketAddr, to: SocketAddr) -> u64 {
        self.inner
            .borrow()
            .links
            .get(&(from, to))
            .map_or(0, |link| link.dropped)
    }

    fn send(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let mut board = self.inner.borrow_mut();
        if let Some(link) = board.links.get_mut(&(from, to)) {
            if link.dropping {
                link.dropped += 1;
                return;
            }
            if link.holding {
                link.held.push(data.to_vec());
                return;
            }
        }
        board.deliver(from, to, data.to_vec());
    }

    fn recv(&self, addr: SocketAddr) -> Option<(SocketAddr, Vec<u8>)> {
        self.inner
            .borrow_mut()
            .inboxes
            .get_mut(&addr)
            .and_then(VecDeque::pop_front)
    }
}

#[derive(Debug)]
pub struct LoopbackSocket {
    addr: SocketAddr,
    network: LoopbackNetwork,
    stats: NetworkStats,
}

impl Socket for LoopbackSocket {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.network.send(self.addr, addr, data);
        self.stats.record_sent(data.len());
        Ok(data.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some((from, data)) = self.network.recv(self.addr) else {
            return Ok(None);
        };
        // Oversized datagrams are truncated, as a real socket would.
        let size = data.len().min(buf.len());
        buf[..size].copy_from_slice(&data[..size]);
        self.stats.record_received(size);
        Ok(Some((size, from)))
    }

    fn stats(&self) -> NetworkStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn loopback_delivers_between_bound_sockets() {
        let net = LoopbackNetwork::new();
        let mut a = net.bind(addr(1));
        let mut b = net.bind(addr(2));

        a.send_to(b"hello", addr(2)).unwrap();
        let mut buf = [0u8; 16];
        let (size, from) = b.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..size], b"hello");
        assert_eq!(from, addr(1));
        assert!(b.recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn loopback_hold_and_reverse_release() {
        let net = LoopbackNetwork::new();
        let mut a = net.bind(addr(1));
        let mut b = net.bind(addr(2));

        net.hold(addr(1), addr(2));
        for byte in [1u8, 2, 3] {
            a.send_to(&[byte], addr(2)).unwrap();
        }
        assert_eq!(net.pending(addr(2)), 0);
        assert_eq!(net.release(addr(1), addr(2), Release::Reversed), 3);

        let mut buf = [0u8; 4];
        let order: Vec<u8> = std::iter::from_fn(|| b.recv_from(&mut buf).unwrap().map(|_| buf[0]))
            .collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn loopback_drops_on_request() {
        let net = LoopbackNetwork::new();
        let mut a = net.bind(addr(1));
        let _b = net.bind(addr(2));

        net.set_dropping(addr(1), addr(2), true);
        a.send_to(&[0], addr(2)).unwrap();
        assert_eq!(net.pending(addr(2)), 0);
        assert_eq!(net.dropped(addr(1), addr(2)), 1);
    }
}
