use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use log::{debug, info, trace, warn};

use super::config::NetConfig;
use super::connection::{Connection, ConnectionState};
use super::dispatch::{DispatchEnv, DispatchTable, Role};
use super::error::{NetError, SendError};
use super::event::{DisconnectReason, NetCommand, NetEvent};
use super::handlers::{client_table, server_table};
use super::protocol::{DISCOVER_SIGNATURE, MAX_PACKET_SIZE, MessageType, PacketHeader};
use super::socket::{Socket, UdpEndpoint};
use super::wire::BufferReader;
use crate::ecs::{Entity, NetworkStatsComponent, World};

/// Owns the socket and every connection. Each tick the driver calls
/// `receive` before game logic and `send` after it.
pub struct NetworkingSystem {
    role: Role,
    config: NetConfig,
    socket: Box<dyn Socket>,
    discovery: Option<Box<dyn Socket>>,
    connections: HashMap<SocketAddr, Connection>,
    dispatch: DispatchTable,
    events: VecDeque<NetEvent>,
    commands: Vec<NetCommand>,
    last_ping: Option<Instant>,
    discovery_target: Option<SocketAddr>,
}

impl NetworkingSystem {
    pub fn new(role: Role, config: NetConfig, socket: impl Socket + 'static) -> Self {
        let dispatch = match role {
            Role::Server => server_table(),
            Role::Client => client_table(),
        };
        Self {
            role,
            config,
            socket: Box::new(socket),
            discovery: None,
            connections: HashMap::new(),
            dispatch,
            events: VecDeque::new(),
            commands: Vec::new(),
            last_ping: None,
            discovery_target: None,
        }
    }

    pub fn server(config: NetConfig, socket: impl Socket + 'static) -> Self {
        Self::new(Role::Server, config, socket)
    }

    pub fn client(config: NetConfig, socket: impl Socket + 'static) -> Self {
        Self::new(Role::Client, config, socket)
    }

    /// Binds the configured port on `ip` and joins the discovery group. A
    /// failed group join only disables discovery.
    pub fn bind_server(ip: IpAddr, config: NetConfig) -> Result<Self, NetError> {
        let addr = SocketAddr::new(ip, config.port);
        let socket = UdpEndpoint::bind(addr)?;
        info!("listening on {}", socket.local_addr());

        let group = config.multicast_group;
        let mut system = Self::server(config, socket);
        match UdpEndpoint::bind_multicast(group) {
            Ok(discovery) => system = system.with_discovery_socket(discovery),
            Err(e) => warn!("LAN discovery disabled: {e}"),
        }
        Ok(system)
    }

    /// Binds an ephemeral port for talking to one server.
    pub fn bind_client(config: NetConfig) -> Result<Self, NetError> {
        let socket = UdpEndpoint::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        debug!("client socket on {}", socket.local_addr());
        Ok(Self::client(config, socket))
    }

    /// Extra socket polled for discovery probes. Replies still leave through
    /// the main socket.
    pub fn with_discovery_socket(mut self, socket: impl Socket + 'static) -> Self {
        self.discovery = Some(Box::new(socket));
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn socket(&self) -> &dyn Socket {
        self.socket.as_ref()
    }

    pub fn dispatch_table_mut(&mut self) -> &mut DispatchTable {
        &mut self.dispatch
    }

    pub fn connection(&self, addr: SocketAddr) -> Option<&Connection> {
        self.connections.get(&addr)
    }

    pub fn connection_mut(&mut self, addr: SocketAddr) -> Option<&mut Connection> {
        self.connections.get_mut(&addr)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The client's link to its server, once the handshake finished.
    pub fn server_connection(&self) -> Option<&Connection> {
        self.connections.values().find(|c| c.is_connected())
    }

    pub fn server_connection_mut(&mut self) -> Option<&mut Connection> {
        self.connections.values_mut().find(|c| c.is_connected())
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = NetEvent> + '_ {
        self.events.drain(..)
    }

    /// Starts the handshake. `CONNECT` is repeated every ping interval until
    /// the server confirms or the attempt times out.
    pub fn connect(&mut self, addr: SocketAddr, now: Instant) -> Result<(), SendError> {
        let connection = self
            .connections
            .entry(addr)
            .or_insert_with(|| Connection::new(addr, now));
        connection.send_message(MessageType::Connect, |_| Ok(()))?;
        connection.flush(self.socket.as_mut(), now)?;
        info!("connecting to {addr}");
        Ok(())
    }

    /// Probe `target` for servers every ping interval until connected.
    pub fn discover(&mut self, target: SocketAddr) {
        self.discovery_target = Some(target);
    }

    pub fn stop_discovery(&mut self) {
        self.discovery_target = None;
    }

    /// Says goodbye and drops the connection.
    pub fn disconnect(&mut self, world: &mut World, addr: SocketAddr, now: Instant) -> bool {
        let Some(connection) = self.connections.get_mut(&addr) else {
            return false;
        };

        if let Err(e) = connection.flush(self.socket.as_mut(), now) {
            warn!("{addr}: flush before disconnect failed: {e}");
        }
        let farewell = connection
            .send_message(MessageType::Disconnect, |_| Ok(()))
            .and_then(|_| connection.flush(self.socket.as_mut(), now));
        if let Err(e) = farewell {
            warn!("{addr}: could not send DISCONNECT: {e}");
        }

        self.remove_connection(world, addr, DisconnectReason::Local)
    }

    pub fn disconnect_entity(&mut self, world: &mut World, entity: Entity, now: Instant) -> bool {
        let addr = self
            .connections
            .values()
            .find(|c| c.entity() == Some(entity))
            .map(Connection::addr);
        match addr {
            Some(addr) => self.disconnect(world, addr, now),
            None => false,
        }
    }

    pub fn disconnect_all(&mut self, world: &mut World, now: Instant) {
        let addrs: Vec<SocketAddr> = self.connections.keys().copied().collect();
        for addr in addrs {
            self.disconnect(world, addr, now);
        }
    }

    /// Drains both sockets and dispatches every packet, then queues resends
    /// for whatever is still unacknowledged. Returns the packets handled.
    pub fn receive(&mut self, world: &mut World, now: Instant) -> usize {
        let mut buffer = [0u8; MAX_PACKET_SIZE];
        let mut handled = 0;

        loop {
            match self.socket.recv_from(&mut buffer) {
                Ok(Some((len, from))) => {
                    self.handle_packet(world, from, &buffer[..len], now);
                    handled += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("receive failed: {e}");
                    break;
                }
            }
        }

        while let Some(discovery) = self.discovery.as_mut() {
            match discovery.recv_from(&mut buffer) {
                Ok(Some((len, from))) => {
                    self.handle_packet(world, from, &buffer[..len], now);
                    handled += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("discovery receive failed: {e}");
                    break;
                }
            }
        }

        for connection in self.connections.values_mut() {
            connection.queue_resends(now, self.config.min_resend_delay);
        }

        handled
    }

    fn handle_packet(&mut self, world: &mut World, from: SocketAddr, data: &[u8], now: Instant) {
        let mut reader = BufferReader::new(data);
        match PacketHeader::decode(&mut reader) {
            Ok(header) if header.is_valid() => {}
            Ok(header) => {
                warn!(
                    "{from}: dropping packet with magic {:#x} version {}",
                    header.magic, header.version
                );
                return;
            }
            Err(e) => {
                warn!("{from}: dropping packet: {e}");
                return;
            }
        }

        let known = self.connections.contains_key(&from);
        let mut connection = match self.connections.remove(&from) {
            Some(mut connection) => {
                connection.touch(now);
                connection
            }
            None => Connection::new(from, now),
        };
        connection.stats_mut().record_received(data.len());

        let connection_count = self.connections.len() + usize::from(known);
        let mut env = DispatchEnv {
            world: &mut *world,
            config: &self.config,
            role: self.role,
            now,
            connection_count,
            commands: &mut self.commands,
            events: &mut self.events,
        };
        self.dispatch
            .process(&mut env, &mut connection, known, &mut reader);

        let mut keep = known;
        let mut closed = Vec::new();
        for command in self.commands.drain(..) {
            match command {
                NetCommand::Accept => keep = true,
                NetCommand::Disconnect { addr, reason } => closed.push((addr, reason)),
            }
        }

        if keep {
            self.connections.insert(from, connection);
        } else if connection.queued_messages() > 0 {
            // Discovery replies and refusals go out before the provisional
            // connection is forgotten.
            if let Err(e) = connection.flush(self.socket.as_mut(), now) {
                warn!("{from}: reply failed: {e}");
            }
        }

        for (addr, reason) in closed {
            self.remove_connection(world, addr, reason);
        }
    }

    /// Pings, discovery probes, acks, and one packet per connection. Ends with
    /// the timeout sweep.
    pub fn send(&mut self, world: &mut World, now: Instant) {
        let ping_due = self
            .last_ping
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.ping_interval);
        if ping_due {
            self.last_ping = Some(now);
            self.send_keepalives(now);
            self.probe(now);
        }

        for connection in self.connections.values_mut() {
            if let Err(e) = connection.write_acks() {
                debug!("{}: acks deferred: {e}", connection.addr());
            }
            if let Err(e) = connection.flush(self.socket.as_mut(), now) {
                warn!("{}: send failed: {e}", connection.addr());
            }
        }

        self.update_stats(world);
        self.check_timeouts(world, now);
    }

    fn send_keepalives(&mut self, now: Instant) {
        for connection in self.connections.values_mut() {
            let addr = connection.addr();
            let sent = match connection.state() {
                ConnectionState::Connecting => {
                    connection.send_message(MessageType::Connect, |_| Ok(()))
                }
                ConnectionState::Connected if !connection.ping_outstanding() => connection
                    .send_message(MessageType::Ping, |w| {
                        w.write_bool(true);
                        Ok(())
                    })
                    .inspect(|_| connection.mark_ping_sent(now)),
                ConnectionState::Connected => continue,
            };
            if let Err(e) = sent {
                debug!("{addr}: keepalive deferred: {e}");
            }
        }
    }

    fn probe(&mut self, now: Instant) {
        let Some(target) = self.discovery_target else {
            return;
        };
        if self.connections.values().any(Connection::is_connected) {
            return;
        }

        let mut probe = Connection::new(target, now);
        let sent = probe
            .send_message(MessageType::DiscoverServer, |w| {
                w.write_bytes(&DISCOVER_SIGNATURE);
                Ok(())
            })
            .and_then(|_| probe.flush(self.socket.as_mut(), now));
        match sent {
            Ok(_) => trace!("discovery probe sent to {target}"),
            Err(e) => debug!("discovery probe to {target} failed: {e}"),
        }
    }

    fn update_stats(&self, world: &mut World) {
        for connection in self.connections.values() {
            let Some(entity) = connection.entity() else {
                continue;
            };
            if let Some(stats) = world.get_mut::<NetworkStatsComponent>(entity) {
                stats.ping_ms = connection.ping_ms().unwrap_or(0.0);
                stats.jitter_ms = connection.jitter_ms();
                stats.unacked = connection.unacked_count();
            }
        }
    }

    fn check_timeouts(&mut self, world: &mut World, now: Instant) {
        let expired: Vec<SocketAddr> = self
            .connections
            .values()
            .filter(|c| c.is_timed_out(now, self.config.timeout))
            .map(Connection::addr)
            .collect();

        for addr in expired {
            self.remove_connection(world, addr, DisconnectReason::Timeout);
        }
    }

    /// Drops a connection and what it owned in the world: the player entity on
    /// the server, every replicated entity on the client.
    fn remove_connection(
        &mut self,
        world: &mut World,
        addr: SocketAddr,
        reason: DisconnectReason,
    ) -> bool {
        let Some(mut connection) = self.connections.remove(&addr) else {
            return false;
        };
        let entity = connection.entity();

        match self.role {
            Role::Server => {
                if let Some(entity) = entity {
                    world.destroy(entity);
                }
            }
            Role::Client => {
                for local in connection.take_remote_entities().into_values() {
                    world.destroy(local);
                }
                if let Some(entity) = entity {
                    world.destroy(entity);
                }
            }
        }

        info!("{addr} disconnected: {reason}");
        self.events.push_back(NetEvent::Disconnected {
            addr,
            entity,
            reason,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::net::socket::LoopbackNetwork;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn garbage_datagrams_create_no_connection() {
        let network = LoopbackNetwork::new();
        let mut server = NetworkingSystem::server(NetConfig::default(), network.bind(addr(1)));
        let mut stray = network.bind(addr(2));
        let mut world = World::default();

        stray.send_to(&[0xde, 0xad, 0xbe, 0xef, 0x00, 1, 2], addr(1)).unwrap();
        stray.send_to(&[1, 2], addr(1)).unwrap();

        assert_eq!(server.receive(&mut world, Instant::now()), 2);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn connecting_client_times_out() {
        let network = LoopbackNetwork::new();
        let mut world = World::default();
        let mut client = NetworkingSystem::client(NetConfig::default(), network.bind(addr(3)));

        let start = Instant::now();
        client.connect(addr(4), start).unwrap();
        assert_eq!(client.connection_count(), 1);

        client.send(&mut world, start + Duration::from_secs(6));
        assert_eq!(client.connection_count(), 0);
        let events: Vec<NetEvent> = client.drain_events().collect();
        assert!(matches!(
            events.as_slice(),
            [NetEvent::Disconnected {
                reason: DisconnectReason::Timeout,
                ..
            }]
        ));
    }
}
