use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use log::{debug, trace, warn};

use super::config::NetConfig;
use super::connection::{Connection, Inbound};
use super::event::{NetCommand, NetEvent};
use super::protocol::{Channel, MESSAGE_HEADER_SIZE, MessageHeader, MessageType};
use super::wire::{BufferReader, WireError};
use crate::ecs::{Entity, World};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Everything a handler may touch while processing one message.
pub struct MessageContext<'a> {
    pub connection: &'a mut Connection,
    pub header: MessageHeader,
    /// The connection's local entity, if it has one yet.
    pub entity: Option<Entity>,
    pub world: &'a mut World,
    pub config: &'a NetConfig,
    pub role: Role,
    pub now: Instant,
    pub connection_count: usize,
    commands: &'a mut Vec<NetCommand>,
    events: &'a mut VecDeque<NetEvent>,
}

impl MessageContext<'_> {
    pub fn command(&mut self, command: NetCommand) {
        self.commands.push(command);
    }

    pub fn emit(&mut self, event: NetEvent) {
        self.events.push_back(event);
    }
}

/// Payload handler for one message type. Runs only after the channel layer has
/// accepted the message, and only ever sees that message's payload bytes.
pub trait MessageHandler {
    fn handle(
        &mut self,
        ctx: &mut MessageContext<'_>,
        reader: &mut BufferReader<'_>,
    ) -> Result<(), WireError>;
}

impl<F> MessageHandler for F
where
    F: FnMut(&mut MessageContext<'_>, &mut BufferReader<'_>) -> Result<(), WireError>,
{
    fn handle(
        &mut self,
        ctx: &mut MessageContext<'_>,
        reader: &mut BufferReader<'_>,
    ) -> Result<(), WireError> {
        self(ctx, reader)
    }
}

/// Shared state the table needs while working through a packet.
pub(crate) struct DispatchEnv<'a> {
    pub world: &'a mut World,
    pub config: &'a NetConfig,
    pub role: Role,
    pub now: Instant,
    pub connection_count: usize,
    pub commands: &'a mut Vec<NetCommand>,
    pub events: &'a mut VecDeque<NetEvent>,
}

#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<MessageType, Box<dyn MessageHandler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a handler, returning the one it replaces.
    pub fn register<H>(&mut self, ty: MessageType, handler: H) -> Option<Box<dyn MessageHandler>>
    where
        H: MessageHandler + 'static,
    {
        self.handlers.insert(ty, Box::new(handler))
    }

    /// `register` for closures, which need the signature spelled out to be
    /// accepted for every borrow lifetime.
    pub fn register_fn<F>(&mut self, ty: MessageType, handler: F) -> Option<Box<dyn MessageHandler>>
    where
        F: FnMut(&mut MessageContext<'_>, &mut BufferReader<'_>) -> Result<(), WireError> + 'static,
    {
        self.register(ty, handler)
    }

    pub fn contains(&self, ty: MessageType) -> bool {
        self.handlers.contains_key(&ty)
    }

    /// Walks every message in a packet. Framing is validated here, then the
    /// channel layer filters duplicates and holds ordered messages back, and
    /// only then does a handler run. A bad message never misaligns the rest
    /// of the packet: the cursor always moves by the declared size.
    pub(crate) fn process(
        &mut self,
        env: &mut DispatchEnv<'_>,
        connection: &mut Connection,
        known: bool,
        reader: &mut BufferReader<'_>,
    ) {
        let from = connection.addr();

        while !reader.is_exhausted() {
            let Some((tag, channel_tag, sequence, payload)) = read_frame(reader) else {
                warn!(
                    "{from}: truncated message at byte {}, dropping rest of packet",
                    reader.position()
                );
                return;
            };

            let Ok(ty) = MessageType::try_from(tag) else {
                warn!("{from}: unknown message type {tag}, skipped {} bytes", payload.len());
                continue;
            };
            let Ok(channel) = Channel::try_from(channel_tag) else {
                warn!("{from}: {ty} on unknown channel {channel_tag}");
                continue;
            };
            if channel != ty.channel() {
                warn!("{from}: {ty} arrived on {channel:?}, expected {:?}", ty.channel());
                continue;
            }
            if !known && !ty.is_pre_handshake() {
                debug!("{from}: {ty} from unconnected peer ignored");
                continue;
            }

            let header = MessageHeader {
                ty,
                channel,
                sequence,
                size: payload.len() as u16,
            };

            match connection.record_inbound(&header, payload) {
                Inbound::Deliver => {}
                Inbound::Held => {
                    trace!("{from}: holding {ty} #{sequence} for an earlier gap");
                    continue;
                }
                Inbound::Duplicate | Inbound::TooOld => {
                    trace!("{from}: dropping stale {ty} #{sequence}");
                    connection.stats_mut().messages_dropped += 1;
                    continue;
                }
            }

            self.deliver(env, connection, header, payload);

            if channel == Channel::Ordered {
                while let Some(held) = connection.take_ready_ordered() {
                    let header = MessageHeader {
                        ty: held.ty,
                        channel,
                        sequence: held.sequence,
                        size: held.payload.len() as u16,
                    };
                    self.deliver(env, connection, header, &held.payload);
                }
            }
        }
    }

    fn deliver(
        &mut self,
        env: &mut DispatchEnv<'_>,
        connection: &mut Connection,
        header: MessageHeader,
        payload: &[u8],
    ) {
        let ty = header.ty;
        let from = connection.addr();

        if payload.len() < ty.min_size() {
            warn!(
                "{from}: {ty} payload of {} bytes is shorter than {}",
                payload.len(),
                ty.min_size()
            );
            return;
        }

        let Some(handler) = self.handlers.get_mut(&ty) else {
            warn!("{from}: no handler for {ty}, skipped {} bytes", payload.len());
            return;
        };

        let entity = connection.entity();
        let mut ctx = MessageContext {
            connection,
            header,
            entity,
            world: &mut *env.world,
            config: env.config,
            role: env.role,
            now: env.now,
            connection_count: env.connection_count,
            commands: &mut *env.commands,
            events: &mut *env.events,
        };
        let mut reader = BufferReader::new(payload);

        match handler.handle(&mut ctx, &mut reader) {
            Err(e) => warn!("{from}: malformed {ty}: {e}"),
            Ok(()) if cfg!(debug_assertions) && !reader.is_exhausted() => warn!(
                "{from}: {ty} handler consumed {} of {} bytes",
                reader.position(),
                payload.len()
            ),
            Ok(()) => {}
        }
    }
}

/// Splits one `[header][payload]` frame off the packet.
fn read_frame<'a>(reader: &mut BufferReader<'a>) -> Option<(u8, u8, u16, &'a [u8])> {
    if reader.remaining() < MESSAGE_HEADER_SIZE {
        return None;
    }
    let tag = reader.read_u8().ok()?;
    let channel = reader.read_u8().ok()?;
    let sequence = reader.read_u16().ok()?;
    let size = reader.read_u16().ok()? as usize;
    let payload = reader.read_bytes(size).ok()?;
    Some((tag, channel, sequence, payload))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::net::SocketAddr;
    use std::rc::Rc;

    use super::*;
    use crate::net::protocol::Sequence;

    fn frame(out: &mut Vec<u8>, ty: u8, channel: Channel, sequence: Sequence, payload: &[u8]) {
        out.push(ty);
        out.push(channel as u8);
        out.extend_from_slice(&sequence.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(payload);
    }

    struct Harness {
        world: World,
        config: NetConfig,
        commands: Vec<NetCommand>,
        events: VecDeque<NetEvent>,
        connection: Connection,
    }

    impl Harness {
        fn new() -> Self {
            let addr = SocketAddr::from(([127, 0, 0, 1], 9000));
            Self {
                world: World::default(),
                config: NetConfig::default(),
                commands: Vec::new(),
                events: VecDeque::new(),
                connection: Connection::new(addr, Instant::now()),
            }
        }

        fn run(&mut self, table: &mut DispatchTable, packet: &[u8]) {
            let mut env = DispatchEnv {
                world: &mut self.world,
                config: &self.config,
                role: Role::Client,
                now: Instant::now(),
                connection_count: 1,
                commands: &mut self.commands,
                events: &mut self.events,
            };
            let mut reader = BufferReader::new(packet);
            table.process(&mut env, &mut self.connection, true, &mut reader);
        }
    }

    fn recording_table(log: &Rc<RefCell<Vec<(MessageType, u8)>>>) -> DispatchTable {
        let mut table = DispatchTable::new();
        for ty in [MessageType::Test, MessageType::EcsEntCreate, MessageType::Ping] {
            let log = Rc::clone(log);
            table.register_fn(ty, move |ctx, reader| {
                let first = reader.read_u8()?;
                reader.skip(reader.remaining())?;
                log.borrow_mut().push((ctx.header.ty, first));
                Ok(())
            });
        }
        table
    }

    #[test]
    fn bad_message_does_not_misalign_the_packet() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut table = recording_table(&log);
        let mut harness = Harness::new();

        let mut packet = Vec::new();
        frame(&mut packet, 200, Channel::Unreliable, 0, &[9, 9, 9]);
        frame(&mut packet, MessageType::Test as u8, Channel::Unreliable, 0, &[1, 2]);
        frame(&mut packet, MessageType::Disconnect as u8, Channel::Unreliable, 1, &[]);
        frame(&mut packet, MessageType::Test as u8, Channel::Unreliable, 2, &[3]);
        harness.run(&mut table, &packet);

        assert_eq!(
            *log.borrow(),
            vec![(MessageType::Test, 1), (MessageType::Test, 3)]
        );
    }

    #[test]
    fn ordered_messages_reach_handlers_in_sequence() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut table = recording_table(&log);
        let mut harness = Harness::new();

        for sequence in [2u16, 0, 2, 1, 3] {
            let mut packet = Vec::new();
            frame(
                &mut packet,
                MessageType::EcsEntCreate as u8,
                Channel::Ordered,
                sequence,
                &[sequence as u8, 0, 0, 0, 0, 0, 0, 0],
            );
            harness.run(&mut table, &packet);
        }

        let order: Vec<u8> = log.borrow().iter().map(|&(_, n)| n).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn reliable_messages_skip_the_gap_wait() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut table = recording_table(&log);
        let mut harness = Harness::new();

        for sequence in [1u16, 0, 1, 3] {
            let mut packet = Vec::new();
            frame(
                &mut packet,
                MessageType::Ping as u8,
                Channel::Reliable,
                sequence,
                &[sequence as u8],
            );
            harness.run(&mut table, &packet);
        }

        let order: Vec<u8> = log.borrow().iter().map(|&(_, n)| n).collect();
        assert_eq!(order, vec![1, 0, 3]);
        assert_eq!(harness.connection.stats().messages_dropped, 1);
    }

    #[test]
    fn truncated_frame_stops_processing() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut table = recording_table(&log);
        let mut harness = Harness::new();

        let mut packet = Vec::new();
        frame(&mut packet, MessageType::Test as u8, Channel::Unreliable, 0, &[5]);
        frame(&mut packet, MessageType::Test as u8, Channel::Unreliable, 1, &[6, 6, 6, 6]);
        packet.truncate(packet.len() - 2);
        harness.run(&mut table, &packet);

        assert_eq!(*log.borrow(), vec![(MessageType::Test, 5)]);
    }

    #[test]
    fn messages_on_the_wrong_channel_are_rejected() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut table = recording_table(&log);
        let mut harness = Harness::new();

        let mut packet = Vec::new();
        frame(&mut packet, MessageType::EcsEntCreate as u8, Channel::Unreliable, 0, &[1; 8]);
        harness.run(&mut table, &packet);

        assert!(log.borrow().is_empty());
    }
}
