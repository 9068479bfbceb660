use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use super::error::SendError;
use super::protocol::{
    Channel, MAX_PACKET_SIZE, MESSAGE_HEADER_SIZE, MessageHeader, MessageType, PACKET_HEADER_SIZE,
    PacketHeader, Sequence,
};
use super::socket::Socket;
use super::stats::NetworkStats;
use super::tracking::{AckData, ChannelState, HeldMessage, ReceiveStatus};
use super::wire::{BufferWriter, WireError};
use crate::ecs::Entity;

/// Room kept free in every packet for the per-channel `ACK` messages.
pub const ACK_RESERVE: usize = Channel::TRACKED.len() * (MESSAGE_HEADER_SIZE + 11);

const RTT_ALPHA: f32 = 0.125;
const JITTER_BETA: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
}

/// What the receive side decided about one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Deliver,
    /// Ordered message ahead of a gap; kept until the gap fills.
    Held,
    Duplicate,
    TooOld,
}

/// One remote peer: per-channel sequencing, the packet being assembled for it,
/// and liveness and latency estimates.
#[derive(Debug)]
pub struct Connection {
    addr: SocketAddr,
    state: ConnectionState,
    channels: [ChannelState; 2],
    unreliable_sequence: Sequence,
    outgoing: Vec<u8>,
    queued: Vec<(usize, Sequence)>,
    message_count: usize,
    entity: Option<Entity>,
    remote_entities: HashMap<u64, Entity>,
    last_message_time: Instant,
    ping_ms: Option<f32>,
    jitter_ms: f32,
    ping_sent_at: Option<Instant>,
    stats: NetworkStats,
}

impl Connection {
    pub fn new(addr: SocketAddr, now: Instant) -> Self {
        let mut outgoing = Vec::with_capacity(MAX_PACKET_SIZE);
        PacketHeader::default().encode(&mut outgoing);

        Self {
            addr,
            state: ConnectionState::Connecting,
            channels: Channel::TRACKED.map(ChannelState::new),
            unreliable_sequence: 0,
            outgoing,
            queued: Vec::new(),
            message_count: 0,
            entity: None,
            remote_entities: HashMap::new(),
            last_message_time: now,
            ping_ms: None,
            jitter_ms: 0.0,
            ping_sent_at: None,
            stats: NetworkStats::default(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// The local entity this peer is associated with: the player on the
    /// server, the own player on the client.
    pub fn entity(&self) -> Option<Entity> {
        self.entity
    }

    pub fn set_entity(&mut self, entity: Option<Entity>) {
        self.entity = entity;
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_message_time = now;
    }

    pub fn last_message_time(&self) -> Instant {
        self.last_message_time
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_message_time) > timeout
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut NetworkStats {
        &mut self.stats
    }

    pub fn ping_ms(&self) -> Option<f32> {
        self.ping_ms
    }

    pub fn jitter_ms(&self) -> f32 {
        self.jitter_ms
    }

    pub(crate) fn mark_ping_sent(&mut self, now: Instant) {
        self.ping_sent_at = Some(now);
    }

    pub(crate) fn ping_outstanding(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// Closes the outstanding ping, if any, and folds its round trip into the
    /// smoothed estimates.
    pub(crate) fn complete_ping(&mut self, now: Instant) -> Option<Duration> {
        let sent = self.ping_sent_at.take()?;
        let rtt = now.saturating_duration_since(sent);
        self.record_rtt(rtt);
        Some(rtt)
    }

    pub fn record_rtt(&mut self, rtt: Duration) {
        let sample = rtt.as_secs_f32() * 1000.0;
        match self.ping_ms {
            None => {
                self.ping_ms = Some(sample);
                self.jitter_ms = sample / 2.0;
            }
            Some(ping) => {
                self.jitter_ms =
                    (1.0 - JITTER_BETA) * self.jitter_ms + JITTER_BETA * (ping - sample).abs();
                self.ping_ms = Some((1.0 - RTT_ALPHA) * ping + RTT_ALPHA * sample);
            }
        }
    }

    /// How long an unacknowledged message waits before it is sent again.
    pub fn resend_delay(&self, min: Duration) -> Duration {
        match self.ping_ms {
            Some(ping) => min.max(Duration::from_secs_f32(ping * 2.0 / 1000.0)),
            None => min,
        }
    }

    pub fn channel(&self, channel: Channel) -> Option<&ChannelState> {
        channel.tracked_index().map(|i| &self.channels[i])
    }

    pub fn unacked_count(&self) -> usize {
        self.channels.iter().map(|c| c.send.unacked_count()).sum()
    }

    pub fn packet_len(&self) -> usize {
        self.outgoing.len()
    }

    pub fn queued_messages(&self) -> usize {
        self.message_count
    }

    /// The packet as it would be sent right now.
    pub fn pending_packet(&self) -> &[u8] {
        &self.outgoing
    }

    fn capacity_for(ty: MessageType) -> usize {
        if ty == MessageType::Ack {
            MAX_PACKET_SIZE
        } else {
            MAX_PACKET_SIZE - ACK_RESERVE
        }
    }

    /// Payload bytes a message of this type could still carry in the current packet.
    pub fn available(&self, ty: MessageType) -> usize {
        Self::capacity_for(ty).saturating_sub(self.outgoing.len() + MESSAGE_HEADER_SIZE)
    }

    /// Reserves a message on the type's declared channel. Fails if the packet
    /// cannot hold the type's minimum payload or the channel has a full window
    /// in flight; the caller retries on a later tick.
    pub fn begin_message(&mut self, ty: MessageType) -> Result<MessageBuilder<'_>, SendError> {
        let has_room = ty
            .channel()
            .tracked_index()
            .is_none_or(|i| self.channels[i].send.has_room());
        if !has_room {
            return Err(SendError::Window { ty });
        }

        let capacity = Self::capacity_for(ty);
        if self.outgoing.len() + MESSAGE_HEADER_SIZE > capacity
            || self.available(ty) < ty.min_size()
        {
            return Err(SendError::Full {
                ty,
                needed: MESSAGE_HEADER_SIZE + ty.min_size(),
                available: capacity.saturating_sub(self.outgoing.len()),
            });
        }

        Ok(MessageBuilder {
            connection: self,
            ty,
            writer: BufferWriter::with_capacity(ty.min_size()),
        })
    }

    /// `begin_message`, fill, `end` in one call.
    pub fn send_message<F>(&mut self, ty: MessageType, fill: F) -> Result<Sequence, SendError>
    where
        F: FnOnce(&mut BufferWriter) -> Result<(), WireError>,
    {
        let mut message = self.begin_message(ty)?;
        fill(&mut message.writer).map_err(|source| SendError::Encode { ty, source })?;
        message.end()
    }

    fn commit(&mut self, ty: MessageType, payload: Vec<u8>) -> Sequence {
        let channel = ty.channel();
        let sequence = match channel.tracked_index() {
            Some(i) => {
                let sequence = self.channels[i].send.push(ty, payload.clone());
                self.queued.push((i, sequence));
                sequence
            }
            None => {
                let sequence = self.unreliable_sequence;
                self.unreliable_sequence = sequence.wrapping_add(1);
                sequence
            }
        };
        self.append(ty, channel, sequence, &payload);
        sequence
    }

    fn append(&mut self, ty: MessageType, channel: Channel, sequence: Sequence, payload: &[u8]) {
        MessageHeader {
            ty,
            channel,
            sequence,
            size: payload.len() as u16,
        }
        .encode(&mut self.outgoing);
        self.outgoing.extend_from_slice(payload);
        self.message_count += 1;
    }

    /// One `ACK` per tracked channel that has heard from the peer.
    pub fn write_acks(&mut self) -> Result<(), SendError> {
        for i in 0..self.channels.len() {
            if !self.channels[i].recv.has_received() {
                continue;
            }
            let channel = self.channels[i].channel;
            let ack = self.channels[i].recv.ack_data();
            self.send_message(MessageType::Ack, |w| {
                w.write_u8(channel as u8);
                w.write_u16(ack.next_expected);
                w.write_u64(ack.bitmask);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Copies unacknowledged messages whose resend delay has passed into the
    /// current packet, oldest first, until it is full. Returns how many went in.
    pub fn queue_resends(&mut self, now: Instant, min_delay: Duration) -> usize {
        let delay = self.resend_delay(min_delay);
        let capacity = Self::capacity_for(MessageType::Unknown);
        let mut resent = 0;

        'channels: for i in 0..self.channels.len() {
            let channel = self.channels[i].channel;
            for sequence in self.channels[i].send.due_for_resend(now, delay) {
                if self.queued.contains(&(i, sequence)) {
                    continue;
                }
                let Some(pending) = self.channels[i].send.get(sequence) else {
                    continue;
                };
                if self.outgoing.len() + MESSAGE_HEADER_SIZE + pending.payload.len() > capacity {
                    break 'channels;
                }
                let ty = pending.ty;
                let payload = pending.payload.clone();
                self.append(ty, channel, sequence, &payload);
                self.queued.push((i, sequence));
                resent += 1;
            }
        }

        self.stats.messages_resent += resent as u64;
        resent
    }

    /// Sends the current packet if it holds any message and starts a new one.
    /// Tracked messages are stamped as sent either way; a failed send is a
    /// lost packet and the resend path covers it.
    pub fn flush(&mut self, socket: &mut dyn Socket, now: Instant) -> Result<usize, SendError> {
        if self.message_count == 0 {
            return Ok(0);
        }

        let result = socket.send_to(&self.outgoing, self.addr);

        for (i, sequence) in self.queued.drain(..) {
            self.channels[i].send.mark_sent(sequence, now);
        }
        self.outgoing.truncate(PACKET_HEADER_SIZE);
        self.message_count = 0;

        let bytes = result?;
        self.stats.record_sent(bytes);
        Ok(bytes)
    }

    /// Runs the receive-side channel bookkeeping for one inbound message.
    pub(crate) fn record_inbound(&mut self, header: &MessageHeader, payload: &[u8]) -> Inbound {
        let Some(i) = header.channel.tracked_index() else {
            return Inbound::Deliver;
        };
        let state = &mut self.channels[i];

        match state.recv.record_received(header.sequence) {
            ReceiveStatus::Duplicate => return Inbound::Duplicate,
            ReceiveStatus::TooOld => return Inbound::TooOld,
            ReceiveStatus::Fresh => {}
        }

        if header.channel != Channel::Ordered {
            return Inbound::Deliver;
        }

        if state.ordered.is_next(header.sequence) {
            state.ordered.advance();
            Inbound::Deliver
        } else {
            state.ordered.hold(HeldMessage {
                sequence: header.sequence,
                ty: header.ty,
                payload: payload.to_vec(),
            });
            Inbound::Held
        }
    }

    /// Next held ordered message whose turn has come.
    pub(crate) fn take_ready_ordered(&mut self) -> Option<HeldMessage> {
        let i = Channel::Ordered.tracked_index()?;
        self.channels[i].ordered.take_ready()
    }

    pub fn apply_ack(&mut self, channel: Channel, ack: AckData) -> usize {
        match channel.tracked_index() {
            Some(i) => self.channels[i].send.apply_ack(ack),
            None => 0,
        }
    }

    pub fn local_for(&self, remote: u64) -> Option<Entity> {
        self.remote_entities.get(&remote).copied()
    }

    pub fn map_remote(&mut self, remote: u64, local: Entity) {
        self.remote_entities.insert(remote, local);
    }

    pub fn unmap_remote(&mut self, remote: u64) -> Option<Entity> {
        self.remote_entities.remove(&remote)
    }

    pub fn remote_entities(&self) -> impl Iterator<Item = (u64, Entity)> + '_ {
        self.remote_entities.iter().map(|(&r, &l)| (r, l))
    }

    pub(crate) fn take_remote_entities(&mut self) -> HashMap<u64, Entity> {
        std::mem::take(&mut self.remote_entities)
    }
}

/// A reserved message. Write the payload through it, then `end` to commit;
/// dropping it discards the message.
#[must_use = "the message is discarded unless `end` is called"]
pub struct MessageBuilder<'a> {
    connection: &'a mut Connection,
    ty: MessageType,
    writer: BufferWriter,
}

impl MessageBuilder<'_> {
    pub fn message_type(&self) -> MessageType {
        self.ty
    }

    /// Commits the message to the current packet and returns its sequence.
    pub fn end(self) -> Result<Sequence, SendError> {
        let size = self.writer.len();
        let capacity = Connection::capacity_for(self.ty);
        let largest = capacity - PACKET_HEADER_SIZE - MESSAGE_HEADER_SIZE;
        if size > largest {
            return Err(SendError::PayloadTooLarge { ty: self.ty, size });
        }

        let available = self.connection.available(self.ty);
        if size > available {
            return Err(SendError::Full {
                ty: self.ty,
                needed: MESSAGE_HEADER_SIZE + size,
                available: available + MESSAGE_HEADER_SIZE,
            });
        }

        Ok(self.connection.commit(self.ty, self.writer.into_inner()))
    }
}

impl Deref for MessageBuilder<'_> {
    type Target = BufferWriter;

    fn deref(&self) -> &Self::Target {
        &self.writer
    }
}

impl DerefMut for MessageBuilder<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.writer
    }
}
