use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::protocol::{Channel, MessageType, Sequence, sequence_diff};

/// Width of the receive bitmask, and so the most messages a tracked channel
/// may have in flight at once.
pub const ACK_WINDOW: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    Fresh,
    Duplicate,
    TooOld,
}

/// Acknowledgement snapshot for one channel: bit `i` of `bitmask` confirms
/// sequence `next_expected - 1 - i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckData {
    pub next_expected: Sequence,
    pub bitmask: u64,
}

impl AckData {
    pub fn highest(&self) -> Sequence {
        self.next_expected.wrapping_sub(1)
    }

    pub fn confirms(&self, sequence: Sequence) -> bool {
        let back = sequence_diff(self.highest(), sequence);
        (0..ACK_WINDOW as i32).contains(&back) && self.bitmask & (1u64 << back) != 0
    }
}

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub sequence: Sequence,
    pub ty: MessageType,
    pub payload: Vec<u8>,
    pub last_send: Option<Instant>,
    pub send_count: u32,
}

#[derive(Debug)]
pub struct SendTracker {
    next_sequence: Sequence,
    pending: VecDeque<PendingMessage>,
}

impl Default for SendTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SendTracker {
    pub fn new() -> Self {
        Self {
            next_sequence: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn next_sequence(&self) -> Sequence {
        self.next_sequence
    }

    /// False once the oldest unacknowledged message is a full window behind.
    pub fn has_room(&self) -> bool {
        match self.pending.front() {
            Some(oldest) => sequence_diff(self.next_sequence, oldest.sequence) < ACK_WINDOW as i32,
            None => true,
        }
    }

    /// Assigns the next sequence number and keeps the payload until acknowledged.
    pub fn push(&mut self, ty: MessageType, payload: Vec<u8>) -> Sequence {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.pending.push_back(PendingMessage {
            sequence,
            ty,
            payload,
            last_send: None,
            send_count: 0,
        });
        sequence
    }

    /// Drops every pending message the ack confirms. Returns how many went.
    pub fn apply_ack(&mut self, ack: AckData) -> usize {
        let before = self.pending.len();
        self.pending.retain(|p| !ack.confirms(p.sequence));
        before - self.pending.len()
    }

    pub fn mark_sent(&mut self, sequence: Sequence, now: Instant) {
        if let Some(message) = self.pending.iter_mut().find(|p| p.sequence == sequence) {
            message.last_send = Some(now);
            message.send_count += 1;
        }
    }

    /// Sequences that went out at least `delay` ago without an ack, oldest first.
    pub fn due_for_resend(&self, now: Instant, delay: Duration) -> Vec<Sequence> {
        self.pending
            .iter()
            .filter(|p| p.last_send.is_some_and(|t| now.duration_since(t) >= delay))
            .map(|p| p.sequence)
            .collect()
    }

    pub fn get(&self, sequence: Sequence) -> Option<&PendingMessage> {
        self.pending.iter().find(|p| p.sequence == sequence)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingMessage> {
        self.pending.iter()
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug)]
pub struct ReceiveTracker {
    highest: Sequence,
    mask: u64,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        // Peers start counting at 0, so pretend the message before it was the newest.
        Self {
            highest: Sequence::MAX,
            mask: 0,
        }
    }

    pub fn record_received(&mut self, sequence: Sequence) -> ReceiveStatus {
        let diff = sequence_diff(sequence, self.highest);
        if diff > 0 {
            let shift = diff as u32;
            self.mask = if shift >= ACK_WINDOW {
                0
            } else {
                self.mask << shift
            };
            self.mask |= 1;
            self.highest = sequence;
            return ReceiveStatus::Fresh;
        }

        let back = (-diff) as u32;
        if back >= ACK_WINDOW {
            ReceiveStatus::TooOld
        } else if self.mask & (1u64 << back) != 0 {
            ReceiveStatus::Duplicate
        } else {
            self.mask |= 1u64 << back;
            ReceiveStatus::Fresh
        }
    }

    pub fn has_received(&self) -> bool {
        self.mask != 0
    }

    pub fn ack_data(&self) -> AckData {
        AckData {
            next_expected: self.highest.wrapping_add(1),
            bitmask: self.mask,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeldMessage {
    pub sequence: Sequence,
    pub ty: MessageType,
    pub payload: Vec<u8>,
}

/// Gap buffer for the ordered channel.
#[derive(Debug, Default)]
pub struct OrderedBuffer {
    next_deliver: Sequence,
    held: HashMap<Sequence, HeldMessage>,
}

impl OrderedBuffer {
    pub fn next_deliver(&self) -> Sequence {
        self.next_deliver
    }

    pub fn is_next(&self, sequence: Sequence) -> bool {
        sequence == self.next_deliver
    }

    pub fn advance(&mut self) {
        self.next_deliver = self.next_deliver.wrapping_add(1);
    }

    pub fn hold(&mut self, message: HeldMessage) {
        self.held.insert(message.sequence, message);
    }

    /// Pops the held message that is next in line, advancing past it.
    pub fn take_ready(&mut self) -> Option<HeldMessage> {
        let message = self.held.remove(&self.next_deliver)?;
        self.advance();
        Some(message)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

/// Send and receive bookkeeping for one tracked channel of one connection.
#[derive(Debug)]
pub struct ChannelState {
    pub channel: Channel,
    pub send: SendTracker,
    pub recv: ReceiveTracker,
    pub ordered: OrderedBuffer,
}

impl ChannelState {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            send: SendTracker::new(),
            recv: ReceiveTracker::new(),
            ordered: OrderedBuffer::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack_from(tracker: &ReceiveTracker) -> AckData {
        tracker.ack_data()
    }

    #[test]
    fn test_receive_tracker_bitfield() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(0);
        tracker.record_received(1);
        tracker.record_received(2);

        let ack = tracker.ack_data();
        assert_eq!(ack.next_expected, 3);
        assert_eq!(ack.bitmask & 0b111, 0b111);
    }

    #[test]
    fn test_receive_tracker_out_of_order() {
        let mut tracker = ReceiveTracker::new();

        assert_eq!(tracker.record_received(2), ReceiveStatus::Fresh);
        assert_eq!(tracker.record_received(0), ReceiveStatus::Fresh);
        assert_eq!(tracker.record_received(1), ReceiveStatus::Fresh);

        let ack = tracker.ack_data();
        assert_eq!(ack.next_expected, 3);
        assert_eq!(ack.bitmask, 0b111);
    }

    #[test]
    fn test_duplicate_detection() {
        let mut tracker = ReceiveTracker::new();

        assert_eq!(tracker.record_received(0), ReceiveStatus::Fresh);
        assert_eq!(tracker.record_received(0), ReceiveStatus::Duplicate);
        assert_eq!(tracker.record_received(1), ReceiveStatus::Fresh);
    }

    #[test]
    fn test_out_of_window_rejected() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(100);
        assert_eq!(tracker.record_received(36), ReceiveStatus::TooOld);
        assert_eq!(tracker.record_received(37), ReceiveStatus::Fresh);
    }

    #[test]
    fn test_window_slides_across_wraparound() {
        let mut tracker = ReceiveTracker::new();
        let mut sender = SendTracker::new();

        // Walk both sides to just before the wrap.
        for _ in 0..(u16::MAX as u32 - 2) {
            let seq = sender.push(MessageType::Ping, Vec::new());
            tracker.record_received(seq);
            sender.apply_ack(ack_from(&tracker));
        }
        assert_eq!(sender.unacked_count(), 0);

        let a = sender.push(MessageType::Ping, Vec::new());
        let b = sender.push(MessageType::Ping, Vec::new());
        let c = sender.push(MessageType::Ping, Vec::new());
        let d = sender.push(MessageType::Ping, Vec::new());
        assert_eq!((a, b, c, d), (65533, 65534, 65535, 0));

        assert_eq!(tracker.record_received(d), ReceiveStatus::Fresh);
        assert_eq!(tracker.record_received(b), ReceiveStatus::Fresh);
        assert_eq!(tracker.record_received(d), ReceiveStatus::Duplicate);

        assert_eq!(sender.apply_ack(tracker.ack_data()), 2);
        let left: Vec<Sequence> = sender.pending().map(|p| p.sequence).collect();
        assert_eq!(left, vec![a, c]);
    }

    #[test]
    fn test_apply_ack_is_idempotent() {
        let mut sender = SendTracker::new();
        let mut receiver = ReceiveTracker::new();
        for i in 0..10u16 {
            let seq = sender.push(MessageType::EcsEntCreate, vec![i as u8]);
            if i % 3 != 0 {
                receiver.record_received(seq);
            }
        }

        let ack = receiver.ack_data();
        sender.apply_ack(ack);
        let once: Vec<Sequence> = sender.pending().map(|p| p.sequence).collect();
        sender.apply_ack(ack);
        let twice: Vec<Sequence> = sender.pending().map(|p| p.sequence).collect();

        assert_eq!(once, vec![0, 3, 6, 9]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unacked_messages_are_resent_not_lost() {
        let start = Instant::now();
        let delay = Duration::from_millis(100);
        let mut sender = SendTracker::new();

        let lost = sender.push(MessageType::Ping, vec![1]);
        let delivered = sender.push(MessageType::Ping, vec![0]);
        sender.mark_sent(lost, start);
        sender.mark_sent(delivered, start);

        let mut receiver = ReceiveTracker::new();
        receiver.record_received(delivered);
        sender.apply_ack(receiver.ack_data());

        assert!(sender.due_for_resend(start, delay).is_empty());
        let due = sender.due_for_resend(start + delay, delay);
        assert_eq!(due, vec![lost]);
        assert_eq!(sender.get(lost).unwrap().payload, vec![1]);
    }

    #[test]
    fn test_send_window_limits_in_flight() {
        let mut sender = SendTracker::new();
        for _ in 0..ACK_WINDOW {
            assert!(sender.has_room());
            sender.push(MessageType::EcsFlag, Vec::new());
        }
        assert!(!sender.has_room());

        let mut receiver = ReceiveTracker::new();
        receiver.record_received(0);
        sender.apply_ack(receiver.ack_data());
        assert!(sender.has_room());
    }

    #[test]
    fn test_ordered_buffer_releases_in_sequence() {
        let mut buffer = OrderedBuffer::default();
        for seq in [2u16, 1] {
            buffer.hold(HeldMessage {
                sequence: seq,
                ty: MessageType::Test,
                payload: vec![seq as u8],
            });
        }
        assert!(buffer.take_ready().is_none());

        assert!(buffer.is_next(0));
        buffer.advance();
        let released: Vec<Sequence> = std::iter::from_fn(|| buffer.take_ready())
            .map(|m| m.sequence)
            .collect();
        assert_eq!(released, vec![1, 2]);
        assert_eq!(buffer.next_deliver(), 3);
    }

    #[test]
    fn test_ordered_delivery_across_wraparound() {
        let mut state = ChannelState::new(Channel::Ordered);
        state.recv.highest = 65533;
        state.recv.mask = 1;
        state.ordered.next_deliver = 65534;

        let mut delivered = Vec::new();
        for seq in [0u16, 65535, 1, 65534] {
            assert_eq!(state.recv.record_received(seq), ReceiveStatus::Fresh);
            if state.ordered.is_next(seq) {
                state.ordered.advance();
                delivered.push(seq);
                while let Some(held) = state.ordered.take_ready() {
                    delivered.push(held.sequence);
                }
            } else {
                state.ordered.hold(HeldMessage {
                    sequence: seq,
                    ty: MessageType::EcsEntCreate,
                    payload: Vec::new(),
                });
            }
        }

        assert_eq!(delivered, vec![65534, 65535, 0, 1]);
        assert_eq!(state.ordered.next_deliver(), 2);
        assert_eq!(state.ordered.held_count(), 0);
        assert_eq!(state.recv.ack_data().next_expected, 2);
    }
}
