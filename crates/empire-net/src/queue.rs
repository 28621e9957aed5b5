//! Packets waiting for a live connection.

use std::collections::VecDeque;

use crate::packet::Packet;

/// FIFO buffer of packets sent while no session is live.
///
/// Unbounded; callers that need backpressure layer it on top. The queue is
/// not synchronized itself: the reconnect controller owns it behind its
/// connection lock.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    packets: VecDeque<Packet>,
}

impl OutboundQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet to the tail.
    pub fn push(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    /// Put packets back at the head, ahead of anything queued since.
    ///
    /// `packets` keeps its own order.
    pub fn requeue_front(&mut self, packets: Vec<Packet>) {
        for packet in packets.into_iter().rev() {
            self.packets.push_front(packet);
        }
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Consume the queue, yielding packets oldest first.
    pub fn drain(self) -> impl Iterator<Item = Packet> {
        self.packets.into_iter()
    }
}
