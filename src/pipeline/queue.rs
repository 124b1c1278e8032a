//! Flow-controlled packet queue with watermark-based backpressure.
//!
//! Ported from `queue.c`. Each queue has a `max` byte budget and a `low`
//! watermark at `max * 5 / 100`; a queue that fills past `max` marks itself
//! `FULL` and suspends upstream production, resuming only once it has
//! drained back below `low`. `packet_size` governs how large a single
//! packet handed to the *next* queue may be — this is `stage::Pipeline`'s
//! per-queue negotiation knob.

use crate::pipeline::packet::Packet;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFlags(u16);

impl QueueFlags {
    pub const EMPTY: Self = Self(0);
    pub const OPEN: Self = Self(0b0000_0001);
    pub const SUSPENDED: Self = Self(0b0000_0010);
    pub const FULL: Self = Self(0b0000_0100);
    pub const SERVICED: Self = Self(0b0000_1000);
    pub const EOF: Self = Self(0b0001_0000);
    pub const STARTED: Self = Self(0b0010_0000);
    pub const RESERVICE: Self = Self(0b0100_0000);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
    pub const fn insert(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
    pub const fn remove(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

/// A single queue in a pipeline's RX or TX chain.
///
/// `count` is the running total of buffered content bytes (prefixes
/// excluded, matching the source's `q->count` bookkeeping). `max`/`low`
/// implement the backpressure watermarks; `packet_size` bounds how large a
/// packet this queue will forward downstream without first asking the next
/// queue to accept a resize.
#[derive(Debug)]
pub struct Queue {
    pub name: &'static str,
    pub count: usize,
    pub max: usize,
    pub low: usize,
    pub packet_size: usize,
    pub flags: QueueFlags,
    packets: VecDeque<Packet>,
}

impl Queue {
    pub fn new(name: &'static str, max: usize) -> Self {
        Self {
            name,
            count: 0,
            max,
            low: max * 5 / 100,
            packet_size: max,
            flags: QueueFlags::OPEN,
            packets: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn is_suspended(&self) -> bool {
        self.flags.contains(QueueFlags::SUSPENDED)
    }

    pub fn suspend(&mut self) {
        self.flags = self.flags.insert(QueueFlags::SUSPENDED);
    }

    pub fn resume(&mut self) {
        self.flags = self.flags.remove(QueueFlags::SUSPENDED);
    }

    /// Appends a packet for later servicing and updates `count`, marking the
    /// queue `FULL` once `count` exceeds `max` (`httpPutForService`).
    pub fn put_for_service(&mut self, packet: Packet) {
        self.count += packet.len();
        self.packets.push_back(packet);
        if self.count > self.max {
            self.flags = self.flags.insert(QueueFlags::FULL);
        }
    }

    /// Dequeues the next packet, clearing `FULL` (and resuming the previous
    /// queue, conceptually) once `count` drops back to or below `low`,
    /// matching `httpGetPacket`.
    pub fn get_packet(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        self.count = self.count.saturating_sub(packet.len());
        if self.flags.contains(QueueFlags::FULL) && self.count <= self.low {
            self.flags = self.flags.remove(QueueFlags::FULL);
        }
        Some(packet)
    }

    /// Pushes a packet back onto the front of the queue (`httpPutBackPacket`).
    pub fn put_back(&mut self, packet: Packet) {
        self.count += packet.len();
        self.packets.push_front(packet);
    }

    /// Coalesces adjacent buffered packets, stopping once the combined size
    /// would exceed `size` or the packet queue is exhausted, per
    /// `httpJoinPackets`.
    pub fn join_packets(&mut self, size: usize) {
        let mut joined: Vec<Packet> = Vec::new();
        while let Some(mut packet) = self.packets.pop_front() {
            match joined.last_mut() {
                Some(last) if last.len() + packet.len() <= size => {
                    last.join(packet);
                }
                _ => joined.push(std::mem::replace(&mut packet, Packet::create_end())),
            }
        }
        self.packets = joined.into();
    }

    /// Discards buffered DATA packets (e.g. on `Connection: close` reset or
    /// handler rewrite), optionally removing them outright rather than just
    /// flushing, matching `httpDiscardQueueData`.
    pub fn discard(&mut self, remove_packets: bool) {
        if remove_packets {
            self.count = 0;
            self.packets.clear();
        } else {
            for packet in &mut self.packets {
                if let crate::pipeline::packet::PacketContent::Buffered(data) = &mut packet.content
                {
                    data.clear();
                }
            }
            self.count = 0;
        }
    }

    /// Whether this queue would currently accept a packet of `size` bytes
    /// without exceeding `packet_size` or `max`, per
    /// `httpWillNextQueueAcceptSize`.
    pub fn will_accept_size(&self, size: usize) -> bool {
        size <= self.packet_size && size + self.count <= self.max
    }

    pub fn will_accept_packet(&self, packet: &Packet) -> bool {
        self.will_accept_size(packet.len())
    }

    /// Resizes (splits) `packet` down to what this queue will currently
    /// accept, returning the overflow packet if any, per `httpResizePacket`.
    pub fn resize_packet(&self, packet: &mut Packet) -> Option<Packet> {
        let accept = self.packet_size.min(self.max.saturating_sub(self.count));
        packet.resize(accept)
    }

    pub fn flush(&mut self) {
        self.discard(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::packet::Packet;

    #[test]
    fn low_watermark_is_five_percent_of_max() {
        let q = Queue::new("test", 1000);
        assert_eq!(q.low, 50);
    }

    #[test]
    fn marks_full_past_max_and_clears_at_low() {
        let mut q = Queue::new("test", 100);
        q.put_for_service(Packet::create_data(vec![0u8; 120]));
        assert!(q.flags.contains(QueueFlags::FULL));

        // Drain almost everything, leaving us above `low` (5) still.
        let p = q.get_packet().unwrap();
        assert_eq!(p.len(), 120);
        assert_eq!(q.count, 0);
        assert!(!q.flags.contains(QueueFlags::FULL));
    }

    #[test]
    fn will_accept_size_checks_packet_size_and_max() {
        let mut q = Queue::new("test", 100);
        q.packet_size = 40;
        assert!(q.will_accept_size(40));
        assert!(!q.will_accept_size(41));

        q.count = 90;
        assert!(!q.will_accept_size(20));
    }

    #[test]
    fn put_back_restores_count_and_order() {
        let mut q = Queue::new("test", 100);
        q.put_for_service(Packet::create_data(b"b".to_vec()));
        q.put_back(Packet::create_data(b"a".to_vec()));

        let first = q.get_packet().unwrap();
        assert_eq!(first.content, crate::pipeline::packet::PacketContent::Buffered(b"a".to_vec()));
    }

    #[test]
    fn join_packets_coalesces_up_to_size() {
        let mut q = Queue::new("test", 1000);
        q.put_for_service(Packet::create_data(vec![0u8; 10]));
        q.put_for_service(Packet::create_data(vec![0u8; 10]));
        q.put_for_service(Packet::create_data(vec![0u8; 10]));

        q.join_packets(15);

        let first = q.get_packet().unwrap();
        assert_eq!(first.len(), 10);
        let second = q.get_packet().unwrap();
        assert_eq!(second.len(), 20);
    }

    #[test]
    fn discard_with_remove_clears_everything() {
        let mut q = Queue::new("test", 1000);
        q.put_for_service(Packet::create_data(vec![0u8; 10]));
        q.discard(true);
        assert_eq!(q.count, 0);
        assert!(q.is_empty());
    }
}
