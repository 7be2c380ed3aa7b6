//! Buffer for data packets awaiting a route.

use crate::address::Address;
use crate::{AodvError, AodvErrorKind, DropReason};

/// A data packet handed to the routing layer, either originated locally
/// or received for forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub source: Address,
    pub destination: Address,
    pub previous_hop: Address,
    pub payload: Vec<u8>,
}

impl DataPacket {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Packets parked while a route search is in flight. Kept sorted by
/// destination, oldest first within a destination, so a route reply
/// releases them in arrival order.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    packets: Vec<DataPacket>,
    size_bytes: usize,
    max_packets: usize,
    /// Byte cap; zero means the packet cap applies instead.
    max_bytes: usize,
}

impl MessageBuffer {
    pub fn new(max_packets: usize, max_bytes: usize) -> MessageBuffer {
        MessageBuffer {
            packets: Vec::new(),
            size_bytes: 0,
            max_packets,
            max_bytes,
        }
    }

    /// Park a packet. The incoming packet is the one dropped when the
    /// buffer is at capacity.
    pub fn insert(&mut self, packet: DataPacket) -> Result<(), AodvError> {
        let full = if self.max_bytes == 0 {
            self.packets.len() >= self.max_packets
        } else {
            self.size_bytes + packet.size() > self.max_bytes
        };
        if full {
            return Err(AodvErrorKind::PacketDropped(DropReason::BufferOverflow).into());
        }
        let host = packet.destination.host_bits();
        let mut pos = self.packets.len();
        while pos > 0 && self.packets[pos - 1].destination.host_bits() > host {
            pos -= 1;
        }
        self.size_bytes += packet.size();
        self.packets.insert(pos, packet);
        Ok(())
    }

    /// Pull the oldest packet waiting for a destination, if any.
    pub fn take_next(&mut self, destination: &Address) -> Option<DataPacket> {
        let host = destination.host_bits();
        let pos = self
            .packets
            .iter()
            .position(|p| p.destination.host_bits() == host)?;
        let packet = self.packets.remove(pos);
        self.size_bytes -= packet.size();
        Some(packet)
    }

    /// Drop everything waiting for a destination, returning how many
    /// packets went away.
    pub fn drop_all(&mut self, destination: &Address) -> usize {
        let host = destination.host_bits();
        let before = self.packets.len();
        let mut dropped_bytes = 0;
        self.packets.retain(|p| {
            if p.destination.host_bits() == host {
                dropped_bytes += p.size();
                false
            } else {
                true
            }
        });
        self.size_bytes -= dropped_bytes;
        before - self.packets.len()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}
