//! Seam between the protocol engine and whatever carries its packets.

use chrono::Duration;

use crate::address::Address;
use crate::buffer::DataPacket;
use crate::messages::AodvMessage;
use crate::AodvError;

/// Packet I/O as seen by the engine. Implementations decide how frames
/// actually move: UDP sockets, a simulator fabric, or a test recorder.
///
/// `delay` is the jitter the engine wants applied before transmission;
/// implementations free to send immediately may ignore it.
pub trait Transport {
    /// Interfaces running the protocol on this node.
    fn interface_count(&self) -> usize;

    fn local_address(&self, interface: usize) -> Address;

    fn is_local_address(&self, address: &Address) -> bool;

    fn unicast_control(
        &mut self,
        msg: &AodvMessage,
        next_hop: Address,
        interface: usize,
        ttl: u32,
        delay: Duration,
    ) -> Result<(), AodvError>;

    fn broadcast_control(
        &mut self,
        msg: &AodvMessage,
        interface: usize,
        ttl: u32,
        delay: Duration,
    ) -> Result<(), AodvError>;

    /// Forward a data packet towards its next hop.
    fn send_data(
        &mut self,
        packet: DataPacket,
        next_hop: Address,
        interface: usize,
    ) -> Result<(), AodvError>;

    /// Hand a packet addressed to this node up the stack.
    fn deliver(&mut self, packet: DataPacket);
}
