//! In-process loopback driver.
//!
//! `FakeNetwork` connects any number of `FakeDriver` endpoints inside one
//! process, so multiple transports can exchange datagrams without touching a
//! NIC. Each endpoint queues incoming packets per priority level and drains
//! the highest level first. Delivery is lossless and, within one priority,
//! in order per endpoint; the transport itself must not rely on either.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use rustc_hash::FxHashMap;

use crate::driver::{Driver, Packet, RawAddress, WireAddress};
use crate::error::{Error, Result};
use crate::sync::SpinLock;

/// Default maximum number of bytes a fake packet can hold.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1500;

/// Number of packet priority levels the fake network supports.
pub const NUM_PRIORITIES: usize = 8;

/// Address of one endpoint on a [`FakeNetwork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FakeAddress(pub u64);

impl fmt::Display for FakeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl WireAddress for FakeAddress {
    fn to_raw(&self) -> RawAddress {
        let mut raw = RawAddress::default();
        raw.0[..8].copy_from_slice(&self.0.to_le_bytes());
        raw
    }
}

/// Incoming queues of one endpoint, one per priority level.
struct FakeNic {
    incoming: SpinLock<[VecDeque<Packet<FakeAddress>>; NUM_PRIORITIES]>,
}

struct NetworkState {
    nics: FxHashMap<u64, Arc<FakeNic>>,
    next_address: u64,
}

/// An in-process network connecting [`FakeDriver`] endpoints.
pub struct FakeNetwork {
    max_payload_size: usize,
    state: SpinLock<NetworkState>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Build a network whose packets carry at most `max_payload_size` bytes.
    pub fn with_max_payload(max_payload_size: usize) -> Arc<Self> {
        Arc::new(Self {
            max_payload_size,
            state: SpinLock::new(NetworkState {
                nics: FxHashMap::default(),
                next_address: 1,
            }),
        })
    }

    /// Attach a new endpoint to this network.
    pub fn new_driver(self: &Arc<Self>) -> Arc<FakeDriver> {
        let nic = Arc::new(FakeNic {
            incoming: SpinLock::new(std::array::from_fn(|_| VecDeque::new())),
        });
        let mut state = self.state.lock();
        let address = state.next_address;
        state.next_address += 1;
        state.nics.insert(address, Arc::clone(&nic));
        drop(state);
        Arc::new(FakeDriver {
            network: Arc::clone(self),
            local: FakeAddress(address),
            nic,
        })
    }

    fn deliver(&self, destination: u64, packet: Packet<FakeAddress>) -> Result<()> {
        let nic = self
            .state
            .lock()
            .nics
            .get(&destination)
            .cloned()
            .ok_or_else(|| Error::Driver(format!("no endpoint at address {}", destination)))?;
        let priority = usize::from(packet.priority).min(NUM_PRIORITIES - 1);
        nic.incoming.lock()[priority].push_back(packet);
        Ok(())
    }
}

/// A driver that sends and receives datagrams over a [`FakeNetwork`].
pub struct FakeDriver {
    network: Arc<FakeNetwork>,
    local: FakeAddress,
    nic: Arc<FakeNic>,
}

impl Driver for FakeDriver {
    type Address = FakeAddress;

    fn alloc_packet(&self) -> Packet<FakeAddress> {
        Packet {
            address: None,
            priority: 0,
            payload: BytesMut::with_capacity(self.network.max_payload_size),
        }
    }

    fn send_packets(&self, packets: &mut [Packet<FakeAddress>]) -> Result<()> {
        for packet in packets.iter() {
            let destination = packet
                .address
                .as_ref()
                .ok_or_else(|| Error::Driver("packet has no destination".into()))?;
            // The delivered copy carries the sender's address as its source.
            let copy = Packet {
                address: Some(self.local),
                priority: packet.priority,
                payload: packet.payload.clone(),
            };
            self.network.deliver(destination.0, copy)?;
        }
        Ok(())
    }

    fn receive_packets(&self, max_packets: usize, into: &mut Vec<Packet<FakeAddress>>) -> usize {
        let mut queues = self.nic.incoming.lock();
        let mut count = 0;
        for priority in (0..NUM_PRIORITIES).rev() {
            while count < max_packets {
                let Some(packet) = queues[priority].pop_front() else {
                    break;
                };
                into.push(packet);
                count += 1;
            }
        }
        count
    }

    fn release_packets(&self, packets: Vec<Packet<FakeAddress>>) {
        drop(packets);
    }

    fn max_payload_size(&self) -> usize {
        self.network.max_payload_size
    }

    fn bandwidth(&self) -> u64 {
        10_000_000_000
    }

    fn highest_packet_priority(&self) -> u8 {
        (NUM_PRIORITIES - 1) as u8
    }

    fn get_address(&self, addr: &str) -> Result<FakeAddress> {
        addr.parse::<u64>()
            .map(FakeAddress)
            .map_err(|_| Error::InvalidAddress(addr.to_string()))
    }

    fn get_address_raw(&self, raw: &RawAddress) -> Result<FakeAddress> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw.0[..8]);
        Ok(FakeAddress(u64::from_le_bytes(bytes)))
    }

    fn local_address(&self) -> FakeAddress {
        self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_receive() {
        let network = FakeNetwork::new();
        let a = network.new_driver();
        let b = network.new_driver();

        let mut packet = a.alloc_packet();
        packet.payload.extend_from_slice(b"hello");
        packet.address = Some(b.local_address());
        a.send_packets(std::slice::from_mut(&mut packet)).unwrap();

        let mut received = Vec::new();
        assert_eq!(b.receive_packets(8, &mut received), 1);
        assert_eq!(&received[0].payload[..], b"hello");
        assert_eq!(received[0].address, Some(a.local_address()));

        // Nothing further queued.
        assert_eq!(b.receive_packets(8, &mut received), 0);
    }

    #[test]
    fn test_priority_delivery_order() {
        let network = FakeNetwork::new();
        let a = network.new_driver();
        let b = network.new_driver();

        for (marker, priority) in [(1u8, 0u8), (2, 0), (3, a.highest_packet_priority())] {
            let mut packet = a.alloc_packet();
            packet.payload.extend_from_slice(&[marker]);
            packet.priority = priority;
            packet.address = Some(b.local_address());
            a.send_packets(std::slice::from_mut(&mut packet)).unwrap();
        }

        // The high-priority packet jumps ahead of the earlier low ones.
        let mut received = Vec::new();
        assert_eq!(b.receive_packets(8, &mut received), 3);
        assert_eq!(received[0].payload[0], 3);
        assert_eq!(received[0].priority, a.highest_packet_priority());
        assert_eq!(received[1].payload[0], 1);
        assert_eq!(received[2].payload[0], 2);
    }

    #[test]
    fn test_send_to_unknown_endpoint() {
        let network = FakeNetwork::new();
        let a = network.new_driver();

        let mut packet = a.alloc_packet();
        packet.address = Some(FakeAddress(999));
        assert!(a.send_packets(std::slice::from_mut(&mut packet)).is_err());
    }

    #[test]
    fn test_address_resolution() {
        let network = FakeNetwork::new();
        let a = network.new_driver();

        let addr = a.get_address("42").unwrap();
        assert_eq!(addr, FakeAddress(42));
        assert_eq!(addr.to_string(), "42");
        assert!(a.get_address("not-a-number").is_err());

        let raw = addr.to_raw();
        assert_eq!(a.get_address_raw(&raw).unwrap(), addr);
    }
}
