//! Packet driver abstraction.
//!
//! The transport sits on top of a packet-oriented driver that allocates and
//! moves raw datagrams and resolves addresses. Drivers are expected to be
//! kernel-bypass NICs or similar; the in-process [`fake`](crate::fake) driver
//! implements the same contract for testing.

use std::fmt;
use std::hash::Hash;

use bytes::BytesMut;

use crate::error::Result;

/// Fixed-size wire encoding of a driver address.
///
/// The encoding is driver-defined; the block travels inside application
/// message headers so a peer can hand it back to its own driver for
/// resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawAddress(pub [u8; RawAddress::SIZE]);

impl RawAddress {
    /// Serialized size of a raw address in bytes.
    pub const SIZE: usize = 16;
}

/// Conversion of a resolved address into its wire form.
pub trait WireAddress {
    fn to_raw(&self) -> RawAddress;
}

/// A raw datagram buffer owned by a driver.
///
/// On receive, `address` carries the resolved source of the packet; on send,
/// the transport sets it to the destination. The handle attached here is
/// short-lived: anything that outlives the packet must re-resolve through
/// [`Driver::get_address`].
#[derive(Debug)]
pub struct Packet<A> {
    /// Source (inbound) or destination (outbound) of this packet.
    pub address: Option<A>,
    /// Network priority this packet is sent at; higher values are delivered
    /// ahead of lower ones. Control packets use the driver's highest level.
    pub priority: u8,
    /// Packet payload, including all transport headers.
    pub payload: BytesMut,
}

/// Contract between the transport and the packet driver.
///
/// Drivers hand out packets via [`alloc_packet`](Driver::alloc_packet),
/// copy them onto the wire in [`send_packets`](Driver::send_packets) (the
/// transport keeps ownership so messages can retain their packets), and take
/// unwanted packets back through [`release_packets`](Driver::release_packets).
pub trait Driver: Send + Sync + 'static {
    /// Resolved address handle. Cheap to clone; interning is allowed and the
    /// handle must stay valid for as long as the transport uses it.
    type Address: Clone + Eq + Hash + fmt::Debug + fmt::Display + WireAddress + Send + Sync;

    /// Allocate an empty packet sized for this driver's payload limit.
    fn alloc_packet(&self) -> Packet<Self::Address>;

    /// Copy the given packets onto the wire. Each packet's `address` must
    /// name the destination.
    fn send_packets(&self, packets: &mut [Packet<Self::Address>]) -> Result<()>;

    /// Non-blocking poll for incoming packets; appends up to `max_packets`
    /// packets to `into` and returns how many were appended.
    fn receive_packets(&self, max_packets: usize, into: &mut Vec<Packet<Self::Address>>) -> usize;

    /// Return packets the transport no longer wants.
    fn release_packets(&self, packets: Vec<Packet<Self::Address>>);

    /// Maximum number of payload bytes a single packet can carry.
    fn max_payload_size(&self) -> usize;

    /// Link bandwidth in bits per second.
    fn bandwidth(&self) -> u64;

    /// Highest priority level packets can be sent at.
    fn highest_packet_priority(&self) -> u8;

    /// Resolve a string-form address.
    fn get_address(&self, addr: &str) -> Result<Self::Address>;

    /// Resolve a wire-form address.
    fn get_address_raw(&self, raw: &RawAddress) -> Result<Self::Address>;

    /// The address other endpoints should use to reach this driver.
    fn local_address(&self) -> Self::Address;
}
