//! Packetized message buffers.
//!
//! A [`Message`] is a logical byte buffer stored as driver packets, addressed
//! by packet index. Each packet gives up a fixed prefix
//! (`packet_header_length` bytes) to the wire headers; the remaining
//! `packet_data_length` bytes per packet hold message content. The first
//! bytes of the logical buffer can be reserved as a typed header prefix.

use std::sync::Arc;

use crate::driver::{Driver, Packet};
use crate::error::{Error, Result};

/// Maximum number of packet slots a single message may span.
pub const MAX_MESSAGE_PACKETS: u16 = 1024;

/// A logical byte buffer spread over driver packets.
pub struct Message<D: Driver> {
    driver: Arc<D>,
    /// Bytes at the front of every packet reserved for wire headers.
    packet_header_length: u32,
    /// Message bytes carried per packet.
    packet_data_length: u32,
    /// Total logical length: header prefix plus appended payload.
    raw_length: u32,
    /// Length of the reserved typed prefix.
    header_length: u32,
    num_packets: u16,
    packets: Vec<Option<Packet<D::Address>>>,
}

impl<D: Driver> Message<D> {
    /// Create a message buffer.
    ///
    /// `message_length` is the expected total length for inbound messages
    /// (slots are pre-sized), or 0 for outbound messages that grow by
    /// [`append`](Self::append).
    pub fn new(driver: Arc<D>, packet_header_length: u32, message_length: u32) -> Self {
        let max_payload = driver.max_payload_size() as u32;
        debug_assert!(packet_header_length < max_payload);
        let packet_data_length = max_payload - packet_header_length;
        let slots = message_length
            .div_ceil(packet_data_length)
            .min(u32::from(MAX_MESSAGE_PACKETS)) as usize;
        let mut packets = Vec::new();
        packets.resize_with(slots, || None);
        Self {
            driver,
            packet_header_length,
            packet_data_length,
            raw_length: message_length,
            header_length: 0,
            num_packets: 0,
            packets,
        }
    }

    /// Total logical length of the message in bytes.
    #[inline]
    pub fn raw_length(&self) -> u32 {
        self.raw_length
    }

    /// Message bytes carried per packet.
    #[inline]
    pub fn packet_data_length(&self) -> u32 {
        self.packet_data_length
    }

    /// Number of occupied packet slots.
    #[inline]
    pub fn num_packets(&self) -> u16 {
        self.num_packets
    }

    /// Whether the slot at `index` holds a packet.
    pub fn is_occupied(&self, index: u16) -> bool {
        self.packets
            .get(index as usize)
            .is_some_and(|slot| slot.is_some())
    }

    pub fn packet(&self, index: u16) -> Option<&Packet<D::Address>> {
        self.packets.get(index as usize)?.as_ref()
    }

    pub fn packet_mut(&mut self, index: u16) -> Option<&mut Packet<D::Address>> {
        self.packets.get_mut(index as usize)?.as_mut()
    }

    /// Install a packet at `index`.
    ///
    /// Returns the packet back to the caller if the slot is already occupied
    /// or the index is outside the per-message budget, so it can be released
    /// to the driver.
    pub fn set_packet(
        &mut self,
        index: u16,
        packet: Packet<D::Address>,
    ) -> std::result::Result<(), Packet<D::Address>> {
        if index >= MAX_MESSAGE_PACKETS {
            return Err(packet);
        }
        let index = index as usize;
        if index >= self.packets.len() {
            self.packets.resize_with(index + 1, || None);
        }
        if self.packets[index].is_some() {
            return Err(packet);
        }
        self.packets[index] = Some(packet);
        self.num_packets += 1;
        Ok(())
    }

    /// Reserve the first `length` logical bytes as a typed header prefix.
    ///
    /// Allocates the first packet if needed and zero-fills the region. The
    /// prefix must fit in a single packet.
    pub fn reserve_header(&mut self, length: u32) {
        debug_assert!(length <= self.packet_data_length);
        self.header_length = length;
        self.ensure_packet(0);
        let needed = (self.packet_header_length + length) as usize;
        if let Some(packet) = self.packets[0].as_mut() {
            if packet.payload.len() < needed {
                packet.payload.resize(needed, 0);
            }
        }
        if self.raw_length < length {
            self.raw_length = length;
        }
    }

    /// Length of the reserved typed prefix.
    #[inline]
    pub fn header_length(&self) -> u32 {
        self.header_length
    }

    /// View of the first `length` logical bytes, if the first packet is
    /// present and long enough.
    pub fn prefix(&self, length: u32) -> Option<&[u8]> {
        let start = self.packet_header_length as usize;
        let end = start + length as usize;
        let packet = self.packets.first()?.as_ref()?;
        packet.payload.get(start..end)
    }

    /// Mutable view of the first `length` logical bytes.
    pub fn prefix_mut(&mut self, length: u32) -> Option<&mut [u8]> {
        let start = self.packet_header_length as usize;
        let end = start + length as usize;
        let packet = self.packets.first_mut()?.as_mut()?;
        packet.payload.get_mut(start..end)
    }

    /// Append bytes at the end of the logical buffer, allocating packets
    /// from the driver as needed.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let end = self.raw_length as usize + data.len();
        let max = usize::from(MAX_MESSAGE_PACKETS) * self.packet_data_length as usize;
        if end > max {
            return Err(Error::MessageTooLarge { size: end, max });
        }
        let mut offset = self.raw_length;
        let mut consumed = 0;
        while consumed < data.len() {
            let index = (offset / self.packet_data_length) as u16;
            let within = (offset % self.packet_data_length) as usize;
            let chunk = (self.packet_data_length as usize - within).min(data.len() - consumed);
            let start = self.packet_header_length as usize + within;
            self.ensure_packet(index);
            if let Some(packet) = self.packets[index as usize].as_mut() {
                if packet.payload.len() < start + chunk {
                    packet.payload.resize(start + chunk, 0);
                }
                packet.payload[start..start + chunk]
                    .copy_from_slice(&data[consumed..consumed + chunk]);
            }
            consumed += chunk;
            offset += chunk as u32;
        }
        self.raw_length = offset;
        Ok(())
    }

    /// Copy logical bytes starting at `offset` into `buf`.
    ///
    /// Stops at the end of the message or at the first missing packet;
    /// returns the number of bytes copied.
    pub fn read(&self, offset: u32, buf: &mut [u8]) -> usize {
        let mut offset = offset;
        let mut copied = 0;
        while copied < buf.len() && offset < self.raw_length {
            let index = (offset / self.packet_data_length) as usize;
            let within = (offset % self.packet_data_length) as usize;
            let Some(Some(packet)) = self.packets.get(index) else {
                break;
            };
            let start = self.packet_header_length as usize + within;
            let wanted = (self.packet_data_length as usize - within)
                .min(buf.len() - copied)
                .min((self.raw_length - offset) as usize);
            let available = packet.payload.len().saturating_sub(start).min(wanted);
            if available == 0 {
                break;
            }
            buf[copied..copied + available]
                .copy_from_slice(&packet.payload[start..start + available]);
            copied += available;
            offset += available as u32;
        }
        copied
    }

    fn ensure_packet(&mut self, index: u16) {
        let index = index as usize;
        if index >= self.packets.len() {
            self.packets.resize_with(index + 1, || None);
        }
        if self.packets[index].is_none() {
            let mut packet = self.driver.alloc_packet();
            packet.payload.resize(self.packet_header_length as usize, 0);
            self.packets[index] = Some(packet);
            self.num_packets += 1;
        }
    }
}

impl<D: Driver> Drop for Message<D> {
    fn drop(&mut self) {
        let packets: Vec<_> = self.packets.drain(..).flatten().collect();
        if !packets.is_empty() {
            self.driver.release_packets(packets);
        }
    }
}
