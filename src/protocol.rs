//! Wire protocol definitions.
//!
//! Every packet begins with a common prefix carrying the message id and a
//! one-byte opcode; DATA packets add reassembly fields, GRANT packets add the
//! authorized byte offset. All integers are little-endian and headers are
//! serialized explicitly rather than cast from packed structs.

use bytes::{Buf, BufMut};
use num_enum::TryFromPrimitive;

use crate::driver::RawAddress;
use crate::error::{Error, Result};

/// Tag of the final response delivered back to the originating transport.
pub const ULTIMATE_RESPONSE_TAG: u64 = 0;

/// Tag of the first hop of a remote op. Chained server-to-server sends use
/// successive tags above this one.
pub const INITIAL_REQUEST_TAG: u64 = 1;

/// Identifier of one op: the transport that originated it plus a sequence
/// number unique within that transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpId {
    pub transport_id: u64,
    pub sequence: u64,
}

/// Identifier of one message within an op.
///
/// The `tag` distinguishes the hops of an op: the initial request, chained
/// requests, and the ultimate response all share the [`OpId`] prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageId {
    pub transport_id: u64,
    pub sequence: u64,
    pub tag: u64,
}

impl MessageId {
    /// Serialized size in bytes.
    pub const SERIALIZED_SIZE: usize = 24;

    /// Build a message id from an op id and a tag.
    pub fn new(op_id: OpId, tag: u64) -> Self {
        Self {
            transport_id: op_id.transport_id,
            sequence: op_id.sequence,
            tag,
        }
    }

    /// The op this message belongs to.
    #[inline]
    pub fn op_id(&self) -> OpId {
        OpId {
            transport_id: self.transport_id,
            sequence: self.sequence,
        }
    }

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.transport_id);
        buf.put_u64_le(self.sequence);
        buf.put_u64_le(self.tag);
    }

    fn deser(buf: &mut impl Buf) -> Self {
        Self {
            transport_id: buf.get_u64_le(),
            sequence: buf.get_u64_le(),
            tag: buf.get_u64_le(),
        }
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}:{}:{})", self.transport_id, self.sequence, self.tag)
    }
}

/// Packet opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Carries one slot of a message.
    Data = 1,
    /// Receiver-to-sender authorization to emit more bytes.
    Grant = 2,
    /// End-to-end acknowledgement that a chained op has completed.
    Done = 3,
}

/// Prefix common to every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub opcode: Opcode,
    pub message_id: MessageId,
}

impl CommonHeader {
    /// Serialized size in bytes (opcode, one reserved byte, message id).
    pub const SERIALIZED_SIZE: usize = 2 + MessageId::SERIALIZED_SIZE;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.opcode as u8);
        buf.put_u8(0);
        self.message_id.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SERIALIZED_SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SERIALIZED_SIZE,
                available: buf.remaining(),
            });
        }
        let opcode =
            Opcode::try_from_primitive(buf.get_u8()).map_err(|e| Error::InvalidOpcode(e.number))?;
        buf.advance(1);
        Ok(Self {
            opcode,
            message_id: MessageId::deser(buf),
        })
    }

    /// Read just the opcode of a packet payload, for dispatch.
    pub fn peek_opcode(payload: &[u8]) -> Result<Opcode> {
        let first = *payload.first().ok_or(Error::BufferTooSmall {
            required: 1,
            available: 0,
        })?;
        Opcode::try_from_primitive(first).map_err(|e| Error::InvalidOpcode(e.number))
    }
}

/// Header of a DATA packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub common: CommonHeader,
    /// Index of the message slot this packet fills.
    pub index: u16,
    /// Total length of the message in bytes, repeated on every packet so
    /// that any packet can create the reassembly buffer.
    pub total_length: u32,
}

/// Serialized size of [`DataHeader`]; every data packet gives up this many
/// payload bytes to the transport.
pub const DATA_HEADER_SIZE: usize = DataHeader::SERIALIZED_SIZE;

impl DataHeader {
    pub const SERIALIZED_SIZE: usize = CommonHeader::SERIALIZED_SIZE + 2 + 4;

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.common.ser(buf);
        buf.put_u16_le(self.index);
        buf.put_u32_le(self.total_length);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Self> {
        let common = CommonHeader::deser(buf)?;
        if buf.remaining() < 6 {
            return Err(Error::BufferTooSmall {
                required: Self::SERIALIZED_SIZE,
                available: CommonHeader::SERIALIZED_SIZE + buf.remaining(),
            });
        }
        Ok(Self {
            common,
            index: buf.get_u16_le(),
            total_length: buf.get_u32_le(),
        })
    }
}

/// Header of a GRANT packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantHeader {
    pub common: CommonHeader,
    /// Byte offset up to which the sender is authorized to emit.
    pub offset: u32,
}

impl GrantHeader {
    pub const SERIALIZED_SIZE: usize = CommonHeader::SERIALIZED_SIZE + 4;

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.common.ser(buf);
        buf.put_u32_le(self.offset);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Self> {
        let common = CommonHeader::deser(buf)?;
        if buf.remaining() < 4 {
            return Err(Error::BufferTooSmall {
                required: Self::SERIALIZED_SIZE,
                available: CommonHeader::SERIALIZED_SIZE + buf.remaining(),
            });
        }
        Ok(Self {
            common,
            offset: buf.get_u32_le(),
        })
    }
}

/// Header of a DONE packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneHeader {
    pub common: CommonHeader,
}

impl DoneHeader {
    pub const SERIALIZED_SIZE: usize = CommonHeader::SERIALIZED_SIZE;

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.common.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self {
            common: CommonHeader::deser(buf)?,
        })
    }
}

/// Typed prefix of every application message.
///
/// Reserved at the front of the logical message buffer before payload is
/// appended; carries the wire-form address the final response should be
/// sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub reply_address: RawAddress,
}

impl MessageHeader {
    pub const SERIALIZED_SIZE: usize = RawAddress::SIZE;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.reply_address.0);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SERIALIZED_SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SERIALIZED_SIZE,
                available: buf.remaining(),
            });
        }
        let mut raw = RawAddress::default();
        buf.copy_to_slice(&mut raw.0);
        Ok(Self { reply_address: raw })
    }
}
