//! Outbound message emission.
//!
//! The [`Sender`] owns the id-to-op table for messages in flight and emits
//! data packets under the byte budget granted by the remote receiver. A new
//! message starts with an unscheduled window so short messages never wait
//! for a grant; everything past that window is paced by GRANT packets.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::driver::{Driver, Packet, WireAddress};
use crate::message::Message;
use crate::protocol::{
    CommonHeader, DataHeader, DoneHeader, GrantHeader, MessageHeader, MessageId, Opcode,
};
use crate::sync::SpinLock;
use crate::transport::{Op, OpState, UpdateHints};

/// Emission state for one outbound message.
pub struct OutboundMessage<D: Driver> {
    pub(crate) message: Message<D>,
    pub(crate) id: Option<MessageId>,
    pub(crate) destination: Option<D::Address>,
    /// Bytes the remote receiver has authorized.
    pub(crate) granted_bytes: u32,
    /// Packets handed to the driver so far; emission is in index order.
    pub(crate) packets_sent: u16,
    /// True once the driver has accepted every packet.
    pub(crate) sent: bool,
    /// True once no further end-to-end acknowledgement is outstanding.
    pub(crate) acknowledged: bool,
}

impl<D: Driver> OutboundMessage<D> {
    pub(crate) fn new(driver: Arc<D>) -> Self {
        Self {
            message: Message::new(driver, DataHeader::SERIALIZED_SIZE as u32, 0),
            id: None,
            destination: None,
            granted_bytes: 0,
            packets_sent: 0,
            sent: false,
            acknowledged: true,
        }
    }

    /// True once the message is fully sent and acknowledged.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.sent && self.acknowledged
    }

    pub fn message(&self) -> &Message<D> {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message<D> {
        &mut self.message
    }
}

struct SenderState<D: Driver> {
    /// Ops with a message in flight, keyed by the outbound message id.
    outbound: FxHashMap<MessageId, Arc<Op<D>>>,
    /// Messages that may have sendable packets.
    ready: VecDeque<MessageId>,
}

/// Queues, paces, and acknowledges outbound messages.
pub struct Sender<D: Driver> {
    driver: Arc<D>,
    update_hints: Arc<UpdateHints<D>>,
    unscheduled_byte_limit: u32,
    inner: SpinLock<SenderState<D>>,
}

impl<D: Driver> Sender<D> {
    pub fn new(
        driver: Arc<D>,
        update_hints: Arc<UpdateHints<D>>,
        unscheduled_byte_limit: u32,
    ) -> Self {
        Self {
            driver,
            update_hints,
            unscheduled_byte_limit,
            inner: SpinLock::new(SenderState {
                outbound: FxHashMap::default(),
                ready: VecDeque::new(),
            }),
        }
    }

    /// Enqueue `op`'s outbound message for emission as `id` to `destination`.
    ///
    /// `expecting_response` marks a chained request: completion of such a
    /// message is signalled end-to-end by a DONE packet rather than by the
    /// driver accepting the last byte.
    pub fn send_message(
        &self,
        id: MessageId,
        destination: D::Address,
        op: &Arc<Op<D>>,
        expecting_response: bool,
    ) {
        // Reply address for the message header: server hops propagate the
        // origin's address from their inbound message so the ultimate
        // response can skip the intermediate hops; fresh requests advertise
        // this driver.
        let reply_address = op
            .in_message()
            .and_then(|message| message.message_header().ok())
            .map(|header| header.reply_address)
            .unwrap_or_else(|| self.driver.local_address().to_raw());

        let mut out = op.out_message().lock();
        out.id = Some(id);
        out.destination = Some(destination.clone());
        out.acknowledged = !expecting_response;
        out.sent = false;
        out.packets_sent = 0;

        out.message
            .reserve_header(MessageHeader::SERIALIZED_SIZE as u32);
        let mut header_buf = [0u8; MessageHeader::SERIALIZED_SIZE];
        MessageHeader { reply_address }.ser(&mut header_buf.as_mut_slice());
        if let Some(prefix) = out
            .message
            .prefix_mut(MessageHeader::SERIALIZED_SIZE as u32)
        {
            prefix.copy_from_slice(&header_buf);
        }

        // The unscheduled window always covers at least one packet, or a
        // zero-window configuration would deadlock before the first grant.
        let total_length = out.message.raw_length();
        out.granted_bytes = total_length.min(
            self.unscheduled_byte_limit
                .max(out.message.packet_data_length()),
        );

        for index in 0..out.message.num_packets() {
            let header = DataHeader {
                common: CommonHeader {
                    opcode: Opcode::Data,
                    message_id: id,
                },
                index,
                total_length,
            };
            let mut buf = [0u8; DataHeader::SERIALIZED_SIZE];
            header.ser(&mut buf.as_mut_slice());
            if let Some(packet) = out.message.packet_mut(index) {
                packet.payload[..DataHeader::SERIALIZED_SIZE].copy_from_slice(&buf);
                packet.address = Some(destination.clone());
            }
        }
        drop(out);

        let mut state = self.inner.lock();
        state.outbound.insert(id, Arc::clone(op));
        state.ready.push_back(id);
    }

    /// Process an incoming GRANT packet: extend the message's emission
    /// credit and requeue it if that unblocked sending.
    pub fn handle_grant_packet(&self, packet: Packet<D::Address>) {
        let header = match GrantHeader::deser(&mut &packet.payload[..]) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "dropping malformed GRANT packet");
                self.driver.release_packets(vec![packet]);
                return;
            }
        };
        self.driver.release_packets(vec![packet]);

        let id = header.common.message_id;
        let Some(op) = self.inner.lock().outbound.get(&id).cloned() else {
            debug!(%id, "GRANT for unknown message");
            return;
        };
        let mut out = op.out_message().lock();
        let mut requeue = false;
        if header.offset > out.granted_bytes {
            out.granted_bytes = header.offset.min(out.message.raw_length());
            requeue = !out.sent;
        }
        drop(out);
        if requeue {
            self.inner.lock().ready.push_back(id);
        }
    }

    /// Process an incoming DONE packet: the chained request identified by
    /// the packet has completed end-to-end.
    pub fn handle_done_packet(&self, packet: Packet<D::Address>) {
        let header = match DoneHeader::deser(&mut &packet.payload[..]) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "dropping malformed DONE packet");
                self.driver.release_packets(vec![packet]);
                return;
            }
        };
        self.driver.release_packets(vec![packet]);

        let id = header.common.message_id;
        let Some(op) = self.inner.lock().outbound.get(&id).cloned() else {
            debug!(%id, "DONE for unknown message");
            return;
        };
        op.out_message().lock().acknowledged = true;
        self.update_hints.hint(&op);
    }

    /// Emit granted-but-unsent packets of every ready message.
    pub fn poll(&self) {
        loop {
            let id = { self.inner.lock().ready.pop_front() };
            let Some(id) = id else {
                break;
            };
            // The op may have been destroyed since the message was queued.
            let Some(op) = self.inner.lock().outbound.get(&id).cloned() else {
                continue;
            };

            let mut out = op.out_message().lock();
            if out.sent {
                continue;
            }
            let num_packets = out.message.num_packets();
            let data_per_packet = out.message.packet_data_length();
            let mut failed = false;
            while out.packets_sent < num_packets
                && u32::from(out.packets_sent) * data_per_packet < out.granted_bytes
            {
                let index = out.packets_sent;
                let emission = &mut *out;
                let Some(packet) = emission.message.packet_mut(index) else {
                    failed = true;
                    break;
                };
                if let Err(e) = self.driver.send_packets(std::slice::from_mut(packet)) {
                    warn!(%id, error = %e, "failed to send DATA packet");
                    failed = true;
                    break;
                }
                emission.packets_sent += 1;
            }

            if failed {
                drop(out);
                op.store_state(OpState::Failed);
                self.update_hints.hint(&op);
                continue;
            }
            if out.packets_sent == num_packets {
                out.sent = true;
                drop(out);
                self.update_hints.hint(&op);
            }
        }
    }

    /// Forget the outbound entry of a destroyed op.
    pub fn drop_message(&self, id: MessageId) {
        self.inner.lock().outbound.remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn outbound_len(&self) -> usize {
        self.inner.lock().outbound.len()
    }
}
