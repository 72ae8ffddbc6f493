//! Packet-to-message demultiplexing and reassembly.
//!
//! The [`Receiver`] owns every inbound message. A message is either
//! *registered* (bound to an op expecting it) or *unregistered* (accumulating
//! until the transport adopts or drops it); it is never both. Newly created
//! unregistered messages are also queued FIFO for the transport to discover
//! via [`receive_message`](Receiver::receive_message).

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::driver::{Driver, Packet};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::pool::ObjectPool;
use crate::protocol::{DataHeader, MessageHeader, MessageId, DATA_HEADER_SIZE};
use crate::scheduler::Scheduler;
use crate::sync::SpinLock;
use crate::transport::Op;

/// Reassembly state for one received message.
pub struct InboundMessage<D: Driver> {
    state: SpinLock<InboundState<D>>,
}

struct InboundState<D: Driver> {
    /// Stable once the message is published to the receiver's tables.
    id: MessageId,
    /// Driver-owned source handle; never the short-lived address attached
    /// to an incoming packet.
    source: Option<D::Address>,
    /// Constructed on the first data packet, which carries the total length.
    message: Option<Message<D>>,
    full_message_received: bool,
}

/// Lock-free-readable copy of the fields the op state machine needs.
pub(crate) struct InboundSnapshot<D: Driver> {
    pub(crate) id: MessageId,
    pub(crate) ready: bool,
    pub(crate) source: Option<D::Address>,
}

impl<D: Driver> InboundMessage<D> {
    pub(crate) fn new() -> Self {
        Self {
            state: SpinLock::new(InboundState {
                id: MessageId::default(),
                source: None,
                message: None,
                full_message_received: false,
            }),
        }
    }

    /// Id of this message.
    pub fn id(&self) -> MessageId {
        self.state.lock().id
    }

    /// True once every byte of the message has been received.
    pub fn is_ready(&self) -> bool {
        self.state.lock().full_message_received
    }

    /// The resolved source address, once the first packet has arrived.
    pub fn source(&self) -> Option<D::Address> {
        self.state.lock().source.clone()
    }

    /// Copy of the message payload (everything after the message header),
    /// available once the message is fully received.
    pub fn payload(&self) -> Option<Vec<u8>> {
        let guard = self.state.lock();
        if !guard.full_message_received {
            return None;
        }
        let message = guard.message.as_ref()?;
        let header_length = MessageHeader::SERIALIZED_SIZE as u32;
        let mut buf = vec![0u8; message.raw_length().saturating_sub(header_length) as usize];
        let copied = message.read(header_length, &mut buf);
        buf.truncate(copied);
        Some(buf)
    }

    /// Parse the typed message header prefix.
    pub(crate) fn message_header(&self) -> Result<MessageHeader> {
        let guard = self.state.lock();
        let message = guard.message.as_ref().ok_or(Error::MissingHeader)?;
        let prefix = message
            .prefix(MessageHeader::SERIALIZED_SIZE as u32)
            .ok_or(Error::MissingHeader)?;
        MessageHeader::deser(&mut &*prefix)
    }

    pub(crate) fn snapshot(&self) -> InboundSnapshot<D> {
        let guard = self.state.lock();
        InboundSnapshot {
            id: guard.id,
            ready: guard.full_message_received,
            source: guard.source.clone(),
        }
    }

    /// Prepare a (possibly recycled) record for a new message id.
    pub(crate) fn reset(&self, id: MessageId) {
        let mut guard = self.state.lock();
        guard.id = id;
        guard.source = None;
        guard.message = None;
        guard.full_message_received = false;
    }

    #[cfg(test)]
    pub(crate) fn set_ready(&self, ready: bool) {
        self.state.lock().full_message_received = ready;
    }

    #[cfg(test)]
    pub(crate) fn set_source(&self, source: Option<D::Address>) {
        self.state.lock().source = source;
    }

    #[cfg(test)]
    pub(crate) fn install_message(&self, message: Message<D>) {
        self.state.lock().message = Some(message);
    }
}

struct ReceiverState<D: Driver> {
    /// Messages bound to an op expecting them, keyed by id.
    registered_ops: FxHashMap<MessageId, Arc<Op<D>>>,
    /// Messages accumulating without an owning op, keyed by id.
    unregistered_messages: FxHashMap<MessageId, Arc<InboundMessage<D>>>,
    /// Unregistered messages not yet surfaced to the transport, FIFO by
    /// first-packet arrival.
    received_messages: VecDeque<Arc<InboundMessage<D>>>,
    message_pool: ObjectPool<InboundMessage<D>>,
}

/// Receives data packets and forms them into messages.
pub struct Receiver<D: Driver> {
    driver: Arc<D>,
    scheduler: Arc<dyn Scheduler<D>>,
    inner: SpinLock<ReceiverState<D>>,
}

impl<D: Driver> Receiver<D> {
    pub fn new(driver: Arc<D>, scheduler: Arc<dyn Scheduler<D>>) -> Self {
        Self {
            driver,
            scheduler,
            inner: SpinLock::new(ReceiverState {
                registered_ops: FxHashMap::default(),
                unregistered_messages: FxHashMap::default(),
                received_messages: VecDeque::new(),
                message_pool: ObjectPool::new(),
            }),
        }
    }

    /// Process an incoming DATA packet.
    ///
    /// Returns the op whose message this packet completed, if any; partial
    /// progress and unregistered messages return `None`.
    pub fn handle_data_packet(&self, packet: Packet<D::Address>) -> Option<Arc<Op<D>>> {
        let header = match DataHeader::deser(&mut &packet.payload[..]) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "dropping malformed DATA packet");
                self.driver.release_packets(vec![packet]);
                return None;
            }
        };
        let id = header.common.message_id;

        let mut state = self.inner.lock();
        let mut op = None;
        let message = if let Some(registered) = state.registered_ops.get(&id) {
            let registered = Arc::clone(registered);
            match registered.in_message() {
                Some(message) => {
                    op = Some(registered);
                    message
                }
                None => {
                    debug_assert!(false, "registered op without inbound message");
                    drop(state);
                    self.driver.release_packets(vec![packet]);
                    return None;
                }
            }
        } else if let Some(message) = state.unregistered_messages.get(&id) {
            Arc::clone(message)
        } else {
            let message = state.message_pool.construct_with(InboundMessage::new);
            // Touching the record before it is externalized is safe.
            message.reset(id);
            state.unregistered_messages.insert(id, Arc::clone(&message));
            state.received_messages.push_back(Arc::clone(&message));
            message
        };

        // Hand-over-hand: take the message lock before releasing the
        // receiver lock, so the message cannot be dropped underneath us and
        // the address resolution below does not serialize the receiver.
        let mut guard = message.state.lock();
        drop(state);

        if guard.message.is_none() {
            let Some(packet_source) = packet.address.clone() else {
                warn!(%id, "DATA packet without source address");
                self.driver.release_packets(vec![packet]);
                return None;
            };
            // Resolve a driver-owned handle; the one attached to the packet
            // goes away when the packet does.
            let source = match self.driver.get_address(&packet_source.to_string()) {
                Ok(source) => source,
                Err(e) => {
                    warn!(%id, error = %e, "cannot resolve packet source");
                    self.driver.release_packets(vec![packet]);
                    return None;
                }
            };
            guard.source = Some(source);
            guard.message = Some(Message::new(
                Arc::clone(&self.driver),
                DATA_HEADER_SIZE as u32,
                header.total_length,
            ));
        }

        // All packets already received; must be a duplicate.
        if guard.full_message_received {
            self.driver.release_packets(vec![packet]);
            return None;
        }

        let source = guard.source.clone();
        let Some(message) = guard.message.as_mut() else {
            self.driver.release_packets(vec![packet]);
            return None;
        };

        // Things that must hold for a well-behaved peer.
        debug_assert_eq!(message.raw_length(), header.total_length);
        if let (Some(stored), Some(from)) = (source.as_ref(), packet.address.as_ref()) {
            debug_assert_eq!(stored.to_string(), from.to_string());
        }

        match message.set_packet(header.index, packet) {
            Ok(()) => {
                // Whole-packet accounting over-counts the final short packet,
                // but once that packet lands no further grants matter.
                let received = message.packet_data_length() * u32::from(message.num_packets());
                let raw_length = message.raw_length();
                if let Some(source) = source.as_ref() {
                    self.scheduler
                        .packet_received(id, source, raw_length, received);
                }
                if received >= raw_length {
                    guard.full_message_received = true;
                    op
                } else {
                    None
                }
            }
            Err(duplicate) => {
                self.driver.release_packets(vec![duplicate]);
                None
            }
        }
    }

    /// Surface the next unregistered inbound message, FIFO by first-packet
    /// arrival. Each message is returned at most once; it may not be fully
    /// received yet.
    pub fn receive_message(&self) -> Option<Arc<InboundMessage<D>>> {
        self.inner.lock().received_messages.pop_front()
    }

    /// Drop a message obtained from [`receive_message`](Self::receive_message)
    /// that no op wants.
    pub fn drop_message(&self, message: &Arc<InboundMessage<D>>) {
        let mut state = self.inner.lock();
        let guard = message.state.lock();
        state.unregistered_messages.remove(&guard.id);
        drop(guard);
        state.message_pool.destroy(Arc::clone(message));
    }

    /// Declare that a message with `id` is expected and should accumulate
    /// into `op`. Adopts an already-accumulating unregistered message if one
    /// exists.
    pub fn register_op(&self, id: MessageId, op: &Arc<Op<D>>) {
        let mut state = self.inner.lock();
        let message = match state.unregistered_messages.remove(&id) {
            Some(message) => message,
            None => {
                let message = state.message_pool.construct_with(InboundMessage::new);
                message.reset(id);
                message
            }
        };
        op.set_in_message(Some(message));
        state.registered_ops.insert(id, Arc::clone(op));
    }

    /// Release the message registered to `op` and forget the registration.
    pub fn drop_op(&self, op: &Arc<Op<D>>) {
        let mut state = self.inner.lock();
        let Some(message) = op.take_in_message() else {
            return;
        };
        let guard = message.state.lock();
        state.registered_ops.remove(&guard.id);
        drop(guard);
        state.message_pool.destroy(message);
    }

    /// Incremental background work.
    pub fn poll(&self) {
        self.scheduler.poll();
    }

    #[cfg(test)]
    pub(crate) fn registered_op(&self, id: MessageId) -> Option<Arc<Op<D>>> {
        self.inner.lock().registered_ops.get(&id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn unregistered_message(&self, id: MessageId) -> Option<Arc<InboundMessage<D>>> {
        self.inner.lock().unregistered_messages.get(&id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn unregistered_len(&self) -> usize {
        self.inner.lock().unregistered_messages.len()
    }

    #[cfg(test)]
    pub(crate) fn received_len(&self) -> usize {
        self.inner.lock().received_messages.len()
    }

    #[cfg(test)]
    pub(crate) fn pool_outstanding(&self) -> usize {
        self.inner.lock().message_pool.outstanding()
    }
}
