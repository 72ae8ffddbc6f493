//! Op lifecycle and the transport poll loop.
//!
//! An [`Op`] joins one outbound message and, optionally, one inbound message.
//! Application threads hold retained ops; a single polling context drives
//! packet processing, the op state machine, and reclamation. State-machine
//! re-evaluation is requested through a deduplicated hint queue rather than
//! by scanning every op per poll.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::pool::ObjectPool;
use crate::protocol::{
    CommonHeader, DoneHeader, MessageHeader, MessageId, Opcode, OpId, INITIAL_REQUEST_TAG,
    ULTIMATE_RESPONSE_TAG,
};
use crate::receiver::{InboundMessage, InboundSnapshot, Receiver};
use crate::scheduler::{GrantScheduler, Scheduler};
use crate::sender::{OutboundMessage, Sender};
use crate::sync::SpinLock;

/// Lifecycle state of an op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpState {
    NotStarted = 0,
    InProgress = 1,
    Completed = 2,
    Failed = 3,
}

/// Guarded by the op mutex: whether the op may be recycled.
struct Lifecycle {
    destroy: bool,
}

/// One request/reply operation.
///
/// Not safe for concurrent calls against the *same* op; the per-op handle
/// abstractions built on top of the transport maintain that restriction.
pub struct Op<D: Driver> {
    is_server_op: AtomicBool,
    state: AtomicU8,
    /// True while the application holds a handle to this op.
    retained: AtomicBool,
    /// The op mutex: guards state transitions and the drop body. Never held
    /// while acquiring a receiver or message lock.
    lifecycle: SpinLock<Lifecycle>,
    out_message: SpinLock<OutboundMessage<D>>,
    in_message: SpinLock<Option<Arc<InboundMessage<D>>>>,
}

impl<D: Driver> Op<D> {
    pub(crate) fn new(driver: &Arc<D>, is_server_op: bool) -> Self {
        Self {
            is_server_op: AtomicBool::new(is_server_op),
            state: AtomicU8::new(OpState::NotStarted.into()),
            retained: AtomicBool::new(false),
            lifecycle: SpinLock::new(Lifecycle { destroy: false }),
            out_message: SpinLock::new(OutboundMessage::new(Arc::clone(driver))),
            in_message: SpinLock::new(None),
        }
    }

    /// Prepare a (possibly recycled) op for a new life.
    pub(crate) fn reset(&self, is_server_op: bool, driver: &Arc<D>) {
        self.is_server_op.store(is_server_op, Ordering::Relaxed);
        self.state.store(OpState::NotStarted.into(), Ordering::Release);
        self.retained.store(false, Ordering::Release);
        self.lifecycle.lock().destroy = false;
        *self.out_message.lock() = OutboundMessage::new(Arc::clone(driver));
        *self.in_message.lock() = None;
    }

    /// Current state of the op's state machine.
    pub fn state(&self) -> OpState {
        OpState::try_from_primitive(self.state.load(Ordering::Acquire))
            .unwrap_or(OpState::NotStarted)
    }

    pub(crate) fn store_state(&self, state: OpState) {
        self.state.store(state.into(), Ordering::Release);
    }

    /// Whether this op serves a request that originated elsewhere.
    pub fn is_server_op(&self) -> bool {
        self.is_server_op.load(Ordering::Relaxed)
    }

    pub fn is_retained(&self) -> bool {
        self.retained.load(Ordering::Acquire)
    }

    pub(crate) fn set_retained(&self, retained: bool) {
        self.retained.store(retained, Ordering::Release);
    }

    pub(crate) fn in_message(&self) -> Option<Arc<InboundMessage<D>>> {
        self.in_message.lock().clone()
    }

    pub(crate) fn set_in_message(&self, message: Option<Arc<InboundMessage<D>>>) {
        *self.in_message.lock() = message;
    }

    pub(crate) fn take_in_message(&self) -> Option<Arc<InboundMessage<D>>> {
        self.in_message.lock().take()
    }

    pub(crate) fn out_message(&self) -> &SpinLock<OutboundMessage<D>> {
        &self.out_message
    }

    /// Append payload bytes to the outbound message.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        self.out_message.lock().message_mut().append(data)
    }

    /// Copy of the inbound message payload, once fully received.
    pub fn payload(&self) -> Option<Vec<u8>> {
        self.in_message()?.payload()
    }
}

struct HintQueue<D: Driver> {
    order: VecDeque<Arc<Op<D>>>,
    members: FxHashSet<usize>,
}

/// Set-indexed FIFO of "please re-evaluate this op" signals.
///
/// An op is enqueued at most once at any time; the queue is drained once per
/// poll.
pub struct UpdateHints<D: Driver> {
    inner: SpinLock<HintQueue<D>>,
}

impl<D: Driver> UpdateHints<D> {
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(HintQueue {
                order: VecDeque::new(),
                members: FxHashSet::default(),
            }),
        }
    }

    pub(crate) fn hint(&self, op: &Arc<Op<D>>) {
        let mut queue = self.inner.lock();
        if queue.members.insert(op_key(op)) {
            queue.order.push_back(Arc::clone(op));
        }
    }

    pub(crate) fn next(&self) -> Option<Arc<Op<D>>> {
        let mut queue = self.inner.lock();
        let op = queue.order.pop_front()?;
        queue.members.remove(&op_key(&op));
        Some(op)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, op: &Arc<Op<D>>) -> bool {
        self.inner.lock().members.contains(&op_key(op))
    }

    #[cfg(test)]
    pub(crate) fn drain_for_test(&self) {
        let mut queue = self.inner.lock();
        queue.order.clear();
        queue.members.clear();
    }
}

impl<D: Driver> Default for UpdateHints<D> {
    fn default() -> Self {
        Self::new()
    }
}

fn op_key<D: Driver>(op: &Arc<Op<D>>) -> usize {
    Arc::as_ptr(op) as usize
}

struct OpTable<D: Driver> {
    pool: ObjectPool<Op<D>>,
    /// Keys of ops currently owned by the transport; hints for ops outside
    /// this set are stale and must be discarded.
    active: FxHashSet<usize>,
}

/// A request/reply transport instance bound to one driver.
pub struct Transport<D: Driver> {
    driver: Arc<D>,
    transport_id: u64,
    config: TransportConfig,
    /// Sequence number for the next remote op this transport initiates.
    next_op_sequence: AtomicU64,
    receiver: Receiver<D>,
    sender: Sender<D>,
    update_hints: Arc<UpdateHints<D>>,
    ops: SpinLock<OpTable<D>>,
    /// Server ops ready for the application, FIFO.
    pending_server_ops: SpinLock<VecDeque<Arc<Op<D>>>>,
    /// Ops marked for destruction, reclaimed at the end of each poll.
    unused_ops: SpinLock<VecDeque<Arc<Op<D>>>>,
}

impl<D: Driver> Transport<D> {
    /// Create a transport with the default grant scheduler.
    pub fn new(driver: Arc<D>, transport_id: u64, config: TransportConfig) -> Self {
        let scheduler: Arc<dyn Scheduler<D>> = Arc::new(GrantScheduler::new(
            Arc::clone(&driver),
            config.grant_window,
        ));
        Self::with_scheduler(driver, transport_id, config, scheduler)
    }

    /// Create a transport with a custom scheduler implementation.
    pub fn with_scheduler(
        driver: Arc<D>,
        transport_id: u64,
        config: TransportConfig,
        scheduler: Arc<dyn Scheduler<D>>,
    ) -> Self {
        let update_hints = Arc::new(UpdateHints::new());
        let receiver = Receiver::new(Arc::clone(&driver), scheduler);
        let sender = Sender::new(
            Arc::clone(&driver),
            Arc::clone(&update_hints),
            config.unscheduled_byte_limit,
        );
        Self {
            driver,
            transport_id,
            config,
            next_op_sequence: AtomicU64::new(0),
            receiver,
            sender,
            update_hints,
            ops: SpinLock::new(OpTable {
                pool: ObjectPool::new(),
                active: FxHashSet::default(),
            }),
            pending_server_ops: SpinLock::new(VecDeque::new()),
            unused_ops: SpinLock::new(VecDeque::new()),
        }
    }

    /// Driver from which this transport sends and receives packets.
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn transport_id(&self) -> u64 {
        self.transport_id
    }

    /// Allocate a retained op for initiating a remote operation.
    pub fn alloc_op(&self) -> Arc<Op<D>> {
        let op = self.construct_op(false);
        op.out_message
            .lock()
            .message_mut()
            .reserve_header(MessageHeader::SERIALIZED_SIZE as u32);
        op.set_retained(true);
        op
    }

    /// Take the next server op whose request has fully arrived, if any.
    pub fn receive_op(&self) -> Option<Arc<Op<D>>> {
        let op = self.pending_server_ops.lock().pop_front()?;
        op.set_retained(true);
        op.out_message
            .lock()
            .message_mut()
            .reserve_header(MessageHeader::SERIALIZED_SIZE as u32);
        Some(op)
    }

    /// Return an op to the transport. Destruction happens on a later poll,
    /// once the op's protocol obligations are complete.
    pub fn release_op(&self, op: &Arc<Op<D>>) {
        op.set_retained(false);
        self.update_hints.hint(op);
    }

    /// Send the op's outbound message as a request.
    ///
    /// On a server op this issues a chained request on behalf of the op's
    /// inbound request; it may be called at most once per op, and derives the
    /// outgoing id from the inbound tag without modifying it. On a remote op
    /// it assigns a fresh op id, registers the expected ultimate response,
    /// and transitions the op to `InProgress`.
    pub fn send_request(&self, op: &Arc<Op<D>>, destination: D::Address) -> Result<()> {
        if op.is_server_op() {
            let message = op.in_message().ok_or(Error::NoInboundMessage)?;
            let id = message.id();
            let chained = MessageId::new(id.op_id(), id.tag + 1);
            self.sender.send_message(chained, destination, op, true);
        } else {
            let op_id = OpId {
                transport_id: self.transport_id,
                sequence: self.next_op_sequence.fetch_add(1, Ordering::Relaxed),
            };
            // Register before handing the request to the sender: a response
            // must never find its id unregistered.
            self.receiver
                .register_op(MessageId::new(op_id, ULTIMATE_RESPONSE_TAG), op);
            op.store_state(OpState::InProgress);
            self.sender.send_message(
                MessageId::new(op_id, INITIAL_REQUEST_TAG),
                destination,
                op,
                false,
            );
        }
        Ok(())
    }

    /// Send the op's outbound message as the ultimate response of a server
    /// op, addressed to the origin recorded in the inbound message header.
    pub fn send_reply(&self, op: &Arc<Op<D>>) -> Result<()> {
        if !op.is_server_op() {
            return Err(Error::NotServerOp);
        }
        let message = op.in_message().ok_or(Error::NoInboundMessage)?;
        let header = message.message_header()?;
        let reply_address = self.driver.get_address_raw(&header.reply_address)?;
        let reply_id = MessageId::new(message.id().op_id(), ULTIMATE_RESPONSE_TAG);
        self.sender.send_message(reply_id, reply_address, op, false);
        op.store_state(OpState::InProgress);
        Ok(())
    }

    /// Drive the transport: process packets, tick the sender, receiver, and
    /// scheduler, adopt new server ops, run hinted state machines, and
    /// reclaim destroyed ops.
    pub fn poll(&self) {
        self.process_packets();
        self.sender.poll();
        self.receiver.poll();
        self.process_inbound_messages();
        self.check_for_updates();
        self.cleanup_ops();
    }

    fn construct_op(&self, is_server_op: bool) -> Arc<Op<D>> {
        let mut table = self.ops.lock();
        let op = table
            .pool
            .construct_with(|| Op::new(&self.driver, is_server_op));
        op.reset(is_server_op, &self.driver);
        table.active.insert(op_key(&op));
        op
    }

    fn process_packets(&self) {
        let mut batch = Vec::with_capacity(self.config.recv_batch_size);
        self.driver
            .receive_packets(self.config.recv_batch_size, &mut batch);
        for packet in batch {
            match CommonHeader::peek_opcode(&packet.payload) {
                Ok(Opcode::Data) => {
                    if let Some(op) = self.receiver.handle_data_packet(packet) {
                        self.update_hints.hint(&op);
                    }
                }
                Ok(Opcode::Grant) => self.sender.handle_grant_packet(packet),
                Ok(Opcode::Done) => self.sender.handle_done_packet(packet),
                Err(e) => {
                    warn!(error = %e, "dropping packet with unrecognized opcode");
                    self.driver.release_packets(vec![packet]);
                }
            }
        }
    }

    fn process_inbound_messages(&self) {
        while let Some(message) = self.receiver.receive_message() {
            let id = message.id();
            if id.tag == ULTIMATE_RESPONSE_TAG {
                // A response nobody registered for; the op is long gone.
                debug!(%id, "dropping unexpected response message");
                self.receiver.drop_message(&message);
            } else {
                // An initial or chained request becomes a new server op.
                let op = self.construct_op(true);
                self.receiver.register_op(id, &op);
                self.update_hints.hint(&op);
                debug!(%id, "adopted server op");
            }
        }
    }

    fn check_for_updates(&self) {
        while let Some(op) = self.update_hints.next() {
            if !self.ops.lock().active.contains(&op_key(&op)) {
                // Stale hint: the op was destroyed after being hinted.
                continue;
            }
            // Snapshot the inbound side before taking the op mutex; the op
            // mutex is never held while acquiring a message lock.
            let inbound = op.in_message().map(|message| message.snapshot());
            let done_signal = {
                let mut lifecycle = op.lifecycle.lock();
                self.process_updates(&op, &mut lifecycle, inbound.as_ref())
            };
            if let Some((id, source)) = done_signal {
                self.send_done(id, source);
            }
        }
    }

    /// Advance the op's state machine. Returns the DONE notification to
    /// emit, if the transition calls for one.
    fn process_updates(
        &self,
        op: &Arc<Op<D>>,
        lifecycle: &mut Lifecycle,
        inbound: Option<&InboundSnapshot<D>>,
    ) -> Option<(MessageId, D::Address)> {
        if lifecycle.destroy {
            return None;
        }
        let mut done_signal = None;
        if op.is_server_op() {
            match op.state() {
                OpState::NotStarted => {
                    if inbound.is_some_and(|snapshot| snapshot.ready) {
                        op.store_state(OpState::InProgress);
                        self.pending_server_ops.lock().push_back(Arc::clone(op));
                    }
                }
                OpState::InProgress => {
                    if op.out_message.lock().is_done() {
                        if let Some(snapshot) = inbound {
                            if snapshot.id.tag != INITIAL_REQUEST_TAG {
                                // Signal the previous hop that its chained
                                // request has completed end-to-end.
                                if let Some(source) = snapshot.source.clone() {
                                    done_signal = Some((snapshot.id, source));
                                }
                            }
                        }
                        op.store_state(OpState::Completed);
                        self.update_hints.hint(op);
                    }
                }
                OpState::Completed | OpState::Failed => {
                    if !op.is_retained() {
                        self.drop_op_locked(op, lifecycle);
                    }
                }
            }
        } else {
            if !op.is_retained() {
                self.drop_op_locked(op, lifecycle);
                return None;
            }
            if op.state() == OpState::InProgress && inbound.is_some_and(|snapshot| snapshot.ready)
            {
                op.store_state(OpState::Completed);
                self.update_hints.hint(op);
            }
        }
        done_signal
    }

    /// Mark the op for destruction. Idempotent; the op enters the reclaim
    /// queue exactly once.
    fn drop_op_locked(&self, op: &Arc<Op<D>>, lifecycle: &mut Lifecycle) {
        if lifecycle.destroy {
            return;
        }
        lifecycle.destroy = true;
        self.unused_ops.lock().push_back(Arc::clone(op));
    }

    fn cleanup_ops(&self) {
        loop {
            let op = { self.unused_ops.lock().pop_front() };
            let Some(op) = op else {
                break;
            };
            // Release everything the op pinned in the receiver and sender.
            if op.in_message().is_some() {
                self.receiver.drop_op(&op);
            }
            let out_id = op.out_message.lock().id;
            if let Some(id) = out_id {
                self.sender.drop_message(id);
            }
            // Hand the outbound message's packets back to the driver now
            // rather than when the record is eventually recycled.
            op.reset(false, &self.driver);
            let mut table = self.ops.lock();
            table.active.remove(&op_key(&op));
            table.pool.destroy(op);
        }
    }

    fn send_done(&self, id: MessageId, source: D::Address) {
        let header = DoneHeader {
            common: CommonHeader {
                opcode: Opcode::Done,
                message_id: id,
            },
        };
        let mut buf = [0u8; DoneHeader::SERIALIZED_SIZE];
        header.ser(&mut buf.as_mut_slice());
        let mut packet = self.driver.alloc_packet();
        packet.payload.extend_from_slice(&buf);
        packet.address = Some(source);
        packet.priority = self.driver.highest_packet_priority();
        if let Err(e) = self.driver.send_packets(std::slice::from_mut(&mut packet)) {
            warn!(%id, error = %e, "failed to send DONE");
        }
        self.driver.release_packets(vec![packet]);
    }

    #[cfg(test)]
    pub(crate) fn receiver(&self) -> &Receiver<D> {
        &self.receiver
    }

    #[cfg(test)]
    pub(crate) fn sender(&self) -> &Sender<D> {
        &self.sender
    }

    #[cfg(test)]
    pub(crate) fn active_len(&self) -> usize {
        self.ops.lock().active.len()
    }

    #[cfg(test)]
    pub(crate) fn pool_outstanding(&self) -> usize {
        self.ops.lock().pool.outstanding()
    }

    #[cfg(test)]
    pub(crate) fn pending_server_len(&self) -> usize {
        self.pending_server_ops.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn unused_len(&self) -> usize {
        self.unused_ops.lock().len()
    }
}
