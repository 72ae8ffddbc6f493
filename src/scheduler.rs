//! Receiver-driven grant scheduling.
//!
//! The receiver reports every accepted data packet to a [`Scheduler`], which
//! decides how much more of each incomplete message the remote sender may
//! emit. The shipped [`GrantScheduler`] keeps a fixed window of granted
//! bytes ahead of the received prefix; smarter pacing policies implement the
//! same trait.

use std::sync::Arc;

use tracing::warn;

use crate::driver::Driver;
use crate::protocol::{CommonHeader, GrantHeader, MessageId, Opcode};

/// Rate-control policy fed by the receiver.
pub trait Scheduler<D: Driver>: Send + Sync {
    /// Called once per accepted data packet, in acceptance order.
    fn packet_received(
        &self,
        id: MessageId,
        source: &D::Address,
        message_length: u32,
        bytes_received: u32,
    );

    /// Incremental pacing work; called once per transport poll.
    fn poll(&self);
}

/// Grants a fixed byte window past the received prefix of every incomplete
/// message.
pub struct GrantScheduler<D: Driver> {
    driver: Arc<D>,
    grant_window: u32,
}

impl<D: Driver> GrantScheduler<D> {
    pub fn new(driver: Arc<D>, grant_window: u32) -> Self {
        Self {
            driver,
            grant_window,
        }
    }
}

impl<D: Driver> Scheduler<D> for GrantScheduler<D> {
    fn packet_received(
        &self,
        id: MessageId,
        source: &D::Address,
        message_length: u32,
        bytes_received: u32,
    ) {
        if bytes_received >= message_length {
            // Complete message; nothing left to authorize.
            return;
        }
        let offset = message_length.min(bytes_received.saturating_add(self.grant_window));
        let header = GrantHeader {
            common: CommonHeader {
                opcode: Opcode::Grant,
                message_id: id,
            },
            offset,
        };
        let mut packet = self.driver.alloc_packet();
        let mut buf = [0u8; GrantHeader::SERIALIZED_SIZE];
        header.ser(&mut buf.as_mut_slice());
        packet.payload.extend_from_slice(&buf);
        packet.address = Some(source.clone());
        // Grants must never queue behind bulk data.
        packet.priority = self.driver.highest_packet_priority();
        if let Err(e) = self.driver.send_packets(std::slice::from_mut(&mut packet)) {
            warn!(%id, error = %e, "failed to send GRANT");
        }
        self.driver.release_packets(vec![packet]);
    }

    fn poll(&self) {}
}
