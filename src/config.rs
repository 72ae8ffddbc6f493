//! Configuration types for oprpc.

/// Transport configuration.
///
/// Controls batching and the grant windows used by the receiver-driven
/// scheduler.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum number of packets pulled from the driver per poll.
    /// Default: 32
    pub recv_batch_size: usize,
    /// Bytes of a new outbound message that may be sent before the first
    /// GRANT arrives. Clamped up to at least one packet of data.
    /// Default: 10000
    pub unscheduled_byte_limit: u32,
    /// Bytes granted past the received prefix of an incomplete inbound
    /// message on each accepted packet.
    /// Default: 10000
    pub grant_window: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_batch_size: 32,
            unscheduled_byte_limit: 10_000,
            grant_window: 10_000,
        }
    }
}

impl TransportConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the receive batch size.
    pub fn with_recv_batch_size(mut self, recv_batch_size: usize) -> Self {
        self.recv_batch_size = recv_batch_size;
        self
    }

    /// Set the unscheduled byte limit.
    pub fn with_unscheduled_byte_limit(mut self, unscheduled_byte_limit: u32) -> Self {
        self.unscheduled_byte_limit = unscheduled_byte_limit;
        self
    }

    /// Set the grant window.
    pub fn with_grant_window(mut self, grant_window: u32) -> Self {
        self.grant_window = grant_window;
        self
    }
}
