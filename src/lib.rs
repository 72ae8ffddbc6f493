//! # oprpc - receiver-driven request/reply transport
//!
//! This crate implements a low-latency datacenter transport that carries
//! discrete request/reply operations ("ops") over an unreliable packet
//! driver, with receiver-driven grant scheduling in the style of Homa.
//!
//! ## Features
//!
//! - **Op-based API**: each op pairs one outbound message with an optional
//!   inbound message; server ops can reply directly or chain further
//!   requests on behalf of the originating op
//! - **Receiver-driven scheduling**: inbound messages are paced by GRANT
//!   packets issued per accepted data packet
//! - **Poll-driven core**: no operation blocks; a single polling context
//!   drives packet processing while application threads retain and release
//!   ops concurrently
//! - **Driver abstraction**: any packet-oriented driver works; an
//!   in-process loopback driver ships for tests
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use oprpc::{FakeNetwork, Transport, TransportConfig};
//!
//! let network = FakeNetwork::new();
//! let client = Transport::new(network.new_driver(), 1, TransportConfig::default());
//! let server = Transport::new(network.new_driver(), 2, TransportConfig::default());
//!
//! // Client: issue a remote op.
//! let op = client.alloc_op();
//! op.append(b"ping")?;
//! client.send_request(&op, server.driver().local_address())?;
//!
//! // Server: poll, take the op, reply.
//! server.poll();
//! if let Some(server_op) = server.receive_op() {
//!     server_op.append(&server_op.payload().unwrap())?;
//!     server.send_reply(&server_op)?;
//!     server.release_op(&server_op);
//! }
//!
//! // Client: poll until the op completes, then read the response.
//! client.poll();
//! let response = op.payload();
//! client.release_op(&op);
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`]: message ids, opcodes, and wire headers
//! - [`driver`]: the packet driver contract
//! - [`message`]: packetized byte buffers with a typed header prefix
//! - [`receiver`]: packet-to-message reassembly and demultiplexing
//! - [`sender`]: granted emission of outbound messages
//! - [`scheduler`]: receiver-driven rate control
//! - [`transport`]: the op state machine and the poll loop
//! - [`fake`]: in-process loopback driver for tests
//!
//! ## References
//!
//! - [Homa: A Receiver-Driven Low-Latency Transport Protocol Using Network
//!   Priorities (SIGCOMM 2018)](https://dl.acm.org/doi/10.1145/3230543.3230564)

pub mod config;
pub mod driver;
pub mod error;
pub mod fake;
pub mod message;
pub mod pool;
pub mod protocol;
pub mod receiver;
pub mod scheduler;
pub mod sender;
pub mod sync;
pub mod transport;

// Re-export main types
pub use config::TransportConfig;
pub use driver::{Driver, Packet, RawAddress, WireAddress};
pub use error::{Error, Result};
pub use fake::{FakeAddress, FakeDriver, FakeNetwork, NUM_PRIORITIES};
pub use message::{Message, MAX_MESSAGE_PACKETS};
pub use pool::ObjectPool;
pub use protocol::{
    MessageId, Opcode, OpId, DATA_HEADER_SIZE, INITIAL_REQUEST_TAG, ULTIMATE_RESPONSE_TAG,
};
pub use receiver::{InboundMessage, Receiver};
pub use scheduler::{GrantScheduler, Scheduler};
pub use sender::{OutboundMessage, Sender};
pub use sync::{SpinLock, SpinLockGuard};
pub use transport::{Op, OpState, Transport, UpdateHints};
