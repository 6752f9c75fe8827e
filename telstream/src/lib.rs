//! Wire-rate UDP capture into shared-memory ring buffers.
//!
//! Receivers decode digitiser packets through a [`format::PacketFormat`],
//! place each payload at its stream offset in the open block of a
//! [`ipc::RingBufferChannel`], and rotate blocks as the stream advances.
//! Downstream processes attach to the same channel as readers or viewers.

pub mod control;
pub mod format;
pub mod generate;
pub mod header;
pub mod ipc;
pub mod net;
pub mod receive;
pub mod stats;
mod trace;

pub use trace::init_tracing;
