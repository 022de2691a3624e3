//! Client-side prediction and server reconciliation
//!
//! The client applies its own input immediately, remembers it, and once the
//! server reports the last input it applied, throws away everything up to
//! that id and replays the rest on top of the received snapshot. The server
//! keeps a queue of received input per connection and periodically sends
//! each connection its scene's snapshot stamped with its last applied id.

pub mod client;
pub mod input_buffer;
pub mod sequence;
pub mod server;
pub mod snapshot;

pub use client::{ClientConfig, ClientPredictor, ClientStats, LocalInputFn};
pub use input_buffer::{InputBuffer, DEFAULT_INPUT_CAPACITY};
pub use sequence::{is_more_recent, SequenceCounter, SequenceId};
pub use server::{
    ClientInputFn, ConnectionRecord, InputDisposition, PeerRole, ServerConfig, ServerReconciler,
    TickReport,
};
pub use snapshot::{
    read_ack, read_scene, stamp_ack, write_scene, ApplyReport, ComponentState, EntityState,
    SceneState, SnapshotError, SnapshotStats, ACK_SLOT_LEN,
};
