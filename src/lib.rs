//! Client-side prediction and server reconciliation
//!
//! Clients apply their own input immediately and keep it buffered until the
//! authoritative server acknowledges it. Every STATE message carries the id of
//! the last input the server applied for that client, so the client can drop
//! acknowledged input, adopt the server's scene and replay what is still
//! in flight.
//!
//! - [`prediction::ClientPredictor`]: tags, buffers, sends and replays input
//! - [`prediction::ServerReconciler`]: queues input per connection and fans
//!   out one snapshot per scene on a fixed interval
//! - [`prediction::snapshot`]: the scene snapshot codec
//! - [`scene`]: the capabilities the engine has to provide
//! - [`net`]: wire primitives, message ids and the transport seam

pub mod config;
pub mod net;
pub mod prediction;
pub mod scene;
pub mod util;

pub use config::{Config, ConfigError};
pub use net::protocol::{InputCommand, MessageKind};
pub use net::transport::{PeerId, Transport};
pub use prediction::{
    ClientConfig, ClientPredictor, SequenceId, ServerConfig, ServerReconciler,
};
pub use scene::{EntityId, EntityRegistry, SceneId};
