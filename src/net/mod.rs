//! Wire format, message definitions and the transport seam

pub mod protocol;
pub mod transport;
pub mod wire;

pub use protocol::{InputCommand, MessageKind, ProtocolError, INPUT_ID_TAG};
pub use transport::{Endpoint, Envelope, LoopbackNetwork, Outbox, PeerId, Transport};
pub use wire::{StringHash, Value, ValueType, VariantMap, WireError, WireReader};
