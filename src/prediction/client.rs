//! Client half: optimistic input application and replay on snapshots

use bytes::BytesMut;
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use super::input_buffer::{InputBuffer, DEFAULT_INPUT_CAPACITY};
use super::sequence::{is_more_recent, SequenceCounter, SequenceId};
use super::snapshot::{read_ack, ApplyReport, SceneState, SnapshotError};
use crate::net::protocol::{InputCommand, MessageKind};
use crate::net::transport::{PeerId, Transport};
use crate::net::wire::WireReader;
use crate::scene::EntityRegistry;

/// Applies one input to the local scene with a fixed timestep
pub type LocalInputFn<R> = Box<dyn FnMut(&mut R, &InputCommand, f32)>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientConfig {
    /// Fixed timestep handed to the apply callback
    pub timestep: f32,
    /// Oldest input is dropped past this many unacknowledged inputs
    pub max_buffered_inputs: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timestep: 1.0 / 60.0,
            max_buffered_inputs: DEFAULT_INPUT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub inputs_sent: u64,
    pub snapshots_applied: u64,
    pub snapshots_rejected: u64,
    pub stale_acks: u64,
    pub inputs_replayed: u64,
}

#[derive(Debug, Clone, Copy)]
struct ServerLink {
    peer: PeerId,
    scene_loaded: bool,
}

/// Client-side predictor for one server connection
pub struct ClientPredictor<R: EntityRegistry> {
    config: ClientConfig,
    counter: SequenceCounter,
    server_ack_id: SequenceId,
    input_buffer: InputBuffer,
    server: Option<ServerLink>,
    apply_local_input: LocalInputFn<R>,
    message: BytesMut,
    stats: ClientStats,
}

impl<R: EntityRegistry> ClientPredictor<R> {
    pub fn new(
        config: ClientConfig,
        apply_local_input: impl FnMut(&mut R, &InputCommand, f32) + 'static,
    ) -> Self {
        Self {
            config,
            counter: SequenceCounter::new(),
            server_ack_id: SequenceId::NONE,
            input_buffer: InputBuffer::new(config.max_buffered_inputs),
            server: None,
            apply_local_input: Box::new(apply_local_input),
            message: BytesMut::with_capacity(64),
            stats: ClientStats::default(),
        }
    }

    /// Binds the predictor to a server connection. The scene is not loaded yet.
    pub fn connect(&mut self, server: PeerId) {
        self.reset();
        self.server = Some(ServerLink {
            peer: server,
            scene_loaded: false,
        });
        debug!(%server, "Prediction bound to server connection");
    }

    pub fn set_scene_loaded(&mut self, loaded: bool) {
        if let Some(link) = &mut self.server {
            link.scene_loaded = loaded;
        }
    }

    /// Drops the connection and every buffered input
    pub fn disconnect(&mut self) {
        if let Some(link) = self.server.take() {
            debug!(server = %link.peer, dropped = self.input_buffer.len(), "Prediction unbound");
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.counter = SequenceCounter::new();
        self.server_ack_id = SequenceId::NONE;
        self.input_buffer.clear();
    }

    /// Connected with the scene loaded
    pub fn is_ready(&self) -> bool {
        self.server.map_or(false, |link| link.scene_loaded)
    }

    pub fn server(&self) -> Option<PeerId> {
        self.server.map(|link| link.peer)
    }

    pub fn local_id(&self) -> SequenceId {
        self.counter.current()
    }

    pub fn server_ack_id(&self) -> SequenceId {
        self.server_ack_id
    }

    pub fn input_buffer(&self) -> &InputBuffer {
        &self.input_buffer
    }

    pub fn timestep(&self) -> f32 {
        self.config.timestep
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    /// Tags `input` with the next id, applies it locally, buffers it and
    /// sends it to the server.
    ///
    /// Does nothing and returns `None` until a server connection with a
    /// loaded scene exists.
    pub fn add_input(
        &mut self,
        mut input: InputCommand,
        scene: &mut R,
        transport: &mut impl Transport,
    ) -> Option<SequenceId> {
        let link = match self.server {
            Some(link) if link.scene_loaded => link,
            _ => {
                trace!("No server connection with a loaded scene, input ignored");
                return None;
            }
        };

        let id = self.counter.advance();
        input.stamp(id);

        self.message.clear();
        input.encode(&mut self.message);
        transport.send(link.peer, MessageKind::Input, &self.message);
        self.stats.inputs_sent += 1;

        (self.apply_local_input)(scene, &input, self.config.timestep);
        self.input_buffer.push(input);

        Some(id)
    }

    /// Entry point for messages from the transport
    pub fn handle_message(&mut self, from: PeerId, kind: MessageKind, payload: &[u8], scene: &mut R) {
        let Some(link) = self.server else {
            trace!(%from, ?kind, "Not connected, message ignored");
            return;
        };

        match kind {
            MessageKind::State if from == link.peer => {
                if let Err(e) = self.on_state_message(payload, scene) {
                    error!(%from, error = %e, "State message parsing aborted");
                }
            }
            MessageKind::State => {
                warn!(%from, server = %link.peer, "Received state from a peer that is not the server");
            }
            MessageKind::Input => {
                warn!(%from, "Received unexpected input message from server");
            }
        }
    }

    /// Adopts a STATE message and re-predicts.
    ///
    /// A message whose acknowledgment is older than the current one is
    /// dropped whole, scene body included, and an empty report is returned.
    /// The scene body is decoded in full before anything is touched, so a
    /// malformed message leaves the scene, the acknowledgment and the buffer
    /// as they were.
    pub fn on_state_message(
        &mut self,
        payload: &[u8],
        scene: &mut R,
    ) -> Result<ApplyReport, SnapshotError> {
        let mut reader = WireReader::new(payload);
        let ack = match read_ack(&mut reader) {
            Ok(ack) => ack,
            Err(e) => {
                self.stats.snapshots_rejected += 1;
                return Err(e.into());
            }
        };

        let newer = is_more_recent(ack, self.server_ack_id, self.counter.current());
        if !newer && ack != self.server_ack_id {
            trace!(%ack, current = %self.server_ack_id, "Stale state message dropped");
            self.stats.stale_acks += 1;
            return Ok(ApplyReport::default());
        }

        let state = match SceneState::decode(&mut reader, scene) {
            Ok(state) => state,
            Err(e) => {
                self.stats.snapshots_rejected += 1;
                return Err(e);
            }
        };

        if newer {
            self.server_ack_id = ack;
        }

        let report = state.apply(scene);
        self.stats.snapshots_applied += 1;
        self.predict(scene);
        Ok(report)
    }

    /// Drops acknowledged input and replays the rest on top of the current
    /// scene, oldest first. Returns the number of inputs replayed.
    pub fn predict(&mut self, scene: &mut R) -> usize {
        let dropped = self
            .input_buffer
            .prune(self.server_ack_id, self.counter.current());

        let apply = &mut self.apply_local_input;
        let timestep = self.config.timestep;
        for input in self.input_buffer.iter() {
            apply(scene, input, timestep);
        }

        let replayed = self.input_buffer.len();
        self.stats.inputs_replayed += replayed as u64;
        trace!(dropped, replayed, ack = %self.server_ack_id, "Predicted");
        replayed
    }
}
