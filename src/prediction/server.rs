//! Server half: per-connection input queues and periodic snapshot fan-out

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bytes::BytesMut;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::sequence::SequenceId;
use super::snapshot::{stamp_ack, write_scene, SnapshotStats};
use crate::net::protocol::{InputCommand, MessageKind};
use crate::net::transport::{PeerId, Transport};
use crate::scene::{EntityId, EntityRegistry, SceneId, SceneSource};
use crate::util::rate_limit::InputRateLimiter;
use crate::util::time::{interval_for, UpdateTimer, DEFAULT_PHYSICS_FPS, DEFAULT_UPDATE_FPS};

/// Applies one client input to the authoritative scene
pub type ClientInputFn<R> = Box<dyn FnMut(&mut R, &InputCommand, f32, PeerId)>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerConfig {
    /// Seconds between snapshot broadcasts
    pub update_interval: f32,
    /// Fixed timestep handed to the apply callback
    pub timestep: f32,
    /// Per-connection queue bound, oldest input dropped past it
    pub max_pending_inputs: usize,
    /// INPUT messages per second per connection, 0 = unlimited
    pub input_rate_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            update_interval: interval_for(DEFAULT_UPDATE_FPS),
            timestep: interval_for(DEFAULT_PHYSICS_FPS),
            max_pending_inputs: 64,
            input_rate_limit: 0,
        }
    }
}

/// What the remote end of a connection is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Client,
    Server,
}

/// Server-side state of one connection
#[derive(Debug)]
pub struct ConnectionRecord {
    role: PeerRole,
    scene: Option<SceneId>,
    last_applied_id: SequenceId,
    newest_received_id: Option<SequenceId>,
    pending: VecDeque<InputCommand>,
    limiter: Option<InputRateLimiter>,
    inputs_received: u64,
    inputs_dropped: u64,
}

impl ConnectionRecord {
    fn new(role: PeerRole, scene: Option<SceneId>, input_rate_limit: u32) -> Self {
        Self {
            role,
            scene,
            last_applied_id: SequenceId::default(),
            newest_received_id: None,
            pending: VecDeque::new(),
            limiter: InputRateLimiter::new(input_rate_limit),
            inputs_received: 0,
            inputs_dropped: 0,
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn scene(&self) -> Option<SceneId> {
        self.scene
    }

    /// Id of the last input the simulation consumed, sent back as the ack
    pub fn last_applied_id(&self) -> SequenceId {
        self.last_applied_id
    }

    pub fn newest_received_id(&self) -> Option<SequenceId> {
        self.newest_received_id
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_ids(&self) -> Vec<SequenceId> {
        self.pending.iter().map(|i| i.sequence_id).collect()
    }

    pub fn inputs_received(&self) -> u64 {
        self.inputs_received
    }

    pub fn inputs_dropped(&self) -> u64 {
        self.inputs_dropped
    }

    fn pop_input(&mut self) -> Option<InputCommand> {
        let input = self.pending.pop_front()?;
        self.last_applied_id = input.sequence_id;
        Some(input)
    }
}

/// Outcome of [`ServerReconciler::read_input`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDisposition {
    /// Appended to the connection's queue
    Queued,
    /// Not newer than an input already received
    Stale,
    /// Over the connection's input rate
    RateLimited,
    /// Sender is not a client
    Rejected,
    /// Payload failed to decode
    Malformed,
    /// No such connection
    UnknownPeer,
}

/// Result of one [`ServerReconciler::tick`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub snapshots_built: usize,
    pub messages_sent: usize,
}

/// Authoritative side of prediction for every connection of a server
pub struct ServerReconciler<R: EntityRegistry> {
    config: ServerConfig,
    connections: BTreeMap<PeerId, ConnectionRecord>,
    replicated: BTreeMap<SceneId, BTreeSet<EntityId>>,
    snapshots: BTreeMap<SceneId, BytesMut>,
    timer: UpdateTimer,
    apply_client_input: ClientInputFn<R>,
    snapshots_sent: u64,
    stats: SnapshotStats,
}

impl<R: EntityRegistry> ServerReconciler<R> {
    pub fn new(
        config: ServerConfig,
        apply_client_input: impl FnMut(&mut R, &InputCommand, f32, PeerId) + 'static,
    ) -> Self {
        Self {
            config,
            connections: BTreeMap::new(),
            replicated: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            timer: UpdateTimer::new(config.update_interval),
            apply_client_input: Box::new(apply_client_input),
            snapshots_sent: 0,
            stats: SnapshotStats::default(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    // Replication bookkeeping

    /// Registers an entity for replication in `scene`
    pub fn add_entity(&mut self, scene: SceneId, entity: EntityId) {
        if self.replicated.entry(scene).or_default().insert(entity) {
            debug!(%scene, %entity, "Entity replicated");
        }
    }

    pub fn remove_entity(&mut self, scene: SceneId, entity: EntityId) -> bool {
        let Some(ids) = self.replicated.get_mut(&scene) else {
            return false;
        };
        let removed = ids.remove(&entity);
        if ids.is_empty() {
            self.replicated.remove(&scene);
        }
        removed
    }

    /// Replicated entity ids of `scene`, ascending
    pub fn replicated_entities(&self, scene: SceneId) -> Vec<EntityId> {
        self.replicated
            .get(&scene)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    // Connections

    /// Opens a connection record, replacing any existing one for `peer`
    pub fn connect(&mut self, peer: PeerId, role: PeerRole, scene: Option<SceneId>) {
        let record = ConnectionRecord::new(role, scene, self.config.input_rate_limit);
        if self.connections.insert(peer, record).is_some() {
            warn!(%peer, "Connection record replaced");
        }
        info!(%peer, ?role, scene = ?scene, "Peer connected");
    }

    /// Moves a connection to another scene, or out of every scene
    pub fn set_scene(&mut self, peer: PeerId, scene: Option<SceneId>) -> bool {
        match self.connections.get_mut(&peer) {
            Some(record) => {
                record.scene = scene;
                debug!(%peer, scene = ?scene, "Connection scene changed");
                true
            }
            None => false,
        }
    }

    /// Drops the record and its queued inputs without applying them
    pub fn disconnect(&mut self, peer: PeerId) -> bool {
        match self.connections.remove(&peer) {
            Some(record) => {
                info!(
                    %peer,
                    discarded = record.pending.len(),
                    last_applied = %record.last_applied_id,
                    "Peer disconnected"
                );
                true
            }
            None => false,
        }
    }

    pub fn connection(&self, peer: PeerId) -> Option<&ConnectionRecord> {
        self.connections.get(&peer)
    }

    pub fn connections(&self) -> impl Iterator<Item = (PeerId, &ConnectionRecord)> {
        self.connections.iter().map(|(peer, record)| (*peer, record))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // Messages

    /// Entry point for messages from the transport
    pub fn handle_message(&mut self, from: PeerId, kind: MessageKind, payload: &[u8]) {
        match kind {
            MessageKind::Input => {
                self.read_input(from, payload);
            }
            MessageKind::State => {
                warn!(%from, "Received unexpected state message from peer");
            }
        }
    }

    /// Decodes an INPUT message and queues it if it is newer than anything
    /// received from the connection so far.
    pub fn read_input(&mut self, from: PeerId, payload: &[u8]) -> InputDisposition {
        let Some(record) = self.connections.get_mut(&from) else {
            warn!(%from, "Input from unknown peer");
            return InputDisposition::UnknownPeer;
        };

        if record.role != PeerRole::Client {
            warn!(%from, "Received unexpected input message from server");
            return InputDisposition::Rejected;
        }

        if let Some(limiter) = &record.limiter {
            if !limiter.check() {
                record.inputs_dropped += 1;
                debug!(%from, "Input rate limited");
                return InputDisposition::RateLimited;
            }
        }

        let input = match InputCommand::decode(payload) {
            Ok(input) => input,
            Err(e) => {
                record.inputs_dropped += 1;
                warn!(%from, error = %e, "Malformed input message");
                return InputDisposition::Malformed;
            }
        };

        let id = input.sequence_id;
        if let Some(newest) = record.newest_received_id {
            if !id.is_newer_than(newest) {
                record.inputs_dropped += 1;
                trace!(%from, %id, %newest, "Stale input dropped");
                return InputDisposition::Stale;
            }
        }

        record.newest_received_id = Some(id);
        record.inputs_received += 1;
        record.pending.push_back(input);
        if record.pending.len() > self.config.max_pending_inputs {
            if let Some(old) = record.pending.pop_front() {
                record.inputs_dropped += 1;
                debug!(%from, id = %old.sequence_id, "Pending input queue full, dropping oldest");
            }
        }

        InputDisposition::Queued
    }

    /// Dequeues the next input of `peer` and marks it applied.
    ///
    /// For embedders running their own simulation step; otherwise use
    /// [`apply_pending_inputs`](Self::apply_pending_inputs).
    pub fn next_input(&mut self, peer: PeerId) -> Option<InputCommand> {
        self.connections.get_mut(&peer)?.pop_input()
    }

    /// One simulation step: applies at most one queued input per client
    /// connection to that connection's scene. Returns how many were applied.
    pub fn apply_pending_inputs<S>(&mut self, scenes: &mut S) -> usize
    where
        S: SceneSource<Registry = R>,
    {
        let timestep = self.config.timestep;
        let mut applied = 0;

        for (peer, record) in &mut self.connections {
            if record.role != PeerRole::Client {
                continue;
            }
            let Some(registry) = record.scene.and_then(|id| scenes.scene_mut(id)) else {
                continue;
            };
            if let Some(input) = record.pop_input() {
                (self.apply_client_input)(registry, &input, timestep, *peer);
                applied += 1;
            }
        }

        applied
    }

    // Snapshots

    /// Advances the update timer by `dt` and, once the interval has elapsed,
    /// sends every client its scene's snapshot stamped with its own
    /// last applied input id.
    pub fn tick<S>(&mut self, dt: f32, scenes: &S, transport: &mut impl Transport) -> TickReport
    where
        S: SceneSource<Registry = R>,
    {
        if !self.timer.advance(dt) {
            return TickReport::default();
        }

        let in_use: BTreeSet<SceneId> = self
            .connections
            .values()
            .filter(|r| r.role == PeerRole::Client)
            .filter_map(|r| r.scene)
            .collect();
        self.snapshots.retain(|scene, _| in_use.contains(scene));

        let mut report = TickReport::default();

        for scene in &in_use {
            let Some(registry) = scenes.scene(*scene) else {
                warn!(%scene, "Connection references a scene that does not exist");
                continue;
            };

            if let Some(ids) = self.replicated.get_mut(scene) {
                ids.retain(|id| registry.entity(*id).is_some());
            }
            let ids = self.replicated.get(scene).into_iter().flatten().copied();

            let buf = self.snapshots.entry(*scene).or_default();
            let entity_count = write_scene(registry, ids, buf);
            self.stats.record(entity_count, buf.len());
            report.snapshots_built += 1;
        }

        for (peer, record) in &self.connections {
            if record.role != PeerRole::Client {
                continue;
            }
            let Some(buf) = record.scene.and_then(|s| self.snapshots.get_mut(&s)) else {
                continue;
            };
            stamp_ack(buf, record.last_applied_id);
            transport.send(*peer, MessageKind::State, &buf[..]);
            report.messages_sent += 1;
        }

        self.snapshots_sent += report.messages_sent as u64;
        trace!(
            built = report.snapshots_built,
            sent = report.messages_sent,
            "Snapshots sent"
        );
        report
    }

    /// STATE messages sent since creation
    pub fn snapshots_sent(&self) -> u64 {
        self.snapshots_sent
    }

    pub fn snapshot_stats(&self) -> SnapshotStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::net::transport::Outbox;
    use crate::net::wire::{Value, WireReader};
    use crate::prediction::snapshot::{read_ack, SceneState};
    use crate::scene::MemoryScene;

    const SCENE: SceneId = SceneId(1);
    const ALICE: PeerId = PeerId(1);
    const BOB: PeerId = PeerId(2);

    type Log = Rc<RefCell<Vec<(PeerId, u32)>>>;

    fn reconciler(config: ServerConfig) -> (ServerReconciler<MemoryScene>, Log) {
        let log: Log = Rc::default();
        let sink = log.clone();
        let server = ServerReconciler::new(
            config,
            move |_: &mut MemoryScene, input: &InputCommand, _, peer| {
                sink.borrow_mut().push((peer, input.sequence_id.0));
            },
        );
        (server, log)
    }

    fn every_tick() -> ServerConfig {
        ServerConfig {
            update_interval: 0.1,
            ..Default::default()
        }
    }

    fn scenes() -> BTreeMap<SceneId, MemoryScene> {
        let mut scene = MemoryScene::new();
        scene.create_entity(EntityId(10)).set_position([1.0, 0.0, 0.0]);
        scene.create_entity(EntityId(20));
        BTreeMap::from([(SCENE, scene)])
    }

    fn input(id: u32) -> Vec<u8> {
        let mut input = InputCommand::new(1, 0.0, 0.0);
        input.stamp(SequenceId(id));
        let mut buf = BytesMut::new();
        input.encode(&mut buf);
        buf.to_vec()
    }

    fn ack_of(payload: &[u8]) -> u32 {
        read_ack(&mut WireReader::new(payload)).unwrap().0
    }

    #[test]
    fn test_inputs_are_applied_one_per_step() {
        let (mut server, log) = reconciler(ServerConfig::default());
        let mut scenes = scenes();
        server.connect(ALICE, PeerRole::Client, Some(SCENE));

        for id in 1..=3 {
            assert_eq!(server.read_input(ALICE, &input(id)), InputDisposition::Queued);
        }
        assert_eq!(server.connection(ALICE).unwrap().pending_len(), 3);

        assert_eq!(server.apply_pending_inputs(&mut scenes), 1);
        assert_eq!(server.connection(ALICE).unwrap().last_applied_id(), SequenceId(1));
        assert_eq!(server.apply_pending_inputs(&mut scenes), 1);
        assert_eq!(server.apply_pending_inputs(&mut scenes), 1);
        assert_eq!(server.apply_pending_inputs(&mut scenes), 0);

        assert_eq!(*log.borrow(), vec![(ALICE, 1), (ALICE, 2), (ALICE, 3)]);
        assert_eq!(server.connection(ALICE).unwrap().last_applied_id(), SequenceId(3));
    }

    #[test]
    fn test_stale_and_duplicate_inputs_are_dropped() {
        let (mut server, _log) = reconciler(ServerConfig::default());
        server.connect(ALICE, PeerRole::Client, Some(SCENE));

        assert_eq!(server.read_input(ALICE, &input(1)), InputDisposition::Queued);
        assert_eq!(server.read_input(ALICE, &input(3)), InputDisposition::Queued);
        assert_eq!(server.read_input(ALICE, &input(2)), InputDisposition::Stale);
        assert_eq!(server.read_input(ALICE, &input(3)), InputDisposition::Stale);

        let record = server.connection(ALICE).unwrap();
        assert_eq!(record.pending_ids(), vec![SequenceId(1), SequenceId(3)]);
        assert_eq!(record.newest_received_id(), Some(SequenceId(3)));
        assert_eq!(record.inputs_dropped(), 2);
    }

    #[test]
    fn test_inputs_across_wrap_are_newer() {
        let (mut server, _log) = reconciler(ServerConfig::default());
        server.connect(ALICE, PeerRole::Client, Some(SCENE));

        assert_eq!(server.read_input(ALICE, &input(u32::MAX)), InputDisposition::Queued);
        assert_eq!(server.read_input(ALICE, &input(0)), InputDisposition::Queued);
        assert_eq!(server.read_input(ALICE, &input(u32::MAX)), InputDisposition::Stale);
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let (mut server, _log) = reconciler(ServerConfig {
            max_pending_inputs: 2,
            ..Default::default()
        });
        server.connect(ALICE, PeerRole::Client, Some(SCENE));
        for id in 1..=3 {
            server.read_input(ALICE, &input(id));
        }
        assert_eq!(
            server.connection(ALICE).unwrap().pending_ids(),
            vec![SequenceId(2), SequenceId(3)]
        );
    }

    #[test]
    fn test_input_from_non_client_is_rejected() {
        let (mut server, _log) = reconciler(ServerConfig::default());
        server.connect(ALICE, PeerRole::Server, Some(SCENE));

        assert_eq!(server.read_input(ALICE, &input(1)), InputDisposition::Rejected);
        assert_eq!(server.read_input(BOB, &input(1)), InputDisposition::UnknownPeer);
        assert_eq!(server.connection(ALICE).unwrap().pending_len(), 0);
    }

    #[test]
    fn test_malformed_input_is_dropped() {
        let (mut server, _log) = reconciler(ServerConfig::default());
        server.connect(ALICE, PeerRole::Client, Some(SCENE));

        assert_eq!(server.read_input(ALICE, &[1, 2]), InputDisposition::Malformed);

        let mut no_id = BytesMut::new();
        InputCommand::new(1, 0.0, 0.0)
            .with_tag("other", Value::Int(1))
            .encode(&mut no_id);
        assert_eq!(server.read_input(ALICE, &no_id), InputDisposition::Malformed);
        assert_eq!(server.connection(ALICE).unwrap().newest_received_id(), None);
    }

    #[test]
    fn test_rate_limit_drops_excess_input() {
        let (mut server, _log) = reconciler(ServerConfig {
            input_rate_limit: 2,
            ..Default::default()
        });
        server.connect(ALICE, PeerRole::Client, Some(SCENE));

        assert_eq!(server.read_input(ALICE, &input(1)), InputDisposition::Queued);
        assert_eq!(server.read_input(ALICE, &input(2)), InputDisposition::Queued);
        assert_eq!(server.read_input(ALICE, &input(3)), InputDisposition::RateLimited);
    }

    #[test]
    fn test_tick_waits_for_the_interval() {
        let (mut server, _log) = reconciler(every_tick());
        let scenes = scenes();
        let mut outbox = Outbox::new();
        server.connect(ALICE, PeerRole::Client, Some(SCENE));
        server.add_entity(SCENE, EntityId(10));

        assert_eq!(server.tick(0.06, &scenes, &mut outbox), TickReport::default());
        assert!(outbox.sent.is_empty());

        let report = server.tick(0.06, &scenes, &mut outbox);
        assert_eq!(report, TickReport { snapshots_built: 1, messages_sent: 1 });
        assert_eq!(server.snapshots_sent(), 1);

        // 0.02 carried over
        assert_eq!(server.tick(0.07, &scenes, &mut outbox).messages_sent, 0);
        assert_eq!(server.tick(0.02, &scenes, &mut outbox).messages_sent, 1);
    }

    #[test]
    fn test_each_connection_gets_its_own_ack() {
        let (mut server, _log) = reconciler(every_tick());
        let mut scenes = scenes();
        let mut outbox = Outbox::new();
        server.add_entity(SCENE, EntityId(10));
        server.add_entity(SCENE, EntityId(20));
        server.connect(ALICE, PeerRole::Client, Some(SCENE));
        server.connect(BOB, PeerRole::Client, Some(SCENE));

        for id in 1..=2 {
            server.read_input(ALICE, &input(id));
        }
        server.read_input(BOB, &input(1));
        server.apply_pending_inputs(&mut scenes);
        server.apply_pending_inputs(&mut scenes);

        let report = server.tick(0.1, &scenes, &mut outbox);
        assert_eq!(report, TickReport { snapshots_built: 1, messages_sent: 2 });

        let sent = outbox.take();
        assert_eq!(sent[0].0, ALICE);
        assert_eq!(ack_of(&sent[0].2), 2);
        assert_eq!(sent[1].0, BOB);
        assert_eq!(ack_of(&sent[1].2), 1);
        assert_eq!(sent[0].2[4..], sent[1].2[4..]);
    }

    #[test]
    fn test_deleted_entities_stop_replicating() {
        let (mut server, _log) = reconciler(every_tick());
        let mut scenes = scenes();
        let mut outbox = Outbox::new();
        server.connect(ALICE, PeerRole::Client, Some(SCENE));
        server.add_entity(SCENE, EntityId(10));
        server.add_entity(SCENE, EntityId(20));

        scenes.get_mut(&SCENE).unwrap().remove_entity(EntityId(20));
        server.tick(0.1, &scenes, &mut outbox);

        assert_eq!(server.replicated_entities(SCENE), vec![EntityId(10)]);
        let sent = outbox.take();
        let mut reader = WireReader::new(&sent[0].2);
        read_ack(&mut reader).unwrap();
        let state = SceneState::decode(&mut reader, &scenes[&SCENE]).unwrap();
        let ids: Vec<_> = state.entities.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![EntityId(10)]);
    }

    #[test]
    fn test_connections_without_scene_get_nothing() {
        let (mut server, _log) = reconciler(every_tick());
        let scenes = scenes();
        let mut outbox = Outbox::new();
        server.connect(ALICE, PeerRole::Client, None);
        server.connect(BOB, PeerRole::Server, Some(SCENE));

        assert_eq!(server.tick(0.1, &scenes, &mut outbox), TickReport::default());

        server.set_scene(ALICE, Some(SCENE));
        assert_eq!(server.tick(0.1, &scenes, &mut outbox).messages_sent, 1);
        assert_eq!(outbox.take()[0].0, ALICE);
    }

    #[test]
    fn test_disconnect_discards_pending_inputs() {
        let (mut server, log) = reconciler(every_tick());
        let mut scenes = scenes();
        let mut outbox = Outbox::new();
        server.connect(ALICE, PeerRole::Client, Some(SCENE));
        server.read_input(ALICE, &input(1));

        assert!(server.disconnect(ALICE));
        assert!(!server.disconnect(ALICE));
        assert_eq!(server.apply_pending_inputs(&mut scenes), 0);
        assert!(log.borrow().is_empty());
        assert_eq!(server.tick(0.1, &scenes, &mut outbox), TickReport::default());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_next_input_marks_applied() {
        let (mut server, _log) = reconciler(ServerConfig::default());
        server.connect(ALICE, PeerRole::Client, Some(SCENE));
        server.read_input(ALICE, &input(5));

        assert_eq!(server.next_input(ALICE).unwrap().sequence_id, SequenceId(5));
        assert_eq!(server.connection(ALICE).unwrap().last_applied_id(), SequenceId(5));
        assert!(server.next_input(ALICE).is_none());
        assert!(server.next_input(BOB).is_none());
    }
}
