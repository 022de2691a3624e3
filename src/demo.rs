//! Rolling-ball session: one server and a few predicting clients over a
//! simulated lossy, reordering network.

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info};

use csp_netcode::config::Config;
use csp_netcode::net::transport::{LoopbackNetwork, NetworkStats};
use csp_netcode::net::wire::{Value, ValueType};
use csp_netcode::prediction::{
    ClientPredictor, ClientStats, PeerRole, SequenceId, ServerReconciler, SnapshotStats,
};
use csp_netcode::scene::{AttributeInfo, AttributeProvider, ComponentId, MemoryScene, SceneEntity};
use csp_netcode::{EntityId, EntityRegistry, InputCommand, PeerId, SceneId};

pub const CTRL_FORWARD: u32 = 1;
pub const CTRL_BACK: u32 = 2;
pub const CTRL_LEFT: u32 = 4;
pub const CTRL_RIGHT: u32 = 8;

/// Distance covered per second while a direction is held
const MOVE_SPEED: f32 = 2.0;

const SERVER: PeerId = PeerId(0);
const SCENE: SceneId = SceneId(1);

const BALL_COMPONENT: &str = "Ball";
const BALL_ATTRIBUTES: &[AttributeInfo] = &[
    AttributeInfo::new("Radius", ValueType::Float),
    AttributeInfo::new("Color", ValueType::Int),
];

fn ball_of(peer: PeerId) -> EntityId {
    EntityId(100 + peer.0)
}

fn scene() -> MemoryScene {
    MemoryScene::new().with_component_type(BALL_COMPONENT, BALL_ATTRIBUTES)
}

/// Moves `ball` one fixed step according to the held buttons
pub fn move_ball(scene: &mut MemoryScene, ball: EntityId, input: &InputCommand, dt: f32) {
    let Some(entity) = scene.entity_mut(ball) else {
        return;
    };

    let step = MOVE_SPEED * dt;
    let mut position = entity.position();
    if input.is_down(CTRL_FORWARD) {
        position[0] += step;
    }
    if input.is_down(CTRL_BACK) {
        position[0] -= step;
    }
    if input.is_down(CTRL_LEFT) {
        position[2] += step;
    }
    if input.is_down(CTRL_RIGHT) {
        position[2] -= step;
    }
    entity.set_position(position);

    let half = input.yaw.to_radians() * 0.5;
    entity.set_rotation([half.cos(), 0.0, half.sin(), 0.0]);
}

struct DemoClient {
    peer: PeerId,
    ball: EntityId,
    predictor: ClientPredictor<MemoryScene>,
    scene: MemoryScene,
    rng: ChaCha8Rng,
    buttons: u32,
    yaw: f32,
}

impl DemoClient {
    /// Holds a random direction for a while, like a player would
    fn next_input(&mut self) -> InputCommand {
        if self.rng.gen_bool(0.05) {
            self.buttons = self.rng.gen_range(0..16);
            self.yaw = self.rng.gen_range(-180.0..180.0);
        }
        InputCommand::new(self.buttons, self.yaw, 0.0)
    }
}

#[derive(Debug, Serialize)]
pub struct ClientSummary {
    pub peer: PeerId,
    pub predicted: Option<[f32; 3]>,
    pub authoritative: Option<[f32; 3]>,
    pub error: Option<f32>,
    pub last_ack: SequenceId,
    pub local_id: SequenceId,
    pub buffered_inputs: usize,
    pub stats: ClientStats,
}

#[derive(Debug, Serialize)]
pub struct DemoSummary {
    pub frames: u64,
    pub network: NetworkStats,
    pub snapshots_sent: u64,
    pub snapshot_stats: SnapshotStats,
    pub clients: Vec<ClientSummary>,
}

pub struct Demo {
    net: LoopbackNetwork,
    server: ServerReconciler<MemoryScene>,
    server_scenes: BTreeMap<SceneId, MemoryScene>,
    clients: Vec<DemoClient>,
    frames: u64,
}

impl Demo {
    pub fn new(config: &Config) -> Self {
        let demo = &config.demo;
        let net = LoopbackNetwork::new(demo.seed, demo.latency_ticks, demo.packet_loss);

        let mut server = ServerReconciler::new(
            config.server_config(),
            |scene: &mut MemoryScene, input: &InputCommand, dt, peer| {
                move_ball(scene, ball_of(peer), input, dt)
            },
        );
        let mut server_scene = scene();
        let mut clients = Vec::new();

        for n in 1..=demo.clients {
            let peer = PeerId(n);
            let ball = ball_of(peer);

            server_scene
                .create_entity(ball)
                .set_position([n as f32 * 2.0, 0.0, 0.0]);
            if let Some(component) = server_scene.add_component(ball, BALL_COMPONENT, ComponentId(1)) {
                component.set_attribute(0, Value::Float(0.5));
                component.set_attribute(1, Value::Int(n as i32));
            }
            if let Some(entity) = server_scene.entity_mut(ball) {
                entity.set_var("owner".into(), Value::Int(n as i32));
            }
            server.add_entity(SCENE, ball);
            server.connect(peer, PeerRole::Client, Some(SCENE));

            let mut predictor = ClientPredictor::new(
                config.client_config(),
                move |scene: &mut MemoryScene, input: &InputCommand, dt| {
                    move_ball(scene, ball, input, dt)
                },
            );
            predictor.connect(SERVER);
            predictor.set_scene_loaded(true);

            clients.push(DemoClient {
                peer,
                ball,
                predictor,
                scene: scene(),
                rng: ChaCha8Rng::seed_from_u64(demo.seed.wrapping_add(u64::from(n))),
                buttons: 0,
                yaw: 0.0,
            });
        }

        info!(
            clients = clients.len(),
            latency_ticks = demo.latency_ticks,
            packet_loss = demo.packet_loss,
            "Demo session created"
        );

        Self {
            net,
            server,
            server_scenes: BTreeMap::from([(SCENE, server_scene)]),
            clients,
            frames: 0,
        }
    }

    /// One frame: deliver messages, generate input, simulate, send snapshots
    pub fn step(&mut self, dt: f32, generate_input: bool) {
        self.frames += 1;

        for envelope in self.net.advance() {
            if envelope.to == SERVER {
                self.server
                    .handle_message(envelope.from, envelope.kind, &envelope.payload);
            } else if let Some(client) = self.clients.iter_mut().find(|c| c.peer == envelope.to) {
                client.predictor.handle_message(
                    envelope.from,
                    envelope.kind,
                    &envelope.payload,
                    &mut client.scene,
                );
            }
        }

        if generate_input {
            for client in &mut self.clients {
                let input = client.next_input();
                let mut endpoint = self.net.endpoint(client.peer);
                client
                    .predictor
                    .add_input(input, &mut client.scene, &mut endpoint);
            }
        }

        self.server.apply_pending_inputs(&mut self.server_scenes);
        let mut endpoint = self.net.endpoint(SERVER);
        self.server.tick(dt, &self.server_scenes, &mut endpoint);
    }

    /// Keeps the session running without new input so in-flight messages land
    pub fn settle(&mut self, dt: f32, max_frames: u32) {
        for _ in 0..max_frames {
            self.step(dt, false);
            let drained = self.net.in_flight() == 0
                && self
                    .server
                    .connections()
                    .all(|(_, record)| record.pending_len() == 0);
            let acked = self
                .clients
                .iter()
                .all(|c| c.predictor.input_buffer().is_empty());
            if drained && acked {
                break;
            }
        }
        debug!(frames = self.frames, "Session settled");
    }

    pub fn summary(&self) -> DemoSummary {
        let server_scene = self.server_scenes.get(&SCENE);
        let clients = self
            .clients
            .iter()
            .map(|client| {
                let predicted = client.scene.entity(client.ball).map(|e| e.position());
                let authoritative = server_scene
                    .and_then(|s| s.entity(client.ball))
                    .map(|e| e.position());
                let error = predicted.zip(authoritative).map(|(p, a)| {
                    p.iter()
                        .zip(a.iter())
                        .map(|(p, a)| (p - a) * (p - a))
                        .sum::<f32>()
                        .sqrt()
                });

                ClientSummary {
                    peer: client.peer,
                    predicted,
                    authoritative,
                    error,
                    last_ack: client.predictor.server_ack_id(),
                    local_id: client.predictor.local_id(),
                    buffered_inputs: client.predictor.input_buffer().len(),
                    stats: client.predictor.stats(),
                }
            })
            .collect();

        DemoSummary {
            frames: self.frames,
            network: self.net.stats(),
            snapshots_sent: self.server.snapshots_sent(),
            snapshot_stats: self.server.snapshot_stats(),
            clients,
        }
    }
}
