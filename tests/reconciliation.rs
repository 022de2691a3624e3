use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use csp_netcode::net::transport::{LoopbackNetwork, Outbox};
use csp_netcode::net::wire::{Value, ValueType};
use csp_netcode::prediction::{InputDisposition, PeerRole, SnapshotError};
use csp_netcode::scene::{AttributeInfo, ComponentId, MemoryScene};
use csp_netcode::{
    ClientConfig, ClientPredictor, EntityId, EntityRegistry, InputCommand, MessageKind, PeerId,
    SceneId, SequenceId, ServerConfig, ServerReconciler,
};

const SERVER: PeerId = PeerId(0);
const CLIENT: PeerId = PeerId(1);
const SCENE: SceneId = SceneId(1);
const BALL: EntityId = EntityId(10);
const DT: f32 = 1.0 / 60.0;

type Replays = Rc<RefCell<Vec<u32>>>;

fn step_x(scene: &mut MemoryScene, input: &InputCommand, dt: f32) {
    if let Some(ball) = scene.entity_mut(BALL) {
        let mut p = ball.position();
        p[0] += input.buttons as f32 * dt;
        ball.set_position(p);
    }
}

fn server() -> (ServerReconciler<MemoryScene>, BTreeMap<SceneId, MemoryScene>) {
    let config = ServerConfig {
        update_interval: DT,
        timestep: DT,
        ..Default::default()
    };
    let mut server = ServerReconciler::new(config, |scene: &mut MemoryScene, input: &InputCommand, dt, _| {
        step_x(scene, input, dt)
    });
    server.connect(CLIENT, PeerRole::Client, Some(SCENE));
    server.add_entity(SCENE, BALL);

    let mut scene = MemoryScene::new();
    scene.create_entity(BALL);
    (server, BTreeMap::from([(SCENE, scene)]))
}

fn client() -> (ClientPredictor<MemoryScene>, Replays) {
    let replays: Replays = Rc::default();
    let log = replays.clone();
    let config = ClientConfig {
        timestep: DT,
        ..Default::default()
    };
    let mut client = ClientPredictor::new(config, move |scene: &mut MemoryScene, input: &InputCommand, dt| {
        log.borrow_mut().push(input.sequence_id.0);
        step_x(scene, input, dt)
    });
    client.connect(SERVER);
    client.set_scene_loaded(true);
    (client, replays)
}

fn deliver_all(
    net: &mut LoopbackNetwork,
    server: &mut ServerReconciler<MemoryScene>,
    client: &mut ClientPredictor<MemoryScene>,
    client_scene: &mut MemoryScene,
) {
    for envelope in net.advance() {
        if envelope.to == SERVER {
            server.handle_message(envelope.from, envelope.kind, &envelope.payload);
        } else {
            client.handle_message(envelope.from, envelope.kind, &envelope.payload, client_scene);
        }
    }
}

#[test]
fn acknowledging_three_of_five_replays_four_and_five() {
    let mut net = LoopbackNetwork::reliable();
    let (mut server, mut scenes) = server();
    let (mut client, replays) = client();
    let mut client_scene = MemoryScene::new();

    for _ in 0..5 {
        client.add_input(InputCommand::new(1, 0.0, 0.0), &mut client_scene, &mut net.endpoint(CLIENT));
    }
    deliver_all(&mut net, &mut server, &mut client, &mut client_scene);
    assert_eq!(server.connection(CLIENT).unwrap().pending_len(), 5);

    for _ in 0..3 {
        server.apply_pending_inputs(&mut scenes);
    }
    let report = server.tick(DT, &scenes, &mut net.endpoint(SERVER));
    assert_eq!(report.messages_sent, 1);

    replays.borrow_mut().clear();
    deliver_all(&mut net, &mut server, &mut client, &mut client_scene);

    assert_eq!(client.server_ack_id(), SequenceId(3));
    assert_eq!(client.input_buffer().ids(), vec![SequenceId(4), SequenceId(5)]);
    assert_eq!(*replays.borrow(), vec![4, 5]);

    // Server state after three steps plus two replayed steps
    let predicted = client_scene.entity(BALL).unwrap().position()[0];
    assert!((predicted - 5.0 * DT).abs() < 1e-6);
}

#[test]
fn late_older_snapshot_does_not_rewind_prediction() {
    let mut net = LoopbackNetwork::reliable();
    let (mut server, mut scenes) = server();
    let (mut client, replays) = client();
    let mut client_scene = MemoryScene::new();

    for _ in 0..5 {
        client.add_input(InputCommand::new(1, 0.0, 0.0), &mut client_scene, &mut net.endpoint(CLIENT));
    }
    deliver_all(&mut net, &mut server, &mut client, &mut client_scene);

    let mut outbox = Outbox::new();
    for _ in 0..2 {
        server.apply_pending_inputs(&mut scenes);
    }
    server.tick(DT, &scenes, &mut outbox);
    let (_, _, older) = outbox.take().remove(0);
    for _ in 0..2 {
        server.apply_pending_inputs(&mut scenes);
    }
    server.tick(DT, &scenes, &mut outbox);
    let (_, _, newer) = outbox.take().remove(0);

    // Delivered out of order
    client.on_state_message(&newer, &mut client_scene).unwrap();
    let predicted = client_scene.entity(BALL).unwrap().position()[0];
    assert!((predicted - 5.0 * DT).abs() < 1e-6);

    replays.borrow_mut().clear();
    client.on_state_message(&older, &mut client_scene).unwrap();
    assert_eq!(client.server_ack_id(), SequenceId(4));
    assert_eq!(client.stats().stale_acks, 1);
    assert!(replays.borrow().is_empty());
    assert_eq!(client_scene.entity(BALL).unwrap().position()[0], predicted);
}

#[test]
fn entity_removed_on_server_disappears_on_next_snapshot() {
    let mut net = LoopbackNetwork::reliable();
    let (mut server, mut scenes) = server();
    let (mut client, _) = client();
    let mut client_scene = MemoryScene::new();

    scenes.get_mut(&SCENE).unwrap().create_entity(EntityId(20));
    server.add_entity(SCENE, EntityId(20));

    server.tick(DT, &scenes, &mut net.endpoint(SERVER));
    deliver_all(&mut net, &mut server, &mut client, &mut client_scene);
    assert_eq!(client_scene.entity_ids(), vec![BALL, EntityId(20)]);

    scenes.get_mut(&SCENE).unwrap().remove_entity(EntityId(20));
    // Still present until the next snapshot is processed
    assert!(client_scene.entity(EntityId(20)).is_some());

    server.tick(DT, &scenes, &mut net.endpoint(SERVER));
    deliver_all(&mut net, &mut server, &mut client, &mut client_scene);
    assert_eq!(client_scene.entity_ids(), vec![BALL]);
}

#[test]
fn prediction_converges_over_a_reordering_network() {
    let mut net = LoopbackNetwork::new(11, 5, 0.0);
    let (mut server, mut scenes) = server();
    let (mut client, _) = client();
    let mut client_scene = MemoryScene::new();

    for frame in 0..200u32 {
        deliver_all(&mut net, &mut server, &mut client, &mut client_scene);
        let buttons = (frame / 20) % 3;
        client.add_input(
            InputCommand::new(buttons, 0.0, 0.0),
            &mut client_scene,
            &mut net.endpoint(CLIENT),
        );
        server.apply_pending_inputs(&mut scenes);
        server.tick(DT, &scenes, &mut net.endpoint(SERVER));
    }

    for _ in 0..60 {
        deliver_all(&mut net, &mut server, &mut client, &mut client_scene);
        server.apply_pending_inputs(&mut scenes);
        server.tick(DT, &scenes, &mut net.endpoint(SERVER));
    }
    while net.in_flight() > 0 {
        deliver_all(&mut net, &mut server, &mut client, &mut client_scene);
    }

    // Reordered inputs arriving after a newer one are dropped as stale, so
    // the server may have skipped some; the client still ends on its state.
    let record = server.connection(CLIENT).unwrap();
    assert_eq!(record.pending_len(), 0);
    assert_eq!(client.server_ack_id(), record.last_applied_id());
    assert!(client.input_buffer().is_empty());
    assert_eq!(
        client_scene.entity(BALL).unwrap().position(),
        scenes[&SCENE].entity(BALL).unwrap().position()
    );
}

#[test]
fn unknown_component_type_drops_only_that_message() {
    const LIGHT: &[AttributeInfo] = &[AttributeInfo::new("Range", ValueType::Float)];

    let (mut server, mut scenes) = server();
    let (mut client, _) = client();
    let mut client_scene = MemoryScene::new();
    client_scene.create_entity(EntityId(99));

    let scene = scenes.get_mut(&SCENE).unwrap();
    scene.register_component_type("Light", LIGHT);
    scene.add_component(BALL, "Light", ComponentId(1));

    let mut outbox = Outbox::new();
    server.tick(DT, &scenes, &mut outbox);
    let (_, kind, payload) = outbox.take().remove(0);
    assert_eq!(kind, MessageKind::State);

    let err = client.on_state_message(&payload, &mut client_scene).unwrap_err();
    assert!(matches!(err, SnapshotError::UnknownComponentType { entity: BALL, .. }));
    assert_eq!(client_scene.entity_ids(), vec![EntityId(99)]);

    // The connection keeps working once the server stops sending it
    scenes.get_mut(&SCENE).unwrap().remove_entity(BALL);
    scenes.get_mut(&SCENE).unwrap().create_entity(BALL);
    server.add_entity(SCENE, BALL);
    server.tick(DT, &scenes, &mut outbox);
    let (_, _, payload) = outbox.take().remove(0);
    client.on_state_message(&payload, &mut client_scene).unwrap();
    assert_eq!(client_scene.entity_ids(), vec![BALL]);
}

#[test]
fn server_rejects_input_from_non_client_peers() {
    let (mut server, mut scenes) = server();
    server.connect(PeerId(5), PeerRole::Server, Some(SCENE));

    let mut payload = bytes::BytesMut::new();
    InputCommand::new(1, 0.0, 0.0)
        .with_tag("id", Value::Int(1))
        .encode(&mut payload);

    assert_eq!(server.read_input(PeerId(5), &payload), InputDisposition::Rejected);
    assert_eq!(server.read_input(CLIENT, &payload), InputDisposition::Queued);
    assert_eq!(server.apply_pending_inputs(&mut scenes), 1);
}

#[test]
fn disconnect_resets_both_sides() {
    let mut net = LoopbackNetwork::reliable();
    let (mut server, scenes) = server();
    let (mut client, _) = client();
    let mut client_scene = MemoryScene::new();

    for _ in 0..3 {
        client.add_input(InputCommand::new(1, 0.0, 0.0), &mut client_scene, &mut net.endpoint(CLIENT));
    }
    deliver_all(&mut net, &mut server, &mut client, &mut client_scene);

    client.disconnect();
    assert!(client.input_buffer().is_empty());
    assert_eq!(client.local_id(), SequenceId(0));
    assert_eq!(client.server_ack_id(), SequenceId::NONE);
    assert_eq!(
        client.add_input(InputCommand::new(1, 0.0, 0.0), &mut client_scene, &mut net.endpoint(CLIENT)),
        None
    );

    assert!(server.disconnect(CLIENT));
    let report = server.tick(DT, &scenes, &mut net.endpoint(SERVER));
    assert_eq!(report.messages_sent, 0);
    assert!(net.advance().is_empty());
}
