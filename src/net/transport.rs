//! Transport seam and an in-process simulated network

use std::fmt;

use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::net::protocol::MessageKind;

/// Connection identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Outgoing half of a connection-oriented, unordered channel.
///
/// Implementations copy `payload` if they need it past the call; callers
/// reuse their buffers.
pub trait Transport {
    fn send(&mut self, to: PeerId, kind: MessageKind, payload: &[u8]);
}

/// A message in flight or delivered
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: PeerId,
    pub to: PeerId,
    pub kind: MessageKind,
    pub payload: Bytes,
}

/// Collects sent messages without delivering them
#[derive(Debug, Default)]
pub struct Outbox {
    pub sent: Vec<(PeerId, MessageKind, Bytes)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self) -> Vec<(PeerId, MessageKind, Bytes)> {
        std::mem::take(&mut self.sent)
    }
}

impl Transport for Outbox {
    fn send(&mut self, to: PeerId, kind: MessageKind, payload: &[u8]) {
        self.sent.push((to, kind, Bytes::copy_from_slice(payload)));
    }
}

/// Delivery counters for [`LoopbackNetwork`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub sent: u64,
    pub dropped: u64,
    pub delivered: u64,
}

#[derive(Debug)]
struct InFlight {
    deliver_at: u64,
    order: u64,
    envelope: Envelope,
}

/// Unordered, lossy in-process network driven one frame at a time.
///
/// Every message is held for a random number of frames in
/// `0..=max_delay_frames` (so later sends may overtake earlier ones) and is
/// dropped with probability `loss`.
#[derive(Debug)]
pub struct LoopbackNetwork {
    frame: u64,
    next_order: u64,
    in_flight: Vec<InFlight>,
    rng: ChaCha8Rng,
    max_delay_frames: u32,
    loss: f64,
    stats: NetworkStats,
}

impl LoopbackNetwork {
    pub fn new(seed: u64, max_delay_frames: u32, loss: f64) -> Self {
        Self {
            frame: 0,
            next_order: 0,
            in_flight: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            max_delay_frames,
            loss: loss.clamp(0.0, 1.0),
            stats: NetworkStats::default(),
        }
    }

    /// No delay, no loss: everything arrives on the next frame in send order
    pub fn reliable() -> Self {
        Self::new(0, 0, 0.0)
    }

    /// A [`Transport`] that sends as `peer`
    pub fn endpoint(&mut self, peer: PeerId) -> Endpoint<'_> {
        Endpoint { net: self, peer }
    }

    fn enqueue(&mut self, from: PeerId, to: PeerId, kind: MessageKind, payload: &[u8]) {
        self.stats.sent += 1;
        if self.loss > 0.0 && self.rng.gen_bool(self.loss) {
            self.stats.dropped += 1;
            trace!(%from, %to, ?kind, "Simulated drop");
            return;
        }

        let delay = if self.max_delay_frames > 0 {
            u64::from(self.rng.gen_range(0..=self.max_delay_frames))
        } else {
            0
        };
        let order = self.next_order;
        self.next_order += 1;
        self.in_flight.push(InFlight {
            deliver_at: self.frame + 1 + delay,
            order,
            envelope: Envelope {
                from,
                to,
                kind,
                payload: Bytes::copy_from_slice(payload),
            },
        });
    }

    /// Moves to the next frame and returns the messages due, in arrival order
    pub fn advance(&mut self) -> Vec<Envelope> {
        self.frame += 1;
        let frame = self.frame;
        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|m| m.deliver_at <= frame);
        self.in_flight = pending;
        due.sort_by_key(|m| (m.deliver_at, m.order));
        self.stats.delivered += due.len() as u64;
        due.into_iter().map(|m| m.envelope).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }
}

/// Sending handle bound to one peer of a [`LoopbackNetwork`]
pub struct Endpoint<'a> {
    net: &'a mut LoopbackNetwork,
    peer: PeerId,
}

impl Transport for Endpoint<'_> {
    fn send(&mut self, to: PeerId, kind: MessageKind, payload: &[u8]) {
        self.net.enqueue(self.peer, to, kind, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliable_network_preserves_send_order() {
        let mut net = LoopbackNetwork::reliable();
        {
            let mut ep = net.endpoint(PeerId(1));
            ep.send(PeerId(0), MessageKind::Input, &[1]);
            ep.send(PeerId(0), MessageKind::Input, &[2]);
        }
        let delivered = net.advance();
        let payloads: Vec<_> = delivered.iter().map(|e| e.payload[0]).collect();
        assert_eq!(payloads, vec![1, 2]);
        assert_eq!(delivered[0].from, PeerId(1));
        assert_eq!(net.in_flight(), 0);
    }

    #[test]
    fn test_delayed_network_delivers_everything_eventually() {
        let mut net = LoopbackNetwork::new(42, 5, 0.0);
        for i in 0..50u8 {
            net.endpoint(PeerId(1)).send(PeerId(0), MessageKind::Input, &[i]);
        }
        let mut received = Vec::new();
        for _ in 0..6 {
            received.extend(net.advance().into_iter().map(|e| e.payload[0]));
        }
        assert_eq!(received.len(), 50);
        assert_ne!(received, (0..50).collect::<Vec<u8>>(), "expected reordering");
        received.sort_unstable();
        assert_eq!(received, (0..50).collect::<Vec<u8>>());
    }

    #[test]
    fn test_total_loss_drops_everything() {
        let mut net = LoopbackNetwork::new(1, 0, 1.0);
        net.endpoint(PeerId(1)).send(PeerId(0), MessageKind::State, &[0]);
        assert!(net.advance().is_empty());
        assert_eq!(net.stats().dropped, 1);
    }

    #[test]
    fn test_outbox_records_copies() {
        let mut outbox = Outbox::new();
        let mut buf = vec![7u8];
        outbox.send(PeerId(3), MessageKind::State, &buf);
        buf[0] = 9;
        let sent = outbox.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, PeerId(3));
        assert_eq!(&sent[0].2[..], &[7]);
    }
}
