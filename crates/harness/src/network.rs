use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use spacesync_core::{broadcast::BroadcastMessage, ManualClock};
use spacesync_engine::{EngineError, RemoteError, Transport};
use tracing::trace;

use crate::{FakeRemote, TestPeer};

type Bus = Arc<Mutex<VecDeque<(usize, String)>>>;

fn lock(bus: &Bus) -> MutexGuard<'_, VecDeque<(usize, String)>> {
    bus.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A peer's end of the in-memory realtime channel. Messages travel as the
/// same JSON text a socket would carry.
pub struct BusTransport {
    from: usize,
    bus: Bus,
}

impl Transport for BusTransport {
    fn send(&mut self, message: &BroadcastMessage) -> Result<(), RemoteError> {
        let json = message
            .to_json()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        lock(&self.bus).push_back((self.from, json));
        Ok(())
    }
}

/// Peers that share one remote, one virtual clock and one broadcast channel.
pub struct TestNetwork {
    peers: Vec<TestPeer>,
    bus: Bus,
    remote: FakeRemote,
    clock: ManualClock,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            peers: Vec::new(),
            bus: Bus::default(),
            remote: FakeRemote::new(),
            clock: ManualClock::new(1_000_000),
        }
    }

    pub fn add_peer(&mut self) -> Result<usize, EngineError> {
        let index = self.peers.len();
        let mut peer = TestPeer::with_remote(self.remote.clone(), self.clock.clone())?;
        peer.session.set_transport(Some(Box::new(BusTransport {
            from: index,
            bus: Arc::clone(&self.bus),
        })));
        self.peers.push(peer);
        Ok(index)
    }

    pub fn peer(&self, index: usize) -> &TestPeer {
        &self.peers[index]
    }

    pub fn peer_mut(&mut self, index: usize) -> &mut TestPeer {
        &mut self.peers[index]
    }

    pub fn remote(&self) -> &FakeRemote {
        &self.remote
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Messages sent but not yet delivered.
    pub fn in_flight(&self) -> usize {
        lock(&self.bus).len()
    }

    /// Hands every queued message to every peer except its sender. Returns
    /// the number of messages delivered.
    pub fn deliver(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let Some((from, json)) = lock(&self.bus).pop_front() else {
                break;
            };
            for (index, peer) in self.peers.iter_mut().enumerate() {
                if index != from {
                    trace!(from, to = index, "delivering broadcast");
                    peer.session.receive_broadcast(&json);
                }
            }
            delivered += 1;
        }
        delivered
    }

    /// Advances the shared clock and runs every peer's timers.
    pub fn advance(&mut self, ms: i64) {
        self.clock.advance(ms);
        for peer in &mut self.peers {
            peer.session.tick();
        }
    }
}
