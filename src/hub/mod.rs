//! Multiplexer for the named WebSocket peers (`app`, `vision`).
//!
//! The registry holds one slot per peer name. A slot keeps only the *last*
//! message received; commands are read destructively, states are not. This is
//! deliberately not a queue: a stale classifier verdict is worse than none.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

pub mod server;

pub use server::PeerHub;

struct PeerSlot {
    sender: UnboundedSender<String>,
    last_message: String,
    last_seen: Instant,
    just_connected: bool,
    generation: u64,
}

/// Peer registry; all slot state lives under one lock.
#[derive(Default)]
pub struct Registry {
    peers: Mutex<HashMap<String, PeerSlot>>,
    generations: Mutex<u64>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Register a peer, evicting any earlier socket with the same name.
    ///
    /// Returns the generation tag the socket task must present on later
    /// writes, so an evicted socket's tail cannot touch its replacement.
    pub fn register(&self, name: &str, sender: UnboundedSender<String>) -> u64 {
        let generation = {
            let mut counter = self.generations.lock().unwrap();
            *counter += 1;
            *counter
        };
        let mut peers = self.peers.lock().unwrap();
        if peers.contains_key(name) {
            warn!(peer = name, "replacing an already-registered peer");
        }
        peers.insert(
            name.to_owned(),
            PeerSlot {
                sender,
                last_message: String::new(),
                last_seen: Instant::now(),
                just_connected: true,
                generation,
            },
        );
        generation
    }

    /// Drop the slot, unless the peer has already been replaced.
    pub fn unregister(&self, name: &str, generation: u64) {
        let mut peers = self.peers.lock().unwrap();
        if peers.get(name).is_some_and(|s| s.generation == generation) {
            peers.remove(name);
        }
    }

    /// Record an inbound frame, overwriting whatever was in the slot.
    pub fn record_message(&self, name: &str, generation: u64, message: &str) {
        let mut peers = self.peers.lock().unwrap();
        match peers.get_mut(name) {
            Some(slot) if slot.generation == generation => {
                slot.last_message = message.to_owned();
                slot.last_seen = Instant::now();
            }
            Some(_) => debug!(peer = name, "ignoring frame from evicted socket"),
            None => {}
        }
    }

    /// One-shot read: returns the slot content and clears it.
    pub fn get_command(&self, name: &str) -> String {
        let mut peers = self.peers.lock().unwrap();
        match peers.get_mut(name) {
            Some(slot) => std::mem::take(&mut slot.last_message),
            None => String::new(),
        }
    }

    /// Continuous read: returns the slot content without clearing it.
    pub fn get_state(&self, name: &str) -> String {
        let peers = self.peers.lock().unwrap();
        peers
            .get(name)
            .map(|slot| slot.last_message.clone())
            .unwrap_or_default()
    }

    /// Read-and-clear the just-connected edge flag.
    pub fn is_just_connected(&self, name: &str) -> bool {
        let mut peers = self.peers.lock().unwrap();
        match peers.get_mut(name) {
            Some(slot) => std::mem::take(&mut slot.just_connected),
            None => false,
        }
    }

    /// When the peer last sent a frame (or connected).
    pub fn last_seen(&self, name: &str) -> Option<Instant> {
        let peers = self.peers.lock().unwrap();
        peers.get(name).map(|slot| slot.last_seen)
    }

    /// Unicast; a no-op when the peer is absent.
    pub fn send(&self, name: &str, payload: &str) {
        let peers = self.peers.lock().unwrap();
        if let Some(slot) = peers.get(name) {
            if slot.sender.send(payload.to_owned()).is_err() {
                debug!(peer = name, "send to a closing peer dropped");
            }
        } else {
            debug!(peer = name, "send to an absent peer dropped");
        }
    }

    pub fn broadcast(&self, payload: &str) {
        let peers = self.peers.lock().unwrap();
        for (name, slot) in peers.iter() {
            if slot.sender.send(payload.to_owned()).is_err() {
                debug!(peer = %name, "broadcast to a closing peer dropped");
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}
