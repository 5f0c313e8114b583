//! TTL-keyed registrations of relays and peers, plus per-relay token state.
//!
//! Relay and peer entries expire after the store TTL; expiry is checked on
//! read and can also be swept with `purge_expired`. Token states are never
//! expired by the store so a relay's sequence counter cannot be reset.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::token::TokenState;
use crate::util::lock;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRegistration {
    pub relay_key: String,
    pub peers: Vec<String>,
    pub updated_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRegistration {
    pub public_key: String,
    pub relays: Vec<String>,
    pub endpoint: Option<String>,
    pub registered_at: u64,
}

pub trait RegistrationStore: Send + Sync {
    fn put_relay(&self, registration: RelayRegistration);
    fn get_relay(&self, relay_key: &str) -> Option<RelayRegistration>;
    /// Adds `peer` to the relay's peer list in one step, creating the entry
    /// when it is missing or expired, and refreshes its TTL.
    fn add_relay_peer(&self, relay_key: &str, peer: &str, updated_at: u64) -> RelayRegistration;

    fn put_peer(&self, registration: PeerRegistration);
    fn get_peer(&self, public_key: &str) -> Option<PeerRegistration>;

    fn put_token_state(&self, state: TokenState);
    fn get_token_state(&self, relay_key: &str) -> Option<TokenState>;

    /// Drops expired relay and peer entries, returning how many were removed.
    fn purge_expired(&self) -> usize;
    fn close(&self);
}

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Clone> Entry<T> {
    fn live(&self, now: Instant) -> Option<T> {
        if now < self.expires_at {
            Some(self.value.clone())
        } else {
            None
        }
    }
}

#[derive(Default)]
struct Tables {
    relays: HashMap<String, Entry<RelayRegistration>>,
    peers: HashMap<String, Entry<PeerRegistration>>,
    tokens: HashMap<String, TokenState>,
}

pub struct MemoryRegistrationStore {
    ttl: Duration,
    tables: Mutex<Tables>,
}

impl MemoryRegistrationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tables: Mutex::new(Tables::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl RegistrationStore for MemoryRegistrationStore {
    fn put_relay(&self, registration: RelayRegistration) {
        let expires_at = Instant::now() + self.ttl;
        lock(&self.tables).relays.insert(
            registration.relay_key.clone(),
            Entry {
                value: registration,
                expires_at,
            },
        );
    }

    fn get_relay(&self, relay_key: &str) -> Option<RelayRegistration> {
        let now = Instant::now();
        let mut guard = lock(&self.tables);
        match guard.relays.get(relay_key).map(|e| e.live(now)) {
            Some(Some(reg)) => Some(reg),
            Some(None) => {
                guard.relays.remove(relay_key);
                None
            }
            None => None,
        }
    }

    fn add_relay_peer(&self, relay_key: &str, peer: &str, updated_at: u64) -> RelayRegistration {
        let now = Instant::now();
        let mut guard = lock(&self.tables);
        let mut registration = guard
            .relays
            .get(relay_key)
            .and_then(|e| e.live(now))
            .unwrap_or_else(|| RelayRegistration {
                relay_key: relay_key.to_string(),
                peers: Vec::new(),
                updated_at,
            });
        if !registration.peers.iter().any(|p| p == peer) {
            registration.peers.push(peer.to_string());
        }
        registration.updated_at = updated_at;
        guard.relays.insert(
            relay_key.to_string(),
            Entry {
                value: registration.clone(),
                expires_at: now + self.ttl,
            },
        );
        registration
    }

    fn put_peer(&self, registration: PeerRegistration) {
        let expires_at = Instant::now() + self.ttl;
        lock(&self.tables).peers.insert(
            registration.public_key.clone(),
            Entry {
                value: registration,
                expires_at,
            },
        );
    }

    fn get_peer(&self, public_key: &str) -> Option<PeerRegistration> {
        let now = Instant::now();
        let mut guard = lock(&self.tables);
        match guard.peers.get(public_key).map(|e| e.live(now)) {
            Some(Some(reg)) => Some(reg),
            Some(None) => {
                guard.peers.remove(public_key);
                None
            }
            None => None,
        }
    }

    fn put_token_state(&self, state: TokenState) {
        lock(&self.tables)
            .tokens
            .insert(state.relay_key.clone(), state);
    }

    fn get_token_state(&self, relay_key: &str) -> Option<TokenState> {
        lock(&self.tables).tokens.get(relay_key).cloned()
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut guard = lock(&self.tables);
        let before = guard.relays.len() + guard.peers.len();
        guard.relays.retain(|_, e| now < e.expires_at);
        guard.peers.retain(|_, e| now < e.expires_at);
        before - (guard.relays.len() + guard.peers.len())
    }

    fn close(&self) {
        let mut guard = lock(&self.tables);
        guard.relays.clear();
        guard.peers.clear();
        guard.tokens.clear();
    }
}
