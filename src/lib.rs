//! Relay gateway library surface.
//!
//! The gateway fronts peer-hosted Nostr relays:
//! - client sessions, event ingestion and REQ dispatch
//! - scoped access tokens and delegated write leases
//! - trust bookkeeping for blind peers
//! - encrypted keystore and configuration

/// Trusted blind peers and mirrored dispatcher assignments.
pub mod blind_peer;
/// JSON configuration with serde defaults.
pub mod config;
/// Per-connection frame routing.
pub mod controller;
/// Weighted job scheduling with circuit breaking.
pub mod dispatcher;
/// Rustls client configuration for the escrow service.
pub mod escrow_tls;
/// Composition root and the peer registration endpoint.
pub mod gateway;
/// Job and assignment records.
pub mod job;
/// Encrypted admin keypair and token secret storage.
pub mod keystore;
/// Write-capability leases with redacted views.
pub mod lease_vault;
/// Nostr key/event/signature helpers used across gateway modules.
pub mod nostr;
/// Typed listener sets.
pub mod observer;
/// TTL store for relay and peer registrations and token state.
pub mod registration_store;
/// Upstream peer relay links.
pub mod relay;
/// Append-only event log with telemetry.
pub mod relay_host;
/// Client websocket listener.
pub mod server;
/// Sequence-numbered relay access tokens.
pub mod token;
/// Shared utility helpers.
pub mod util;
