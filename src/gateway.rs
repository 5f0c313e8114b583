//! Composition root: builds every component from `Config` and exposes the
//! peer registration endpoint.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::blind_peer::{canonicalize, AssignmentRecord, BlindPeerService};
use crate::config::Config;
use crate::controller::ProtocolController;
use crate::dispatcher::{DispatcherEvent, RelayDispatcher};
use crate::escrow_tls;
use crate::job::AssignmentStatus;
use crate::keystore::GatewaySecrets;
use crate::lease_vault::{LeaseVault, LeaseVaultOptions};
use crate::observer::Subscription;
use crate::registration_store::{MemoryRegistrationStore, PeerRegistration, RegistrationStore};
use crate::relay::LegacyRelayForwarder;
use crate::relay_host::{HostOptions, ReplicatedRelayHost};
use crate::server::SessionContext;
use crate::token::AccessTokenService;
use crate::util::now_ms;

pub const REGISTER_PATH: &str = "/gateway/register";
const HOST_DIR_NAME: &str = "relay-host";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub public_key: String,
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub public_key: String,
    pub relays: Vec<String>,
    pub newly_trusted: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("invalid publicKey: {0}")]
    InvalidKey(String),
    #[error("relay keys must be non-empty")]
    InvalidRelay,
    #[error("endpoint must be a ws:// or wss:// url")]
    InvalidEndpoint,
}

pub struct GatewayService {
    config: Config,
    store: Arc<dyn RegistrationStore>,
    tokens: Arc<AccessTokenService>,
    leases: Arc<LeaseVault>,
    blind_peers: Arc<BlindPeerService>,
    host: Arc<ReplicatedRelayHost>,
    dispatcher: Arc<RelayDispatcher>,
    controller: Arc<ProtocolController>,
    _mirror: Subscription,
}

impl GatewayService {
    /// Builds and starts every component. The relay host log lives under
    /// `<dataDir>/relay-host`.
    pub async fn build(config: Config, secrets: &GatewaySecrets) -> Result<Arc<Self>> {
        // No escrow client lives in this process; building the config checks
        // the configured files before anything starts.
        let escrow_tls = escrow_tls::build_client_config(&config.escrow.tls)?;
        let store: Arc<dyn RegistrationStore> = Arc::new(MemoryRegistrationStore::new(Duration::from_secs(
            config.registration.ttl_secs,
        )));
        let tokens = Arc::new(AccessTokenService::new(
            store.clone(),
            secrets.token_secret.to_vec(),
            Duration::from_secs(config.tokens.ttl_secs),
        ));
        let leases = Arc::new(LeaseVault::new(LeaseVaultOptions {
            wipe_on_shutdown: config.lease.wipe_on_shutdown,
        }));
        let blind_peers = Arc::new(BlindPeerService::new(config.blind_peer.clone()));

        let host = Arc::new(ReplicatedRelayHost::new(HostOptions {
            telemetry_interval: Duration::from_millis(config.host.telemetry_interval_ms),
            verify_signatures: config.host.verify_signatures,
        }));
        let host_dir = PathBuf::from(&config.data_dir).join(HOST_DIR_NAME);
        host.initialize(&host_dir, secrets.admin.clone(), None).await?;
        host.start().await?;

        let dispatcher = Arc::new(RelayDispatcher::new((&config.dispatcher).into()));
        let dispatcher_enabled = config.dispatcher.enabled;
        let forwarder = Arc::new(LegacyRelayForwarder::new(
            store.clone(),
            dispatcher_enabled.then(|| dispatcher.clone()),
        ));
        let controller = Arc::new(ProtocolController::new(
            host.clone(),
            dispatcher.clone(),
            forwarder,
            dispatcher_enabled,
        ));
        let mirror = mirror_blind_assignments(&dispatcher, blind_peers.clone());

        tracing::info!(
            dispatcher = dispatcher_enabled,
            blind_peers = blind_peers.is_enabled(),
            escrow_tls = escrow_tls.is_some(),
            "gateway components ready"
        );

        Ok(Arc::new(Self {
            config,
            store,
            tokens,
            leases,
            blind_peers,
            host,
            dispatcher,
            controller,
            _mirror: mirror,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RegistrationStore> {
        &self.store
    }

    pub fn tokens(&self) -> &Arc<AccessTokenService> {
        &self.tokens
    }

    pub fn leases(&self) -> &Arc<LeaseVault> {
        &self.leases
    }

    pub fn blind_peers(&self) -> &Arc<BlindPeerService> {
        &self.blind_peers
    }

    pub fn host(&self) -> &Arc<ReplicatedRelayHost> {
        &self.host
    }

    pub fn dispatcher(&self) -> &Arc<RelayDispatcher> {
        &self.dispatcher
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            controller: self.controller.clone(),
            tokens: self.tokens.clone(),
            store: self.store.clone(),
        }
    }

    /// Trusts the peer and merges it into each listed relay's peer list.
    /// Nothing is written when any input is invalid.
    pub fn register_peer(&self, req: RegisterRequest) -> Result<RegisterResponse, RegisterError> {
        let key = canonicalize(req.public_key.as_str()).map_err(|e| RegisterError::InvalidKey(e.to_string()))?;
        let relays: Vec<String> = req.relays.iter().map(|r| r.trim().to_string()).collect();
        if relays.iter().any(String::is_empty) {
            return Err(RegisterError::InvalidRelay);
        }
        let endpoint = match req.endpoint.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => Some(url.to_string()),
            Some(_) => return Err(RegisterError::InvalidEndpoint),
        };

        let newly_trusted = self
            .blind_peers
            .add_trusted_peer(&key)
            .map_err(|e| RegisterError::InvalidKey(e.to_string()))?;
        let now = now_ms();
        self.store.put_peer(PeerRegistration {
            public_key: key.to_string(),
            relays: relays.clone(),
            endpoint,
            registered_at: now,
        });
        for relay_key in &relays {
            self.store.add_relay_peer(relay_key, key.as_str(), now);
        }
        tracing::info!(peer = %key, relays = relays.len(), newly_trusted, "peer registered");

        Ok(RegisterResponse {
            public_key: key.to_string(),
            relays,
            newly_trusted,
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(REGISTER_PATH, post(register_handler))
            .with_state(self.clone())
    }

    /// Lease secrets are wiped by the vault's own shutdown hook, not here.
    pub fn shutdown(&self) {
        self.host.stop();
        self.store.close();
        tracing::info!("gateway stopped");
    }
}

fn mirror_blind_assignments(dispatcher: &RelayDispatcher, blind: Arc<BlindPeerService>) -> Subscription {
    dispatcher.subscribe(move |event| match event {
        DispatcherEvent::Assignment { job_id, peer_id, job, .. } => {
            if blind.is_trusted_peer(peer_id.as_str()) {
                blind.record_dispatcher_assignment(AssignmentRecord {
                    job_id: job_id.clone(),
                    peer_key: peer_id.clone(),
                    relay_key: job.relay_key.clone(),
                    filters: job.filters.clone(),
                    requester: job.requester.clone(),
                });
            }
        }
        DispatcherEvent::Acknowledge { job_key, .. } => {
            blind.clear_dispatcher_assignment(job_key, AssignmentStatus::Completed);
        }
        DispatcherEvent::Failure { job_key, .. } => {
            blind.clear_dispatcher_assignment(job_key, AssignmentStatus::Failed);
        }
    })
}

async fn register_handler(
    State(gateway): State<Arc<GatewayService>>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    match gateway.register_peer(req) {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "peer registration rejected");
            bad_request(err.to_string())
        }
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}
