//! Sequence-numbered relay access tokens.
//!
//! Wire form is `base64url(payload_json) + "." + base64url(hmac_sha256)`.
//! Each relay has exactly one live `TokenState`; a token verifies only while
//! its sequence equals the stored one. Refresh and revoke both advance the
//! sequence under a single lock so no two callers can observe the same value.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::registration_store::RegistrationStore;
use crate::util::{lock, now_ms};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token-malformed")]
    Malformed,
    #[error("token-mismatch")]
    Mismatch,
    #[error("token-stale")]
    Stale,
    #[error("token-revoked")]
    Revoked,
    #[error("token-expired")]
    Expired,
    #[error("unknown relay: {0}")]
    UnknownRelay(String),
    #[error("token-signing: {0}")]
    Signing(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub relay_key: String,
    pub sequence: u64,
    pub scope: String,
    pub pubkey: Option<String>,
    pub relay_auth_token: Option<String>,
    pub issued_at: u64,
    pub expires_at: u64,
    pub revoked: bool,
}

impl TokenState {
    pub fn fresh(
        relay_key: &str,
        sequence: u64,
        scope: &str,
        pubkey: Option<String>,
        relay_auth_token: Option<String>,
        issued_at: u64,
        expires_at: u64,
    ) -> Self {
        Self {
            relay_key: relay_key.to_string(),
            sequence,
            scope: scope.to_string(),
            pubkey,
            relay_auth_token,
            issued_at,
            expires_at,
            revoked: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    pub relay_key: String,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    pub sequence: u64,
    pub issued_at: u64,
    pub expires_at: u64,
}

#[derive(Clone, Debug, Default)]
pub struct IssueRequest {
    pub relay_auth_token: Option<String>,
    pub scope: String,
    pub pubkey: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: u64,
    pub sequence: u64,
}

pub fn create_signature(payload: &str, secret: &[u8]) -> Result<String, TokenError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| TokenError::Signing(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

pub fn verify_signature(payload: &str, signature: &str, secret: &[u8]) -> bool {
    match create_signature(payload, secret) {
        Ok(expected) => expected.as_bytes().ct_eq(signature.as_bytes()).into(),
        Err(_) => false,
    }
}

pub struct AccessTokenService {
    store: Arc<dyn RegistrationStore>,
    secret: Zeroizing<Vec<u8>>,
    ttl: Duration,
    sequence_lock: Mutex<()>,
}

impl AccessTokenService {
    pub fn new(store: Arc<dyn RegistrationStore>, secret: Vec<u8>, ttl: Duration) -> Self {
        Self {
            store,
            secret: Zeroizing::new(secret),
            ttl,
            sequence_lock: Mutex::new(()),
        }
    }

    pub fn issue_token(&self, relay_key: &str, req: IssueRequest) -> Result<IssuedToken, TokenError> {
        let _guard = lock(&self.sequence_lock);
        let sequence = self
            .store
            .get_token_state(relay_key)
            .map(|s| s.sequence + 1)
            .unwrap_or(1);
        let issued = self.mint(relay_key, sequence, req.scope, req.pubkey, req.relay_auth_token)?;
        tracing::info!(relay = %relay_key, sequence, "access token issued");
        Ok(issued)
    }

    pub fn verify_token(&self, token: &str, relay_key: &str) -> Result<TokenPayload, TokenError> {
        let payload = self.decode(token)?;
        if payload.relay_key != relay_key {
            return Err(TokenError::Mismatch);
        }
        let state = self
            .store
            .get_token_state(relay_key)
            .ok_or(TokenError::Mismatch)?;
        if state.revoked {
            return Err(TokenError::Revoked);
        }
        if payload.sequence < state.sequence {
            return Err(TokenError::Stale);
        }
        if payload.sequence != state.sequence {
            return Err(TokenError::Mismatch);
        }
        if now_ms() >= payload.expires_at {
            return Err(TokenError::Expired);
        }
        Ok(payload)
    }

    pub fn refresh_token(&self, relay_key: &str, token: &str) -> Result<IssuedToken, TokenError> {
        let _guard = lock(&self.sequence_lock);
        let current = self.verify_token(token, relay_key)?;
        let issued = self.mint(
            relay_key,
            current.sequence + 1,
            current.scope,
            current.pubkey,
            current.relay_auth_token,
        )?;
        tracing::info!(relay = %relay_key, sequence = issued.sequence, "access token refreshed");
        Ok(issued)
    }

    /// Advances the sequence without minting a usable token. Returns the new
    /// sequence.
    pub fn revoke_token(&self, relay_key: &str) -> Result<u64, TokenError> {
        let _guard = lock(&self.sequence_lock);
        let mut state = self
            .store
            .get_token_state(relay_key)
            .ok_or_else(|| TokenError::UnknownRelay(relay_key.to_string()))?;
        state.sequence += 1;
        state.revoked = true;
        let sequence = state.sequence;
        self.store.put_token_state(state);
        tracing::warn!(relay = %relay_key, sequence, "access token revoked");
        Ok(sequence)
    }

    fn mint(
        &self,
        relay_key: &str,
        sequence: u64,
        scope: String,
        pubkey: Option<String>,
        relay_auth_token: Option<String>,
    ) -> Result<IssuedToken, TokenError> {
        let issued_at = now_ms();
        let expires_at = issued_at + self.ttl.as_millis() as u64;
        let payload = TokenPayload {
            relay_key: relay_key.to_string(),
            scope: scope.clone(),
            relay_auth_token: relay_auth_token.clone(),
            pubkey: pubkey.clone(),
            sequence,
            issued_at,
            expires_at,
        };
        let json = serde_json::to_vec(&payload).map_err(|e| TokenError::Signing(e.to_string()))?;
        let encoded = URL_SAFE_NO_PAD.encode(json);
        let signature = create_signature(&encoded, &self.secret)?;
        self.store.put_token_state(TokenState::fresh(
            relay_key,
            sequence,
            &scope,
            pubkey,
            relay_auth_token,
            issued_at,
            expires_at,
        ));
        Ok(IssuedToken {
            token: format!("{encoded}.{signature}"),
            expires_at,
            sequence,
        })
    }

    fn decode(&self, token: &str) -> Result<TokenPayload, TokenError> {
        let (encoded, signature) = token.split_once('.').ok_or(TokenError::Malformed)?;
        if !verify_signature(encoded, signature, &self.secret) {
            return Err(TokenError::Mismatch);
        }
        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| TokenError::Malformed)?;
        serde_json::from_slice(&raw).map_err(|_| TokenError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        create_signature, verify_signature, AccessTokenService, IssueRequest, TokenError,
    };
    use crate::registration_store::MemoryRegistrationStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn service() -> AccessTokenService {
        let store = Arc::new(MemoryRegistrationStore::new(Duration::from_secs(60)));
        AccessTokenService::new(store, b"test-secret".to_vec(), Duration::from_secs(60))
    }

    fn request() -> IssueRequest {
        IssueRequest {
            relay_auth_token: Some("auth-1".to_string()),
            scope: "relay:write".to_string(),
            pubkey: Some("ab".repeat(32)),
        }
    }

    #[test]
    fn first_issue_starts_at_one_and_verifies() {
        let svc = service();
        let issued = svc.issue_token("relay-1", request()).expect("issue");
        assert_eq!(issued.sequence, 1);

        let payload = svc.verify_token(&issued.token, "relay-1").expect("verify");
        assert_eq!(payload.relay_key, "relay-1");
        assert_eq!(payload.scope, "relay:write");
        assert_eq!(payload.relay_auth_token.as_deref(), Some("auth-1"));
        assert_eq!(payload.expires_at, issued.expires_at);
    }

    #[test]
    fn verify_rejects_other_relay() {
        let svc = service();
        let issued = svc.issue_token("relay-1", request()).expect("issue");
        assert_eq!(svc.verify_token(&issued.token, "relay-2"), Err(TokenError::Mismatch));
    }

    #[test]
    fn refresh_increments_and_stales_old_token() {
        let svc = service();
        let first = svc.issue_token("relay-1", request()).expect("issue");
        let second = svc.refresh_token("relay-1", &first.token).expect("refresh");
        assert_eq!(second.sequence, 2);

        assert_eq!(svc.verify_token(&first.token, "relay-1"), Err(TokenError::Stale));
        let payload = svc.verify_token(&second.token, "relay-1").expect("verify new");
        assert_eq!(payload.scope, "relay:write");

        assert_eq!(svc.refresh_token("relay-1", &first.token), Err(TokenError::Stale));
    }

    #[test]
    fn revoke_invalidates_every_issued_token() {
        let svc = service();
        let first = svc.issue_token("relay-1", request()).expect("issue");
        let second = svc.refresh_token("relay-1", &first.token).expect("refresh");
        assert_eq!(svc.revoke_token("relay-1"), Ok(3));

        assert!(svc.verify_token(&first.token, "relay-1").is_err());
        assert_eq!(svc.verify_token(&second.token, "relay-1"), Err(TokenError::Revoked));
        assert!(svc.refresh_token("relay-1", &second.token).is_err());
    }

    #[test]
    fn reissue_after_revoke_never_reuses_a_sequence() {
        let svc = service();
        svc.issue_token("relay-1", request()).expect("issue");
        svc.revoke_token("relay-1").expect("revoke");
        let again = svc.issue_token("relay-1", request()).expect("reissue");
        assert_eq!(again.sequence, 3);
        assert!(svc.verify_token(&again.token, "relay-1").is_ok());
    }

    #[test]
    fn revoke_unknown_relay_is_an_error() {
        let svc = service();
        assert!(matches!(svc.revoke_token("missing"), Err(TokenError::UnknownRelay(_))));
    }

    #[test]
    fn expired_token_fails() {
        let store = Arc::new(MemoryRegistrationStore::new(Duration::from_secs(60)));
        let svc = AccessTokenService::new(store, b"s".to_vec(), Duration::ZERO);
        let issued = svc.issue_token("relay-1", request()).expect("issue");
        assert_eq!(svc.verify_token(&issued.token, "relay-1"), Err(TokenError::Expired));
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        let svc = service();
        svc.issue_token("relay-1", request()).expect("issue");
        assert_eq!(svc.verify_token("no-dot", "relay-1"), Err(TokenError::Malformed));
        assert_eq!(svc.verify_token("abc.def", "relay-1"), Err(TokenError::Mismatch));
    }

    #[test]
    fn signature_detects_any_single_character_change() {
        let secret = b"secret";
        let payload = "eyJyZWxheUtleSI6InIxIn0";
        let sig = create_signature(payload, secret).expect("sign");
        assert!(verify_signature(payload, &sig, secret));

        for (i, c) in sig.char_indices() {
            let replacement = if c == 'A' { 'B' } else { 'A' };
            let mut tampered = sig.clone();
            tampered.replace_range(i..i + 1, &replacement.to_string());
            assert!(!verify_signature(payload, &tampered, secret), "tamper at {i}");
        }
        assert!(!verify_signature(payload, &sig, b"other"));
        assert!(!verify_signature("other", &sig, secret));
    }

    #[test]
    fn concurrent_refreshes_cannot_share_a_sequence() {
        let svc = Arc::new(service());
        let first = svc.issue_token("relay-1", request()).expect("issue");
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let svc = svc.clone();
                let token = first.token.clone();
                std::thread::spawn(move || svc.refresh_token("relay-1", &token))
            })
            .collect();
        let ok = handles
            .into_iter()
            .filter_map(|h| h.join().expect("join").ok())
            .count();
        assert_eq!(ok, 1);
    }
}
