use anyhow::{anyhow, Result};
use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::util::is_hex_of_len;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NostrEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NostrUnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Admin identity of a gateway-owned relay host, hex encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminKeyPair {
    pub pubkey: String,
    pub sk_hex: String,
}

impl AdminKeyPair {
    pub fn generate() -> Self {
        let (pubkey, sk_hex) = generate_keypair();
        Self { pubkey, sk_hex }
    }
}

pub fn generate_keypair() -> (String, String) {
    let secp = Secp256k1::new();
    let (sk, _pk) = secp.generate_keypair(&mut rand::thread_rng());
    let keypair = Keypair::from_secret_key(&secp, &sk);
    (xonly_pk_hex(&keypair), hex::encode(sk.secret_bytes()))
}

pub fn pubkey_from_sk_hex(sk_hex: &str) -> Result<String> {
    let keypair = keypair_from_hex(sk_hex)?;
    Ok(xonly_pk_hex(&keypair))
}

pub fn build_unsigned_event(
    pubkey: &str,
    kind: u32,
    tags: Vec<Vec<String>>,
    content: String,
    created_at: u64,
) -> NostrUnsignedEvent {
    NostrUnsignedEvent {
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags,
        content,
    }
}

pub fn sign_event(unsigned: &NostrUnsignedEvent, sk_hex: &str) -> Result<NostrEvent> {
    let id = event_id_hex(unsigned)?;
    let hash = hex::decode(&id)?;
    let keypair = keypair_from_hex(sk_hex)?;
    let sig = Secp256k1::new().sign_schnorr(&hash, &keypair);

    Ok(NostrEvent {
        id,
        pubkey: unsigned.pubkey.clone(),
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags.clone(),
        content: unsigned.content.clone(),
        sig: hex::encode(sig.as_ref()),
    })
}

pub fn event_id_hex(unsigned: &NostrUnsignedEvent) -> Result<String> {
    let content = json!([
        0,
        unsigned.pubkey,
        unsigned.created_at,
        unsigned.kind,
        unsigned.tags,
        unsigned.content,
    ]);
    let raw = serde_json::to_string(&content).map_err(|_| anyhow!("event serialize failed"))?;
    Ok(hex::encode(Sha256::digest(raw.as_bytes())))
}

/// Full check: recomputed id plus Schnorr signature.
pub fn verify_event(ev: &NostrEvent) -> Result<bool> {
    let unsigned = NostrUnsignedEvent {
        pubkey: ev.pubkey.clone(),
        created_at: ev.created_at,
        kind: ev.kind,
        tags: ev.tags.clone(),
        content: ev.content.clone(),
    };
    if event_id_hex(&unsigned)? != ev.id {
        return Ok(false);
    }
    let hash = hex::decode(&ev.id)?;
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?).map_err(|_| anyhow!("invalid signature"))?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?).map_err(|_| anyhow!("invalid pubkey"))?;
    Ok(Secp256k1::new().verify_schnorr(&sig, &hash, &pk).is_ok())
}

/// Shape-only validation of a raw event value. Returns the parsed event or a
/// short rejection reason suitable for an `OK` frame.
pub fn parse_structural(value: &Value) -> std::result::Result<NostrEvent, &'static str> {
    if !value.is_object() {
        return Err("invalid: event must be an object");
    }
    let ev: NostrEvent =
        serde_json::from_value(value.clone()).map_err(|_| "invalid: malformed event fields")?;
    if !is_hex_of_len(&ev.id, 64) {
        return Err("invalid: bad event id");
    }
    if !is_hex_of_len(&ev.pubkey, 64) {
        return Err("invalid: bad pubkey");
    }
    if !is_hex_of_len(&ev.sig, 128) {
        return Err("invalid: bad signature encoding");
    }
    if ev.created_at == 0 {
        return Err("invalid: missing created_at");
    }
    Ok(ev)
}

pub fn frame_ok(event_id: &str, accepted: bool, message: &str) -> String {
    json!(["OK", event_id, accepted, message]).to_string()
}

pub fn frame_notice(message: &str) -> String {
    json!(["NOTICE", message]).to_string()
}

fn keypair_from_hex(sk_hex: &str) -> Result<Keypair> {
    let sk_bytes = hex::decode(sk_hex.trim()).map_err(|_| anyhow!("invalid nostr sk"))?;
    let sk = SecretKey::from_slice(&sk_bytes).map_err(|_| anyhow!("invalid nostr sk"))?;
    Ok(Keypair::from_secret_key(&Secp256k1::new(), &sk))
}

fn xonly_pk_hex(keypair: &Keypair) -> String {
    let (pk, _) = XOnlyPublicKey::from_keypair(keypair);
    hex::encode(pk.serialize())
}

#[cfg(test)]
pub(crate) fn signed_test_event(kind: u32, content: &str) -> NostrEvent {
    let (pk, sk) = generate_keypair();
    let unsigned = build_unsigned_event(&pk, kind, vec![], content.to_string(), crate::util::now_unix_seconds());
    sign_event(&unsigned, &sk).expect("sign event")
}

#[cfg(test)]
mod tests {
    use super::{frame_ok, parse_structural, pubkey_from_sk_hex, signed_test_event, verify_event};
    use serde_json::{json, Value};

    #[test]
    fn signed_event_verifies_and_passes_structure() {
        let ev = signed_test_event(1, "hello");
        assert!(verify_event(&ev).expect("verify"));
        let val = serde_json::to_value(&ev).expect("value");
        assert_eq!(parse_structural(&val).expect("structure").id, ev.id);
    }

    #[test]
    fn tampered_content_fails_verification() {
        let mut ev = signed_test_event(1, "hello");
        ev.content = "bye".to_string();
        assert!(!verify_event(&ev).expect("verify"));
    }

    #[test]
    fn structure_rejects_short_fields() {
        let ev = signed_test_event(1, "hello");
        let mut val = serde_json::to_value(&ev).expect("value");
        val["sig"] = json!("00");
        assert_eq!(parse_structural(&val).unwrap_err(), "invalid: bad signature encoding");
        assert!(parse_structural(&json!("not-an-event")).is_err());
        assert!(parse_structural(&json!({"id": ev.id})).is_err());
    }

    #[test]
    fn pubkey_derivation_matches_generated() {
        let (pk, sk) = super::generate_keypair();
        assert_eq!(pubkey_from_sk_hex(&sk).expect("derive"), pk);
    }

    #[test]
    fn ok_frame_shape() {
        let v: Value = serde_json::from_str(&frame_ok("abc", true, "")).expect("json");
        assert_eq!(v, json!(["OK", "abc", true, ""]));
    }
}
