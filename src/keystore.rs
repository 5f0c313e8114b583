//! Encrypted at-rest storage for the gateway's long-lived secrets: the relay
//! host admin keypair and the token signing key.
//!
//! The envelope key comes from the OS keyring when available, otherwise from
//! `RELAY_GATEWAY_PASSPHRASE` (Argon2id) or a generated key file next to the
//! store.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::Zeroizing;

use crate::nostr::{self, AdminKeyPair};

const KEYRING_SERVICE: &str = "relay-gateway";
const KEYRING_USER: &str = "envelope-key";
const KEY_FILE_NAME: &str = "secrets.key";
const STORE_FILE_NAME: &str = "secrets.json";
const KEY_BYTES: usize = 32;
const TOKEN_SECRET_BYTES: usize = 32;
const ENV_NO_KEYRING: &str = "RELAY_GATEWAY_NO_KEYRING";
const ENV_PASSPHRASE: &str = "RELAY_GATEWAY_PASSPHRASE";

pub struct GatewaySecrets {
    pub admin: AdminKeyPair,
    pub token_secret: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for GatewaySecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySecrets")
            .field("admin_pubkey", &self.admin.pubkey)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySourceKind {
    Keyring,
    Passphrase,
    KeyFile,
}

impl std::fmt::Display for KeySourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            KeySourceKind::Keyring => "keyring",
            KeySourceKind::Passphrase => "passphrase",
            KeySourceKind::KeyFile => "keyfile",
        })
    }
}

#[derive(Serialize, Deserialize)]
struct SecretsPayload {
    admin_pubkey: String,
    admin_sk_hex: String,
    token_secret: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Argon2Params {
    mem_kib: u32,
    iterations: u32,
    parallelism: u32,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u8,
    salt: String,
    nonce: String,
    ciphertext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    argon2: Option<Argon2Params>,
}

enum KeySource {
    RawKey(Zeroizing<Vec<u8>>),
    Passphrase(Zeroizing<String>),
}

/// Opens the store under `data_dir`, creating fresh secrets on first run.
pub fn load_or_init(data_dir: &Path) -> Result<(GatewaySecrets, KeySourceKind)> {
    std::fs::create_dir_all(data_dir)?;
    let (source, kind) = select_key_source(data_dir)?;
    let secrets = open_with(data_dir, &source)?;
    tracing::info!(source = %kind, admin = %secrets.admin.pubkey, "keystore ready");
    Ok((secrets, kind))
}

fn open_with(dir: &Path, source: &KeySource) -> Result<GatewaySecrets> {
    let store_path = dir.join(STORE_FILE_NAME);
    if store_path.exists() {
        let env: Envelope = serde_json::from_str(&std::fs::read_to_string(&store_path)?)?;
        let payload = open_envelope(&env, source)?;
        let token_secret = STANDARD_NO_PAD
            .decode(payload.token_secret.trim())
            .map_err(|_| anyhow!("invalid token secret"))?;
        if nostr::pubkey_from_sk_hex(&payload.admin_sk_hex)? != payload.admin_pubkey {
            return Err(anyhow!("keystore admin keypair does not match"));
        }
        return Ok(GatewaySecrets {
            admin: AdminKeyPair {
                pubkey: payload.admin_pubkey,
                sk_hex: payload.admin_sk_hex,
            },
            token_secret: Zeroizing::new(token_secret),
        });
    }

    let admin = AdminKeyPair::generate();
    let mut token_secret = Zeroizing::new(vec![0u8; TOKEN_SECRET_BYTES]);
    rand::thread_rng().fill_bytes(&mut token_secret);
    let payload = SecretsPayload {
        admin_pubkey: admin.pubkey.clone(),
        admin_sk_hex: admin.sk_hex.clone(),
        token_secret: STANDARD_NO_PAD.encode(token_secret.as_slice()),
    };
    let env = seal_envelope(&payload, source)?;
    std::fs::write(&store_path, serde_json::to_string_pretty(&env)?)?;
    restrict_permissions(&store_path);
    Ok(GatewaySecrets { admin, token_secret })
}

fn select_key_source(dir: &Path) -> Result<(KeySource, KeySourceKind)> {
    if std::env::var(ENV_NO_KEYRING).ok().as_deref() == Some("1") {
        return passphrase_or_file(dir);
    }

    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER) {
        if let Ok(secret) = entry.get_password() {
            let bytes = STANDARD_NO_PAD
                .decode(secret.trim())
                .map_err(|_| anyhow!("invalid keyring secret"))?;
            if bytes.len() == KEY_BYTES {
                return Ok((KeySource::RawKey(Zeroizing::new(bytes)), KeySourceKind::Keyring));
            }
        }
        let key = random_key();
        if entry.set_password(&STANDARD_NO_PAD.encode(key.as_slice())).is_ok() {
            return Ok((KeySource::RawKey(key), KeySourceKind::Keyring));
        }
        tracing::debug!("keyring unavailable, falling back");
    }

    passphrase_or_file(dir)
}

fn passphrase_or_file(dir: &Path) -> Result<(KeySource, KeySourceKind)> {
    if let Ok(pass) = std::env::var(ENV_PASSPHRASE) {
        if !pass.trim().is_empty() {
            return Ok((KeySource::Passphrase(Zeroizing::new(pass)), KeySourceKind::Passphrase));
        }
    }

    let key_path = dir.join(KEY_FILE_NAME);
    if key_path.exists() {
        let raw = std::fs::read_to_string(&key_path)?;
        let bytes = STANDARD_NO_PAD
            .decode(raw.trim())
            .map_err(|_| anyhow!("invalid key file"))?;
        if bytes.len() != KEY_BYTES {
            return Err(anyhow!("invalid key file length"));
        }
        return Ok((KeySource::RawKey(Zeroizing::new(bytes)), KeySourceKind::KeyFile));
    }

    let key = random_key();
    std::fs::write(&key_path, STANDARD_NO_PAD.encode(key.as_slice()))?;
    restrict_permissions(&key_path);
    tracing::warn!(path = %key_path.display(), "generated plaintext envelope key file");
    Ok((KeySource::RawKey(key), KeySourceKind::KeyFile))
}

fn random_key() -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; KEY_BYTES]);
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn derive_key(pass: &str, salt: &[u8], p: Argon2Params) -> Result<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(vec![0u8; KEY_BYTES]);
    let params = argon2::Params::new(p.mem_kib, p.iterations, p.parallelism, Some(KEY_BYTES))
        .map_err(|_| anyhow!("invalid argon2 params"))?;
    argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params)
        .hash_password_into(pass.as_bytes(), salt, &mut out)
        .map_err(|_| anyhow!("argon2 failed"))?;
    Ok(out)
}

fn envelope_key(source: &KeySource, salt: &[u8], argon: Option<Argon2Params>) -> Result<Zeroizing<Vec<u8>>> {
    match (source, argon) {
        (KeySource::RawKey(k), None) => Ok(k.clone()),
        (KeySource::Passphrase(pass), Some(params)) => derive_key(pass, salt, params),
        (KeySource::RawKey(_), Some(_)) => Err(anyhow!("keystore is passphrase protected")),
        (KeySource::Passphrase(_), None) => Err(anyhow!("passphrase provided but keystore uses a raw key")),
    }
}

fn seal_envelope(payload: &SecretsPayload, source: &KeySource) -> Result<Envelope> {
    let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
    let (salt, argon) = match source {
        KeySource::RawKey(_) => (Vec::new(), None),
        KeySource::Passphrase(_) => {
            let mut salt = vec![0u8; 16];
            rand::thread_rng().fill_bytes(&mut salt);
            let params = Argon2Params {
                mem_kib: 64 * 1024,
                iterations: 3,
                parallelism: 1,
            };
            (salt, Some(params))
        }
    };
    let key = envelope_key(source, &salt, argon)?;

    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = ChaCha20Poly1305::new(Key::from_slice(&key))
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| anyhow!("encrypt failed"))?;

    Ok(Envelope {
        version: 1,
        salt: STANDARD_NO_PAD.encode(&salt),
        nonce: STANDARD_NO_PAD.encode(nonce),
        ciphertext: STANDARD_NO_PAD.encode(&ciphertext),
        argon2: argon,
    })
}

fn open_envelope(env: &Envelope, source: &KeySource) -> Result<SecretsPayload> {
    if env.version != 1 {
        return Err(anyhow!("unsupported keystore version {}", env.version));
    }
    let decode = |field: &str, what: &str| {
        STANDARD_NO_PAD
            .decode(field.trim())
            .map_err(|_| anyhow!("invalid {what}"))
    };
    let salt = decode(&env.salt, "salt")?;
    let nonce = decode(&env.nonce, "nonce")?;
    let ciphertext = decode(&env.ciphertext, "ciphertext")?;
    if nonce.len() != 12 {
        return Err(anyhow!("invalid nonce length"));
    }

    let key = envelope_key(source, &salt, env.argon2)?;
    let plaintext = Zeroizing::new(
        ChaCha20Poly1305::new(Key::from_slice(&key))
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| anyhow!("decrypt failed"))?,
    );
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::{open_with, KeySource, Argon2Params, derive_key, STORE_FILE_NAME};
    use zeroize::Zeroizing;

    fn raw_source(byte: u8) -> KeySource {
        KeySource::RawKey(Zeroizing::new(vec![byte; 32]))
    }

    #[test]
    fn secrets_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = open_with(dir.path(), &raw_source(7)).expect("create");
        assert!(dir.path().join(STORE_FILE_NAME).exists());
        assert_eq!(first.token_secret.len(), 32);

        let again = open_with(dir.path(), &raw_source(7)).expect("reopen");
        assert_eq!(again.admin, first.admin);
        assert_eq!(again.token_secret.as_slice(), first.token_secret.as_slice());
        assert!(!format!("{again:?}").contains(&again.admin.sk_hex));
    }

    #[test]
    fn wrong_key_or_kind_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        open_with(dir.path(), &raw_source(7)).expect("create");
        assert!(open_with(dir.path(), &raw_source(8)).is_err());
        let pass = KeySource::Passphrase(Zeroizing::new("hunter2".to_string()));
        assert!(open_with(dir.path(), &pass).is_err());
    }

    #[test]
    fn passphrase_derivation_is_deterministic_per_salt() {
        let params = Argon2Params {
            mem_kib: 1024,
            iterations: 1,
            parallelism: 1,
        };
        let a = derive_key("pass", b"0123456789abcdef", params).expect("kdf");
        let b = derive_key("pass", b"0123456789abcdef", params).expect("kdf");
        let c = derive_key("pass", b"fedcba9876543210", params).expect("kdf");
        assert_eq!(a.as_slice(), b.as_slice());
        assert_ne!(a.as_slice(), c.as_slice());
    }
}
