//! Client-facing relay listener (ws and wss).
//!
//! Clients connect to `/relay/<relayKey>`, optionally with `?token=<token>`.
//! Each connection becomes one controller `Session`; outbound frames flow
//! through a dedicated writer task so upstream links and the controller can
//! send without holding the socket.

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::Message;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};

use crate::controller::{ProtocolController, Session};
use crate::nostr::frame_notice;
use crate::registration_store::RegistrationStore;
use crate::token::AccessTokenService;

const RELAY_PATH_PREFIX: &str = "/relay/";

pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// What a connection needs from the gateway.
#[derive(Clone)]
pub struct SessionContext {
    pub controller: Arc<ProtocolController>,
    pub tokens: Arc<AccessTokenService>,
    pub store: Arc<dyn RegistrationStore>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    relay_key: String,
    token: Option<String>,
}

fn parse_target(uri: &Uri) -> Option<Target> {
    let relay_key = uri.path().strip_prefix(RELAY_PATH_PREFIX)?.trim_end_matches('/');
    if relay_key.is_empty() || relay_key.contains('/') {
        return None;
    }
    let token = uri.query().and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == "token")
            .map(|(_, v)| v.to_string())
            .filter(|v| !v.is_empty())
    });
    Some(Target {
        relay_key: relay_key.to_string(),
        token,
    })
}

pub async fn start_listeners(
    ws_bind: Option<String>,
    wss_bind: Option<String>,
    tls: Option<TlsConfig>,
    ctx: SessionContext,
) -> Result<Vec<JoinHandle<()>>> {
    let mut tasks = Vec::new();

    if let Some(bind) = ws_bind {
        let listener = TcpListener::bind(&bind).await?;
        tracing::info!(bind = %bind, "gateway relay ready (ws)");
        tasks.push(spawn_listener(listener, None, ctx.clone()));
    }

    if let Some(bind) = wss_bind {
        match tls.as_ref() {
            Some(tls_cfg) => {
                let acceptor = load_tls_acceptor(&tls_cfg.cert_path, &tls_cfg.key_path)?;
                let listener = TcpListener::bind(&bind).await?;
                tracing::info!(bind = %bind, "gateway relay ready (wss)");
                tasks.push(spawn_listener(listener, Some(acceptor), ctx.clone()));
            }
            None => tracing::warn!(bind = %bind, "wss bind requested but tls config missing"),
        }
    }

    Ok(tasks)
}

pub(crate) fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let out = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| anyhow!("invalid certificate file {}", path.display()))?;
    if out.is_empty() {
        return Err(anyhow!("no certificates in {}", path.display()));
    }
    Ok(out)
}

pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut keys: Vec<PrivateKeyDer<'static>> = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| anyhow!("invalid tls key"))?
        .into_iter()
        .map(PrivateKeyDer::from)
        .collect();

    if keys.is_empty() {
        let mut reader = BufReader::new(File::open(path)?);
        keys = rsa_private_keys(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| anyhow!("invalid tls key"))?
            .into_iter()
            .map(PrivateKeyDer::from)
            .collect();
    }

    keys.into_iter().next().ok_or_else(|| anyhow!("no tls key found"))
}

fn load_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let certs = load_certs(Path::new(cert_path))?;
    let key = load_private_key(Path::new(key_path))?;
    let cfg = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("tls config error: {}", e))?;
    Ok(TlsAcceptor::from(Arc::new(cfg)))
}

/// Accept loop for one bound socket; TLS is terminated first when an
/// acceptor is supplied.
pub fn spawn_listener(listener: TcpListener, acceptor: Option<TlsAcceptor>, ctx: SessionContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(error = %err, "relay accept failed");
                    continue;
                }
            };
            let ctx = ctx.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => handle_client(tls_stream, addr, ctx).await,
                        Err(err) => {
                            tracing::warn!(client = %addr, error = %err, "tls accept failed");
                            return;
                        }
                    },
                    None => handle_client(stream, addr, ctx).await,
                };
                if let Err(err) = result {
                    tracing::warn!(client = %addr, error = %err, "relay client error");
                }
            });
        }
    })
}

fn not_found() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("expected /relay/<relayKey>".to_string()));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

async fn handle_client<S>(stream: S, addr: SocketAddr, ctx: SessionContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut target = None;
    let ws = accept_hdr_async(stream, |req: &Request, resp: Response| match parse_target(req.uri()) {
        Some(t) => {
            target = Some(t);
            Ok(resp)
        }
        None => Err(not_found()),
    })
    .await?;
    let Some(target) = target else {
        return Ok(());
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    let client_pubkey = match target.token.as_deref() {
        None => None,
        Some(token) => match ctx.tokens.verify_token(token, &target.relay_key) {
            Ok(payload) => payload.pubkey,
            Err(err) => {
                tracing::warn!(client = %addr, relay = %target.relay_key, error = %err, "relay token rejected");
                let _ = ws_tx.send(Message::Text(frame_notice(&format!("auth-required: {err}")))).await;
                let _ = ws_tx.close().await;
                return Ok(());
            }
        },
    };

    let peers = ctx
        .store
        .get_relay(&target.relay_key)
        .map(|r| r.peers)
        .unwrap_or_default();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let session = Session::new(target.relay_key.clone(), peers, client_pubkey, out_tx);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    tracing::info!(client = %addr, relay = %session.relay_key, session = session.id, "relay client connected");

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(txt)) => match ctx.controller.handle_message(&session, &txt).await {
                Ok(true) => {}
                Ok(false) => tracing::debug!(client = %addr, "frame not handled"),
                Err(err) => {
                    tracing::warn!(client = %addr, error = %err, "frame handling failed");
                    session.send(frame_notice("error: internal"));
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(client = %addr, error = %err, "relay client ws error");
                break;
            }
        }
    }

    ctx.controller.close_session(&session).await;
    drop(session);
    writer.abort();
    tracing::info!(client = %addr, "relay client disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{parse_target, Target};
    use tokio_tungstenite::tungstenite::http::Uri;

    fn target(uri: &str) -> Option<Target> {
        parse_target(&uri.parse::<Uri>().expect("uri"))
    }

    #[test]
    fn relay_path_and_token_are_extracted() {
        assert_eq!(
            target("/relay/abc?token=x.y&other=1"),
            Some(Target {
                relay_key: "abc".to_string(),
                token: Some("x.y".to_string()),
            })
        );
        assert_eq!(target("/relay/abc/").map(|t| t.token), Some(None));
        assert_eq!(target("/relay/abc?token=").and_then(|t| t.token), None);
    }

    #[test]
    fn other_paths_are_refused() {
        assert!(target("/").is_none());
        assert!(target("/relay/").is_none());
        assert!(target("/relay/a/b").is_none());
        assert!(target("/gateway/register").is_none());
    }
}
