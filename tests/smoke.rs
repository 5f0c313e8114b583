use futures_util::{SinkExt, StreamExt};
use relay_gateway::config::Config;
use relay_gateway::gateway::{GatewayService, RegisterRequest};
use relay_gateway::keystore::GatewaySecrets;
use relay_gateway::nostr::{self, AdminKeyPair};
use relay_gateway::server;
use relay_gateway::token::IssueRequest;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use zeroize::Zeroizing;

type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_gateway(dir: &tempfile::TempDir, dispatcher: bool) -> (Arc<GatewayService>, String) {
    let mut config = Config::default();
    config.data_dir = dir.path().display().to_string();
    config.dispatcher.enabled = dispatcher;
    let secrets = GatewaySecrets {
        admin: AdminKeyPair::generate(),
        token_secret: Zeroizing::new(vec![3u8; 32]),
    };
    let gateway = GatewayService::build(config, &secrets).await.expect("gateway");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    server::spawn_listener(listener, None, gateway.session_context());
    (gateway, format!("ws://{}", addr))
}

fn signed_event(content: &str) -> nostr::NostrEvent {
    let (pk, sk) = nostr::generate_keypair();
    let unsigned = nostr::build_unsigned_event(&pk, 1, vec![], content.to_string(), relay_gateway::util::now_unix_seconds());
    nostr::sign_event(&unsigned, &sk).expect("sign")
}

async fn next_frame(ws: &mut Client) -> Option<Value> {
    let deadline = tokio::time::sleep(Duration::from_secs(3));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return None,
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(txt))) => return serde_json::from_str(&txt).ok(),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => {}
            }
        }
    }
}

#[tokio::test]
async fn event_is_acknowledged_and_stored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (gateway, base) = start_gateway(&dir, false).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{base}/relay/relay-1"))
        .await
        .expect("connect");

    let ev = signed_event("hello gateway");
    ws.send(Message::Text(json!(["EVENT", ev]).to_string())).await.expect("send");
    let ok = next_frame(&mut ws).await.expect("ok frame");
    assert_eq!(ok, json!(["OK", ev.id, true, ""]));

    let stored = gateway.host().get_event(&ev.id).await.expect("stored event");
    assert_eq!(stored.content, "hello gateway");
    gateway.shutdown();
}

#[tokio::test]
async fn token_gates_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (gateway, base) = start_gateway(&dir, false).await;
    let issued = gateway
        .tokens()
        .issue_token(
            "relay-1",
            IssueRequest {
                scope: "read".to_string(),
                pubkey: Some("client-pk".to_string()),
                ..IssueRequest::default()
            },
        )
        .expect("issue");

    let (mut good, _) = tokio_tungstenite::connect_async(format!("{base}/relay/relay-1?token={}", issued.token))
        .await
        .expect("connect with token");
    let ev = signed_event("with token");
    good.send(Message::Text(json!(["EVENT", ev]).to_string())).await.expect("send");
    assert_eq!(next_frame(&mut good).await.map(|f| f[2].clone()), Some(json!(true)));

    gateway.tokens().revoke_token("relay-1").expect("revoke");
    let (mut revoked, _) = tokio_tungstenite::connect_async(format!("{base}/relay/relay-1?token={}", issued.token))
        .await
        .expect("connect with revoked token");
    let notice = next_frame(&mut revoked).await.expect("notice");
    assert_eq!(notice[0], "NOTICE");
    assert!(notice[1].as_str().unwrap_or_default().starts_with("auth-required"));
    assert!(next_frame(&mut revoked).await.is_none());
}

#[tokio::test]
async fn unknown_paths_are_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_gateway, base) = start_gateway(&dir, false).await;
    assert!(tokio_tungstenite::connect_async(format!("{base}/nowhere")).await.is_err());
}

/// A one-connection upstream peer that answers every REQ with one event and
/// an EOSE.
async fn spawn_upstream_peer() -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    let (seen_tx, seen_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else { return };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else { return };
        while let Some(Ok(Message::Text(txt))) = ws.next().await {
            let _ = seen_tx.send(txt.clone());
            let frame: Value = serde_json::from_str(&txt).unwrap_or(Value::Null);
            if frame[0] == "REQ" {
                let sub = frame[1].clone();
                let ev = signed_event("from upstream");
                let _ = ws.send(Message::Text(json!(["EVENT", sub, ev]).to_string())).await;
                let _ = ws.send(Message::Text(json!(["EOSE", sub]).to_string())).await;
            }
        }
    });
    (format!("ws://{}", addr), seen_rx)
}

#[tokio::test]
async fn req_is_dispatched_to_registered_peer_and_acknowledged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (gateway, base) = start_gateway(&dir, true).await;
    let (endpoint, mut upstream_seen) = spawn_upstream_peer().await;
    let peer = "cd".repeat(32);
    gateway
        .register_peer(RegisterRequest {
            public_key: peer.clone(),
            relays: vec!["relay-1".to_string()],
            endpoint: Some(endpoint),
        })
        .expect("register");

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{base}/relay/relay-1"))
        .await
        .expect("connect");
    let req = json!(["REQ", "sub1", {"kinds": [1]}]).to_string();
    ws.send(Message::Text(req.clone())).await.expect("send req");

    let forwarded = tokio::time::timeout(Duration::from_secs(3), upstream_seen.recv())
        .await
        .expect("upstream saw frame")
        .expect("frame");
    assert_eq!(forwarded, req);

    let event = next_frame(&mut ws).await.expect("event frame");
    assert_eq!(event[0], "EVENT");
    assert_eq!(event[1], "sub1");
    let eose = next_frame(&mut ws).await.expect("eose frame");
    assert_eq!(eose, json!(["EOSE", "sub1"]));

    let assignment = gateway
        .dispatcher()
        .assignments_snapshot()
        .into_iter()
        .find(|a| a.job_id == "sub1")
        .expect("assignment");
    assert_eq!(assignment.peer_id, peer);
    assert_eq!(assignment.status, relay_gateway::job::AssignmentStatus::Completed);

    let mirrored = gateway.blind_peers().get_dispatcher_assignments_snapshot();
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0].status, relay_gateway::job::AssignmentStatus::Completed);
}
