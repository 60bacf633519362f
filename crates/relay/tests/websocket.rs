mod common;

use std::time::Duration;

use docsync_common::ChannelMessage;
use docsync_relay::access::{AccessPolicy, ProjectRole};
use docsync_relay::engine;
use docsync_relay::ws::{self, USER_HEADER};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use common::{edit, eventually, fast_tuning, memory_services, sync_state, update_message};

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: std::net::SocketAddr,
    project: Uuid,
    access: AccessPolicy,
    store: std::sync::Arc<docsync_relay::store::MemoryStore>,
}

async fn start_server() -> Server {
    let project = Uuid::new_v4();
    let access = AccessPolicy::memory();
    let (services, store) = memory_services(fast_tuning(), access.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have an address");
    tokio::spawn(async move {
        axum::serve(listener, ws::router(services))
            .await
            .expect("relay websocket server should run for integration test");
    });

    Server { addr, project, access, store }
}

async fn connect(server: &Server, path: &str, user: Uuid) -> ClientSocket {
    let url = format!("ws://{}/projects/{}/documents/{path}", server.addr, server.project);
    let mut request = url.into_client_request().expect("request should build");
    request
        .headers_mut()
        .insert(USER_HEADER, HeaderValue::from_str(&user.to_string()).expect("valid header"));
    let (socket, _) = connect_async(request).await.expect("client should connect");
    socket
}

async fn ws_send(socket: &mut ClientSocket, message: &ChannelMessage) {
    let encoded = serde_json::to_string(message).expect("message should encode");
    socket.send(WsFrame::Text(encoded.into())).await.expect("frame should send");
}

async fn ws_recv(socket: &mut ClientSocket) -> ChannelMessage {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed unexpectedly")
            .expect("frame should be readable");
        if let WsFrame::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("frame should be a channel message");
        }
    }
}

async fn member(server: &Server, role: ProjectRole) -> Uuid {
    let user = Uuid::new_v4();
    server.access.grant(server.project, user, role).await;
    user
}

#[tokio::test]
async fn editors_share_updates_and_save_over_websockets() {
    let server = start_server().await;
    let alice = member(&server, ProjectRole::Owner).await;
    let bob = member(&server, ProjectRole::Editor).await;

    let mut a = connect(&server, "notes/plan.md", alice).await;
    let a_state = sync_state(&ws_recv(&mut a).await);
    let mut b = connect(&server, "notes/plan.md", bob).await;
    let _ = sync_state(&ws_recv(&mut b).await);

    let update = update_message(&edit(&a_state, 1, 0, "shared"), "alice-tab");
    ws_send(&mut a, &update).await;
    assert_eq!(ws_recv(&mut b).await, update);
    assert_eq!(ws_recv(&mut a).await, update, "editors see their own echo");

    ws_send(&mut b, &ChannelMessage::Save { base_revision: None }).await;
    let ChannelMessage::Saved { revision: Some(revision) } = ws_recv(&mut b).await else {
        panic!("expected a saved acknowledgement with a revision");
    };

    let key = docsync_common::DocumentKey::new(server.project, "notes/plan.md").unwrap();
    let commits = server.store.commits(&key);
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].revision, revision);
    assert_eq!(commits[0].content, "shared");
    assert_eq!(commits[0].message, "Save notes/plan.md");
}

#[tokio::test]
async fn external_change_reaches_connected_editors() {
    let server = start_server().await;
    let alice = member(&server, ProjectRole::Editor).await;
    let key = docsync_common::DocumentKey::new(server.project, "a.md").unwrap();
    server.store.external_commit(&key, "before");

    let mut a = connect(&server, "a.md", alice).await;
    assert_eq!(engine::materialize(&sync_state(&ws_recv(&mut a).await)).unwrap(), "before");

    server.store.external_commit(&key, "after");
    assert_eq!(ws_recv(&mut a).await, ChannelMessage::FileChanged);
}

#[tokio::test]
async fn malformed_frames_are_answered_without_closing() {
    let server = start_server().await;
    let alice = member(&server, ProjectRole::Editor).await;
    let mut a = connect(&server, "a.md", alice).await;
    let state = sync_state(&ws_recv(&mut a).await);

    a.send(WsFrame::Text(r#"{"type":"subscribe"}"#.to_string().into())).await.unwrap();
    let ChannelMessage::Error { code, retryable, .. } = ws_recv(&mut a).await else {
        panic!("expected an error envelope");
    };
    assert_eq!(code, "INVALID_MESSAGE");
    assert!(!retryable);

    let update = update_message(&edit(&state, 3, 0, "still here"), "tab");
    ws_send(&mut a, &update).await;
    assert_eq!(ws_recv(&mut a).await, update);
}

#[tokio::test]
async fn viewers_are_refused_edits() {
    let server = start_server().await;
    let viewer = member(&server, ProjectRole::Viewer).await;
    let mut v = connect(&server, "a.md", viewer).await;
    let state = sync_state(&ws_recv(&mut v).await);

    ws_send(&mut v, &update_message(&edit(&state, 5, 0, "nope"), "v")).await;
    let ChannelMessage::Error { code, .. } = ws_recv(&mut v).await else {
        panic!("expected an error envelope");
    };
    assert_eq!(code, "ACCESS_DENIED");
}

#[tokio::test]
async fn strangers_receive_access_denied_and_are_disconnected() {
    let server = start_server().await;
    let mut socket = connect(&server, "a.md", Uuid::new_v4()).await;

    let ChannelMessage::Error { code, .. } = ws_recv(&mut socket).await else {
        panic!("expected an error envelope");
    };
    assert_eq!(code, "ACCESS_DENIED");

    let closed = timeout(Duration::from_secs(5), async {
        while let Some(frame) = socket.next().await {
            if matches!(frame, Ok(WsFrame::Close(_)) | Err(_)) {
                return true;
            }
        }
        true
    })
    .await
    .unwrap_or(false);
    assert!(closed);
}

#[tokio::test]
async fn handshake_without_identity_is_rejected() {
    let server = start_server().await;
    let url = format!("ws://{}/projects/{}/documents/a.md", server.addr, server.project);
    assert!(connect_async(url).await.is_err());
}

#[tokio::test]
async fn disconnect_flushes_the_document() {
    let server = start_server().await;
    let alice = member(&server, ProjectRole::Editor).await;
    let mut a = connect(&server, "bye.md", alice).await;
    let state = sync_state(&ws_recv(&mut a).await);

    let update = update_message(&edit(&state, 8, 0, "goodbye"), "tab");
    ws_send(&mut a, &update).await;
    assert_eq!(ws_recv(&mut a).await, update);
    a.close(None).await.unwrap();

    let key = docsync_common::DocumentKey::new(server.project, "bye.md").unwrap();
    assert!(eventually(|| server.store.commit_count(&key) == 1).await);
    assert_eq!(server.store.commits(&key)[0].message, "Auto-save bye.md");
}
