//! End-to-end tests: real router, real sockets, in-memory database.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;
use uuid::Uuid;

use parley_api::auth::TokenKeys;
use parley_api::{AppStateInner, build_router};
use parley_db::Database;
use parley_gateway::{ConnectionSettings, Gateway, Hub};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    app: Router,
    keys: TokenKeys,
    db: Arc<Database>,
    gateway: Gateway,
}

impl TestServer {
    fn token(&self, user_id: Uuid) -> String {
        self.keys.issue(user_id, chrono::Duration::hours(1)).unwrap()
    }

    async fn connect(&self, user_id: Uuid, partner_id: Uuid, purpose: &str) -> Client {
        let url = format!("ws://{}/ws?purpose={}&partner_id={}", self.addr, purpose, partner_id);
        let mut request = url.into_client_request().unwrap();
        request.headers_mut().insert(
            header::AUTHORIZATION,
            format!("Bearer {}", self.token(user_id)).parse().unwrap(),
        );
        let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        ws
    }

    async fn wait_for_connections(&self, expected: usize) {
        for _ in 0..200 {
            if self.gateway.hub.stats().await.connections == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} live connections", expected);
    }

    async fn request(&self, method: &str, uri: &str, user_id: Option<Uuid>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user_id) = user_id {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", self.token(user_id)));
        }
        let response = self
            .app
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }
}

async fn start_test_server() -> TestServer {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let (hub, _task) = Hub::spawn(64);
    let gateway = Gateway::new(hub, db.clone(), ConnectionSettings::default());
    let keys = TokenKeys::new("integration-test-secret");

    let app = build_router(AppStateInner::new(gateway.clone(), keys.clone()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let serve_app = app.clone();
    tokio::spawn(async move {
        axum::serve(listener, serve_app).await.unwrap();
    });

    TestServer {
        addr,
        app,
        keys,
        db,
        gateway,
    }
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(ws: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_general_support_conversation_end_to_end() {
    let server = start_test_server().await;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

    let mut ws1 = server.connect(u1, u2, "general_support").await;
    let mut ws2 = server.connect(u2, u1, "general_support").await;
    server.wait_for_connections(2).await;

    ws1.send(Message::Text(r#"{"type":"text","content":"Assalamu alaikum"}"#.into()))
        .await
        .unwrap();

    let at_sender = next_json(&mut ws1).await;
    let at_partner = next_json(&mut ws2).await;
    assert_eq!(at_sender, at_partner);
    assert_eq!(at_sender["content"], "Assalamu alaikum");
    assert_eq!(at_sender["type"], "text");
    assert_eq!(at_sender["sender_id"], u1.to_string());
    assert_eq!(at_sender["media_url"], Value::Null);
    assert_eq!(at_sender["metadata"], Value::Null);
    assert_eq!(at_sender["reply_to_message_id"], Value::Null);
    assert!(at_sender["created_at"].as_str().unwrap().ends_with('Z'));

    let first_id = at_sender["id"].as_str().unwrap().to_string();
    let conversation_id = at_sender["conversation_id"].as_str().unwrap().to_string();

    let reply = json!({
        "content": "Wa alaikum assalam",
        "metadata": {"client": "test"},
        "reply_to_message_id": first_id,
    });
    ws2.send(Message::Text(reply.to_string().into())).await.unwrap();

    let at_partner = next_json(&mut ws2).await;
    let at_sender = next_json(&mut ws1).await;
    assert_eq!(at_sender, at_partner);
    assert_eq!(at_sender["sender_id"], u2.to_string());
    assert_eq!(at_sender["conversation_id"], conversation_id.as_str());
    assert_eq!(at_sender["reply_to_message_id"], first_id.as_str());
    assert_eq!(at_sender["metadata"]["client"], "test");

    // History, oldest first
    let uri = format!("/conversations/{}/messages", conversation_id);
    let (status, body) = server.request("GET", &uri, Some(u1)).await;
    assert_eq!(status, StatusCode::OK);
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["id"], first_id.as_str());
    assert_eq!(messages[1]["content"], "Wa alaikum assalam");

    let (status, _) = server
        .request("GET", &format!("{}?limit=1&offset=1", uri), Some(u2))
        .await;
    assert_eq!(status, StatusCode::OK);

    ws1.close(None).await.unwrap();
    ws2.close(None).await.unwrap();
    server.wait_for_connections(0).await;
}

#[tokio::test]
async fn test_reconnect_returns_same_conversation() {
    let server = start_test_server().await;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

    let mut ws = server.connect(u1, u2, "nikkah_service").await;
    server.wait_for_connections(1).await;
    ws.send(Message::Text(r#"{"content":"first"}"#.into())).await.unwrap();
    let first = next_json(&mut ws).await;
    ws.close(None).await.unwrap();
    server.wait_for_connections(0).await;

    let mut ws = server.connect(u2, u1, "nikkah_service").await;
    server.wait_for_connections(1).await;
    ws.send(Message::Text(r#"{"content":"second"}"#.into())).await.unwrap();
    let second = next_json(&mut ws).await;
    assert_eq!(first["conversation_id"], second["conversation_id"]);

    // A different purpose is a different conversation
    let mut other = server.connect(u1, u2, "admin_support").await;
    server.wait_for_connections(2).await;
    other.send(Message::Text(r#"{"content":"third"}"#.into())).await.unwrap();
    let third = next_json(&mut other).await;
    assert_ne!(first["conversation_id"], third["conversation_id"]);
}

#[tokio::test]
async fn test_bad_frame_gets_error_and_socket_stays_open() {
    let server = start_test_server().await;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

    let mut ws = server.connect(u1, u2, "revert_service").await;
    server.wait_for_connections(1).await;

    ws.send(Message::Text(r#"{"content": 42}"#.into())).await.unwrap();
    let error = next_json(&mut ws).await;
    assert!(
        error["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid message format")
    );

    ws.send(Message::Text(r#"{"content":"ok","reply_to_message_id":null}"#.into()))
        .await
        .unwrap();
    let message = next_json(&mut ws).await;
    assert_eq!(message["content"], "ok");
}

#[tokio::test]
async fn test_admission_rejections() {
    let server = start_test_server().await;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

    // No credential: refused before any upgrade
    let url = format!("ws://{}/ws?purpose=general_support&partner_id={}", server.addr, u2);
    match tokio_tungstenite::connect_async(url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        other => panic!("expected HTTP rejection, got {:?}", other.map(|_| ())),
    }

    let garbage = server
        .request("GET", &format!("/ws?purpose=general_support&partner_id={}", u2), None)
        .await;
    assert_eq!(garbage.0, StatusCode::UNAUTHORIZED);

    let cases = [
        format!("/ws?purpose=coffee&partner_id={}", u2),
        format!("/ws?partner_id={}", u2),
        "/ws?purpose=general_support".to_string(),
        "/ws?purpose=general_support&partner_id=not-a-uuid".to_string(),
        format!("/ws?purpose=general_support&partner_id={}", u1),
    ];
    for uri in cases {
        let (status, body) = server.request("GET", &uri, Some(u1)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert!(body["error"].is_string(), "{}", uri);
    }
}

#[tokio::test]
async fn test_unreadable_query_checked_after_credential() {
    let server = start_test_server().await;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
    let uri = format!("/ws?purpose=general_support&purpose=admin_support&partner_id={}", u2);

    let (status, _) = server.request("GET", &uri, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = server.request("GET", &uri, Some(u1)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_admission_refused_during_shutdown() {
    let server = start_test_server().await;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

    assert!(server.gateway.shutdown(Duration::from_millis(100)).await);

    let uri = format!("/ws?purpose=general_support&partner_id={}", u2);
    let (status, body) = server.request("GET", &uri, Some(u1)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "Server is shutting down");

    let conversations: i64 = server
        .db
        .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?))
        .unwrap();
    assert_eq!(conversations, 0);
}

#[tokio::test]
async fn test_rest_routes() {
    let server = start_test_server().await;
    let (u1, u2, stranger) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    let (status, body) = server.request("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);

    let conversation = server
        .db
        .create_conversation_with_participants(u1, u2, parley_types::models::ConversationPurpose::AdminSupport)
        .unwrap();

    let mut ws = server.connect(u1, u2, "admin_support").await;
    server.wait_for_connections(1).await;
    ws.send(Message::Text(r#"{"content":"read me"}"#.into())).await.unwrap();
    let message = next_json(&mut ws).await;
    assert_eq!(message["conversation_id"], conversation.id.to_string());
    let message_id = message["id"].as_str().unwrap().to_string();

    let uri = format!("/conversations/{}/messages", conversation.id);
    assert_eq!(server.request("GET", &uri, None).await.0, StatusCode::UNAUTHORIZED);
    assert_eq!(server.request("GET", &uri, Some(stranger)).await.0, StatusCode::FORBIDDEN);

    let read_uri = format!("/messages/{}/read", message_id);
    let (status, receipt) = server.request("POST", &read_uri, Some(u2)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["reader_id"], u2.to_string());
    assert_eq!(receipt["message_id"], message_id.as_str());

    let (status, _) = server.request("POST", &read_uri, Some(u2)).await;
    assert_eq!(status, StatusCode::OK);
    let receipts: i64 = server
        .db
        .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM message_reads", [], |row| row.get(0))?))
        .unwrap();
    assert_eq!(receipts, 1);

    assert_eq!(server.request("POST", &read_uri, Some(stranger)).await.0, StatusCode::FORBIDDEN);

    let unknown = format!("/messages/{}/read", Uuid::new_v4());
    assert_eq!(server.request("POST", &unknown, Some(u1)).await.0, StatusCode::NOT_FOUND);

    let (_, body) = server.request("GET", "/health", None).await;
    assert_eq!(body["connections"], 1);
    assert_eq!(body["conversations"], 1);
}
