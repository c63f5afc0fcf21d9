//! End-to-end tests over a real server: handshake auth, joins, fan-out and provisioning.

use std::{net::SocketAddr, time::Duration};

use futures_util::{SinkExt, StreamExt};
use groupchat::{
    AppState,
    db::{Group, Role, Store, User},
    session::SessionCodec,
};
use serde_json::{Value, json};
use sqlx::Connection;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    db_url: String,
    store: Store,
    codec: SessionCodec,
    _dir: tempfile::TempDir,
}

impl TestServer {
    fn token(&self, user: &User) -> String {
        self.codec.issue(user).unwrap()
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn connect(&self, user: &User) -> Socket {
        self.connect_with_token(&self.token(user)).await
    }

    async fn connect_with_token(&self, token: &str) -> Socket {
        let url = format!("ws://{}/ws?token={}", self.addr, token);
        let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        socket
    }
}

async fn start_test_server(ttl: time::Duration) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let db_url = format!("sqlite://{}?mode=rwc", dir.path().join("chat.db").display());

    let store = Store::connect(&db_url, 4).await.unwrap();
    store.migrate().await.unwrap();
    let codec = SessionCodec::new(b"integration secret", ttl);

    let app = groupchat::app(AppState::new(store.clone(), codec.clone(), 64));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        db_url,
        store,
        codec,
        _dir: dir,
    }
}

/// The scenario's cast: an admin, a member and an outsider of group 7.
async fn seed(server: &TestServer) -> (User, User, User, Group) {
    let admin = server.store.ensure_admin("master@ed.com").await.unwrap();
    let u1 = server.store.create_user("u1@ed.com", Role::User).await.unwrap();
    let u2 = server.store.create_user("u2@ed.com", Role::User).await.unwrap();

    let mut group = server.store.create_group("g1").await.unwrap();
    while group.id < 7 {
        group = server.store.create_group(&format!("g{}", group.id + 1)).await.unwrap();
    }
    server.store.add_member(u1.id, group.id).await.unwrap();

    (admin, u1, u2, group)
}

async fn send(socket: &mut Socket, event: Value) {
    socket.send(Message::Text(event.to_string().into())).await.unwrap();
}

async fn next_frame(socket: &mut Socket) -> Message {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if !matches!(frame, Message::Ping(_) | Message::Pong(_)) {
            return frame;
        }
    }
}

async fn next_event(socket: &mut Socket) -> Value {
    match next_frame(socket).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

async fn assert_silent(socket: &mut Socket) {
    let frame = tokio::time::timeout(Duration::from_millis(300), socket.next()).await;
    assert!(frame.is_err(), "expected no frame, got {frame:?}");
}

#[tokio::test]
async fn member_chats_and_outsider_is_kept_out() {
    let server = start_test_server(groupchat::session::DEFAULT_TTL).await;
    let (_, u1, u2, group) = seed(&server).await;
    assert_eq!(group.id, 7);

    let mut s1 = server.connect(&u1).await;
    let mut s2 = server.connect(&u2).await;

    send(&mut s1, json!({"event": "join", "data": {"group_id": 7}})).await;
    assert_eq!(next_event(&mut s1).await, json!({"event": "joined", "data": {"group_id": 7}}));

    send(&mut s2, json!({"event": "join", "data": {"group_id": 7}})).await;
    assert_eq!(next_event(&mut s2).await, json!({"event": "error", "data": "not a member of this group"}));

    send(&mut s1, json!({"event": "message", "data": {"group_id": 7, "content": "hi"}})).await;
    let event = next_event(&mut s1).await;
    assert_eq!(event["event"], "message");
    assert_eq!(event["data"]["user"], json!({"id": u1.id, "email": "u1@ed.com"}));
    assert_eq!(event["data"]["content"], "hi");
    assert!(event["data"]["created_at"].is_string());

    assert_silent(&mut s2).await;
    assert_eq!(server.store.messages(7).await.unwrap().len(), 1);
}

#[tokio::test]
async fn expired_token_is_closed_before_any_event() {
    let server = start_test_server(time::Duration::ZERO).await;
    let (_, u1, _, _) = seed(&server).await;

    let mut socket = server.connect(&u1).await;
    assert_eq!(next_event(&mut socket).await, json!({"event": "error", "data": "unauthorized"}));
    match next_frame(&mut socket).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4001),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_token_is_refused() {
    let server = start_test_server(groupchat::session::DEFAULT_TTL).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();
    assert_eq!(next_event(&mut socket).await["data"], "unauthorized");
    match next_frame(&mut socket).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4002),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn rejected_submissions_leave_no_rows() {
    let server = start_test_server(groupchat::session::DEFAULT_TTL).await;
    let (_, u1, _, group) = seed(&server).await;
    let mut s1 = server.connect(&u1).await;

    send(&mut s1, json!({"event": "message", "data": {"group_id": group.id, "content": "early"}})).await;
    assert_eq!(next_event(&mut s1).await["data"], format!("not joined to group {}", group.id));

    send(&mut s1, json!({"event": "join", "data": {"group_id": group.id}})).await;
    assert_eq!(next_event(&mut s1).await["event"], "joined");

    send(&mut s1, json!({"event": "message", "data": {"group_id": group.id}})).await;
    assert_eq!(next_event(&mut s1).await["data"], "content or media_url is required");

    send(&mut s1, json!({"event": "shout", "data": {}})).await;
    assert_eq!(next_event(&mut s1).await["event"], "error");

    assert!(server.store.messages(group.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn admin_joins_any_group_and_sees_members_messages() {
    let server = start_test_server(groupchat::session::DEFAULT_TTL).await;
    let (admin, u1, _, group) = seed(&server).await;
    let mut sa = server.connect(&admin).await;
    let mut s1 = server.connect(&u1).await;

    for socket in [&mut sa, &mut s1] {
        send(socket, json!({"event": "join", "data": {"group_id": group.id}})).await;
        assert_eq!(next_event(socket).await["event"], "joined");
    }

    send(
        &mut s1,
        json!({"event": "message", "data": {
            "group_id": group.id,
            "media_url": "https://cdn.example/cat.png",
            "media_type": "image/png"
        }}),
    )
    .await;

    for socket in [&mut sa, &mut s1] {
        let event = next_event(socket).await;
        assert_eq!(event["data"]["media_url"], "https://cdn.example/cat.png");
        assert_eq!(event["data"]["content"], Value::Null);
    }
}

#[tokio::test]
async fn provisioning_requires_admin() {
    let server = start_test_server(groupchat::session::DEFAULT_TTL).await;
    let (admin, u1, u2, group) = seed(&server).await;
    let client = reqwest::Client::new();

    let refused = client
        .post(server.url("/api/admin/groups"))
        .bearer_auth(server.token(&u1))
        .json(&json!({"name": "sneaky"}))
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status(), reqwest::StatusCode::FORBIDDEN);

    let anonymous = client.get(server.url("/api/groups")).send().await.unwrap();
    assert_eq!(anonymous.status(), reqwest::StatusCode::UNAUTHORIZED);

    let created: Value = client
        .post(server.url("/api/admin/groups"))
        .bearer_auth(server.token(&admin))
        .json(&json!({"name": "sales"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sales = created["id"].as_i64().unwrap();

    let added = client
        .post(server.url(&format!("/api/admin/groups/{sales}/add")))
        .bearer_auth(server.token(&admin))
        .json(&json!({"user_id": u2.id}))
        .send()
        .await
        .unwrap();
    assert!(added.status().is_success());

    let groups: Vec<Value> = client
        .get(server.url("/api/groups"))
        .bearer_auth(server.token(&u2))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(groups, [json!({"id": sales, "name": "sales"})]);

    let duplicate = client
        .post(server.url("/api/admin/users"))
        .bearer_auth(server.token(&admin))
        .json(&json!({"email": "u1@ed.com"}))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), reqwest::StatusCode::BAD_REQUEST);

    assert!(server.store.is_member(u1.id, group.id).await.unwrap());
}

#[tokio::test]
async fn removing_a_member_revokes_their_subscription() {
    let server = start_test_server(groupchat::session::DEFAULT_TTL).await;
    let (admin, u1, _, group) = seed(&server).await;
    let mut sa = server.connect(&admin).await;
    let mut s1 = server.connect(&u1).await;

    for socket in [&mut sa, &mut s1] {
        send(socket, json!({"event": "join", "data": {"group_id": group.id}})).await;
        assert_eq!(next_event(socket).await["event"], "joined");
    }

    let removed = reqwest::Client::new()
        .delete(server.url(&format!("/api/admin/groups/{}/members/{}", group.id, u1.id)))
        .bearer_auth(server.token(&admin))
        .send()
        .await
        .unwrap();
    assert!(removed.status().is_success());
    assert_eq!(next_event(&mut s1).await, json!({"event": "left", "data": {"group_id": group.id}}));

    send(&mut sa, json!({"event": "message", "data": {"group_id": group.id, "content": "members only"}})).await;
    assert_eq!(next_event(&mut sa).await["data"]["content"], "members only");
    assert_silent(&mut s1).await;

    send(&mut s1, json!({"event": "join", "data": {"group_id": group.id}})).await;
    assert_eq!(next_event(&mut s1).await["data"], "not a member of this group");
}

#[tokio::test]
async fn admin_hands_out_first_tokens() {
    let server = start_test_server(groupchat::session::DEFAULT_TTL).await;
    let (admin, u1, _, group) = seed(&server).await;
    let client = reqwest::Client::new();

    let refused = client
        .post(server.url("/api/admin/tokens"))
        .bearer_auth(server.token(&u1))
        .json(&json!({"user_id": u1.id}))
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status(), reqwest::StatusCode::FORBIDDEN);

    let unknown = client
        .post(server.url("/api/admin/tokens"))
        .bearer_auth(server.token(&admin))
        .json(&json!({"user_id": 4040}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), reqwest::StatusCode::BAD_REQUEST);

    let issued: Value = client
        .post(server.url("/api/admin/tokens"))
        .bearer_auth(server.token(&admin))
        .json(&json!({"user_id": u1.id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(issued["user"], json!({"id": u1.id, "email": "u1@ed.com", "role": "user"}));

    let mut s1 = server.connect_with_token(issued["token"].as_str().unwrap()).await;
    send(&mut s1, json!({"event": "join", "data": {"group_id": group.id}})).await;
    assert_eq!(next_event(&mut s1).await, json!({"event": "joined", "data": {"group_id": group.id}}));
}

#[tokio::test]
async fn pings_are_answered_while_a_submission_waits_on_the_store() {
    let server = start_test_server(groupchat::session::DEFAULT_TTL).await;
    let (_, u1, _, group) = seed(&server).await;
    let mut s1 = server.connect(&u1).await;

    send(&mut s1, json!({"event": "join", "data": {"group_id": group.id}})).await;
    assert_eq!(next_event(&mut s1).await["event"], "joined");

    // holds the write lock so the insert waits on the busy timeout
    let mut writer = sqlx::SqliteConnection::connect(&server.db_url).await.unwrap();
    sqlx::query("BEGIN IMMEDIATE").execute(&mut writer).await.unwrap();

    send(&mut s1, json!({"event": "message", "data": {"group_id": group.id, "content": "slow"}})).await;
    s1.send(Message::Ping(vec![7].into())).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(1), s1.next())
        .await
        .expect("ping went unanswered while the store was busy")
        .unwrap()
        .unwrap();
    assert!(matches!(frame, Message::Pong(_)), "expected pong, got {frame:?}");

    sqlx::query("COMMIT").execute(&mut writer).await.unwrap();
    assert_eq!(next_event(&mut s1).await["data"]["content"], "slow");
    assert_eq!(server.store.messages(group.id).await.unwrap().len(), 1);
}
