// Integration smoke test for the router.
//
// Starts a router on localhost (port 0) and drives it with `NetClient`s
// over real TCP: handshake, join, broadcast, reply routing, mute, transfer
// relay, re-key, quit, tunnel pushes, and the frames that are answered without a session
// (redirect, not found, unknown session).
//
// Each client is an independent TCP connection with its own session; no
// state is shared between them except through the router.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use shade_protocol::{
    Chunk, ChunkIndex, CipherKind, ClientId, Delivery, GroupId, GroupRequest, HashKind,
    JoinRequest, KeyParams, MessageId, Reply, RequestFrame, RoomMode, SessionCipher, SessionId,
    Status, TransferId,
};
use shade_router::client::{ClientError, NetClient};
use shade_router::config::RoomConfig;
use shade_router::group::room_id;
use shade_router::{RouterConfig, RouterHandle, start_router};

const PASSWORD: &str = "smoke";

fn config() -> RouterConfig {
    RouterConfig {
        port: 0,
        password: PASSWORD.into(),
        motd: Some("welcome".into()),
        buffer_size: 4,
        threads: 2,
        rooms: vec![RoomConfig {
            name: "lobby".into(),
            color: Some(0x00ff00),
            enabled: true,
        }],
        verified: [("vera".to_string(), "v-key".to_string())].into(),
        ..RouterConfig::default()
    }
}

fn start(config: RouterConfig) -> (RouterHandle, SocketAddr) {
    let (handle, addr) = start_router(config).unwrap();
    // Give the listener thread a moment to start.
    thread::sleep(Duration::from_millis(50));
    (handle, addr)
}

fn join(client: &mut NetClient, name: &str, group: &str, password: Option<&str>) {
    client
        .join(JoinRequest {
            name: name.into(),
            group: GroupId::new(group),
            color: 0,
            share: true,
            password: password.map(str::to_string),
        })
        .unwrap();
}

fn chat(id: &str, text: &str) -> GroupRequest {
    GroupRequest {
        id: MessageId::new(id),
        data: text.as_bytes().to_vec(),
        ..GroupRequest::default()
    }
}

/// Group deliveries in `deliveries`, as (message id, origin, data).
fn group_messages(deliveries: &[Delivery]) -> Vec<(MessageId, ClientId, Vec<u8>)> {
    deliveries
        .iter()
        .filter_map(|d| match d {
            Delivery::Group {
                id, origin, data, ..
            } => Some((id.clone(), origin.clone(), data.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn chat_lifecycle() {
    let (handle, addr) = start(config());

    // 1. Handshake with two different cipher suites.
    let mut alice = NetClient::connect(addr, PASSWORD).unwrap();
    let mut bob = NetClient::connect_with(
        addr,
        PASSWORD,
        KeyParams {
            cipher: CipherKind::Aes128Gcm,
            key_size: 128,
            hash: HashKind::Sha512,
            iterations: 3,
            salt: b"bob-salt".to_vec(),
        },
    )
    .unwrap();
    assert_ne!(alice.session_id(), bob.session_id());
    assert_eq!(handle.router().session_count(), 2);

    // 2. Join a named group. Bob's arrival is announced to Alice.
    let reply = alice
        .join(JoinRequest {
            name: "alice".into(),
            group: GroupId::new("team"),
            color: 1,
            share: true,
            password: None,
        })
        .unwrap();
    assert_eq!(reply.client, *alice.client_id());
    assert_eq!(reply.motd.as_deref(), Some("welcome"));
    assert!(reply.rooms.is_empty());
    join(&mut bob, "bob", "team", None);

    let joined = alice.poll().unwrap();
    assert!(
        matches!(joined.as_slice(), [Delivery::Joined(info)] if info.name == "bob"),
        "expected join notice, got {joined:?}"
    );

    // 3. Broadcast reaches the other member with Alice as origin.
    alice.send_group(chat("m1", "hello")).unwrap();
    let received = group_messages(&bob.poll().unwrap());
    assert_eq!(
        received,
        vec![(MessageId::new("m1"), alice.client_id().clone(), b"hello".to_vec())]
    );

    // A retry with the same message id is not delivered twice.
    alice.send_group(chat("m1", "hello")).unwrap();
    assert!(group_messages(&bob.poll().unwrap()).is_empty());

    // 4. Reply routing goes back to the requester only.
    bob.send_reply(MessageId::new("m1"), b"hi back".to_vec())
        .unwrap();
    let replies = alice.poll().unwrap();
    assert_eq!(
        replies,
        vec![Delivery::Reply {
            id: MessageId::new("m1"),
            origin: bob.client_id().clone(),
            data: b"hi back".to_vec(),
        }]
    );

    // 5. Mute: Bob stops hearing from Alice.
    bob.mute(alice.client_id().clone(), true).unwrap();
    alice.send_group(chat("m2", "anyone?")).unwrap();
    assert!(group_messages(&bob.poll().unwrap()).is_empty());
    bob.mute(alice.client_id().clone(), false).unwrap();
    alice.send_group(chat("m3", "again")).unwrap();
    assert_eq!(group_messages(&bob.poll().unwrap()).len(), 1);

    // 6. Re-key: new session id, same client id, old id is dead.
    let old_session = bob.session_id().clone();
    let bob_client = bob.client_id().clone();
    bob.rekey(KeyParams::default()).unwrap();
    assert_ne!(*bob.session_id(), old_session);
    assert_eq!(*bob.client_id(), bob_client);
    assert!(bob.ping(false).unwrap().is_empty());
    assert!(handle.router().session(&old_session).is_none());

    // 7. Quit tears the session down and leaves the group.
    alice.quit().unwrap();
    assert_eq!(handle.router().session_count(), 1);
    let (members, _) = bob.room(RoomMode::List).unwrap();
    assert_eq!(members.len(), 1);

    handle.stop();
}

#[test]
fn public_group_rooms_and_spam_gate() {
    let (handle, addr) = start(config());

    let mut anon = NetClient::connect(addr, PASSWORD).unwrap();
    let mut vera = NetClient::connect(addr, PASSWORD).unwrap();
    let mut lurker = NetClient::connect(addr, PASSWORD).unwrap();
    join(&mut lurker, "lurker", "", None);
    join(&mut anon, "anon", "", None);
    let reply = vera
        .join(JoinRequest {
            name: "vera".into(),
            group: GroupId::default(),
            color: 2,
            share: false,
            password: Some("v-key".into()),
        })
        .unwrap();
    assert_eq!(reply.rooms.len(), 1);
    assert_eq!(reply.rooms[0].id, room_id("lobby"));
    assert!(reply.clients.iter().any(|c| c.name == "vera" && c.verified));
    lurker.poll().unwrap();

    // Unverified broadcast in the public group goes nowhere.
    anon.send_group(chat("spam", "buy now")).unwrap();
    assert!(group_messages(&lurker.poll().unwrap()).is_empty());

    // A verified member's broadcast goes through.
    vera.send_group(chat("v1", "hello all")).unwrap();
    assert_eq!(group_messages(&lurker.poll().unwrap()).len(), 1);

    // Addressed messages pass the gate for anyone.
    anon.send_group(GroupRequest {
        clients: vec![lurker.client_id().clone()],
        ..chat("pm", "psst")
    })
    .unwrap();
    assert_eq!(group_messages(&lurker.poll().unwrap()).len(), 1);

    // Room membership.
    let lobby = room_id("lobby");
    let (members, _) = lurker.room(RoomMode::Join(lobby.clone())).unwrap();
    assert_eq!(members.len(), 1);
    let (_, rooms) = anon.room(RoomMode::List).unwrap();
    assert_eq!(rooms[0].size, 1);
    let (members, _) = lurker.room(RoomMode::Quit(lobby)).unwrap();
    assert!(members.is_empty());

    // Entropy and router listing.
    assert_eq!(anon.entropy(32).unwrap().len(), 32);
    let routers = anon.ping(true).unwrap();
    assert_eq!(routers.len(), 1);
    assert_eq!(routers[0].port, addr.port());

    handle.stop();
}

#[test]
fn transfer_relay() {
    let (handle, addr) = start(config());
    let mut producer = NetClient::connect(addr, PASSWORD).unwrap();
    let mut consumer = NetClient::connect(addr, PASSWORD).unwrap();
    let id = TransferId::new("file-1");
    let needed = [ChunkIndex(0), ChunkIndex(1), ChunkIndex(2)];

    // Consumer declares what it needs; nothing is buffered yet.
    let reply = consumer.download(id.clone(), needed).unwrap();
    assert_eq!(
        reply,
        Reply::Download {
            id: id.clone(),
            chunks: vec![]
        }
    );

    // Producer answers whatever the router asks for until all is sent.
    let mut sent = Vec::new();
    let mut next = match producer.upload(id.clone(), None).unwrap() {
        Reply::Upload { next, .. } => next,
        other => panic!("expected upload reply, got {other:?}"),
    };
    while let Some(index) = next {
        sent.push(index);
        let chunk = Chunk {
            index,
            data: vec![index.0 as u8; 8],
        };
        next = match producer.upload(id.clone(), Some(chunk)).unwrap() {
            Reply::Upload { next, .. } => next,
            other => panic!("expected upload reply, got {other:?}"),
        };
    }
    sent.sort();
    assert_eq!(sent, needed.to_vec());

    // The consumer collects all three chunks in one batch.
    let Reply::Download { chunks, .. } = consumer.download(id.clone(), needed).unwrap() else {
        panic!("expected download reply");
    };
    let indices: Vec<_> = chunks.iter().map(|c| c.index).collect();
    assert_eq!(indices, needed.to_vec());
    assert_eq!(chunks[2].data, vec![2u8; 8]);

    // Cancelling stops both sides.
    assert_eq!(
        consumer.cancel_download(id.clone()).unwrap(),
        Reply::Stopped { id: id.clone() }
    );
    assert_eq!(
        producer.upload(id.clone(), None).unwrap(),
        Reply::Stopped { id }
    );

    handle.stop();
}

#[test]
fn frames_without_a_usable_session() {
    let redirecting = RouterConfig {
        redirect: Some("https://router.example/".into()),
        ..config()
    };
    let (handle, addr) = start(redirecting);
    let mut client = NetClient::connect(addr, PASSWORD).unwrap();

    // Empty body: redirect.
    let reply = client
        .send_raw(&RequestFrame {
            session: Some(client.session_id().clone()),
            body: Vec::new(),
        })
        .unwrap();
    assert_eq!(reply.status, Status::Redirect);
    assert_eq!(reply.location.as_deref(), Some("https://router.example/"));

    // Unknown session on a fresh connection.
    let mut other = NetClient::connect(addr, PASSWORD).unwrap();
    let body = SessionCipher::from_password(PASSWORD)
        .encrypt(b"[]")
        .unwrap();
    let reply = other
        .send_raw(&RequestFrame {
            session: Some(SessionId::new("ghost")),
            body,
        })
        .unwrap();
    assert_eq!(reply.status, Status::Unauthorized);

    handle.stop();

    // Without a redirect, an empty body is not found.
    let (handle, addr) = start(config());
    let mut client = NetClient::connect(addr, PASSWORD).unwrap();
    let reply = client
        .send_raw(&RequestFrame {
            session: None,
            body: Vec::new(),
        })
        .unwrap();
    assert_eq!(reply.status, Status::NotFound);
    handle.stop();
}

#[test]
fn wrong_password_is_refused() {
    let (handle, addr) = start(config());
    match NetClient::connect(addr, "not-the-password") {
        Err(ClientError::Status { status, .. }) => assert_eq!(status, Status::Unauthorized),
        Err(other) => panic!("expected unauthorized, got {other}"),
        Ok(_) => panic!("handshake should fail"),
    }
    assert_eq!(handle.router().session_count(), 0);
    handle.stop();
}

#[test]
fn bad_request_keeps_the_connection() {
    let (handle, addr) = start(config());
    let mut client = NetClient::connect(addr, PASSWORD).unwrap();
    join(&mut client, "a", "team", None);

    let spoofed = GroupRequest {
        origin: Some(ClientId::new("someone-else")),
        ..chat("x", "spoof")
    };
    match client.send_group(spoofed) {
        Err(ClientError::Status { status, .. }) => assert_eq!(status, Status::BadRequest),
        other => panic!("expected bad request, got {other:?}"),
    }
    // Same connection, same session, still usable.
    assert!(client.ping(false).is_ok());
    handle.stop();
}

#[test]
fn idle_sessions_are_swept() {
    let mut config = config();
    config.timeouts.session = 200;
    config.timeouts.monitor = 50;
    let (handle, addr) = start(config);
    let _client = NetClient::connect(addr, PASSWORD).unwrap();
    assert_eq!(handle.router().session_count(), 1);

    thread::sleep(Duration::from_millis(600));
    assert_eq!(handle.router().session_count(), 0);
    handle.stop();
}

#[test]
fn tunnel_pushes_group_messages() {
    let (handle, addr) = start(config());
    let mut alice = NetClient::connect(addr, PASSWORD).unwrap();
    let mut bob = NetClient::connect(addr, PASSWORD).unwrap();
    join(&mut alice, "alice", "g", None);
    join(&mut bob, "bob", "g", None);

    let mut tunnel = bob.open_tunnel().unwrap();
    alice.send_group(chat("t1", "pushed")).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut received = Vec::new();
    while received.is_empty() && Instant::now() < deadline {
        received = group_messages(&tunnel.recv(Duration::from_millis(500)).unwrap());
    }
    assert_eq!(
        received,
        vec![(MessageId::new("t1"), alice.client_id().clone(), b"pushed".to_vec())]
    );
    // Pushed deliveries are not handed out again on the request path.
    assert!(group_messages(&bob.poll().unwrap()).is_empty());

    handle.stop();
}
