// Frame dispatch and command handlers.
//
// `dispatch` turns one decoded `RequestFrame` into one `ReplyFrame` plus a
// decision on whether the connection stays open. It never touches a
// socket; `server.rs` owns all I/O and deadlines.
//
// Order of checks for a frame:
// 1. Empty body: redirect (or not found) and close.
// 2. No session header: the body must be exactly one `Open`, sealed with
//    the router's password cipher. Anything else closes the connection.
// 3. Unknown session, or a body the session cipher cannot open: close.
// 4. Every request is validated before any is executed, so a bad request
//    rejects the whole frame with `BadRequest` and changes nothing.
// 5. Transfer requests on a message-only router: `NotImplemented`, close.
// 6. Requests run in order. The reply carries the drained mailbox first,
//    then one entry per answered request, sealed with the cipher that
//    opened the frame (so a re-key reply is still readable).
// 7. `Tunnel` parks the connection after the reply (`Flow::Tunnel`); the
//    server then pushes the session's deliveries over it.
//
// Policy rejections and lookup misses inside the handlers are silent: the
// request simply produces no deliveries.

use std::sync::Arc;
use std::time::Instant;

use rand::RngCore;
use shade_protocol::types::{
    MAX_ENTROPY_SIZE, MAX_NAME_SIZE, MAX_NEEDED_CHUNKS, MAX_PASSPHRASE_SIZE,
};
use shade_protocol::{
    ClientId, ClientInfo, ClientReply, Delivery, DownloadMode, DownloadRequest, GroupRequest,
    JoinReply, JoinRequest, KeyExchange, KeyParams, OpenRequest, Reply, ReplyFrame, Request,
    RequestFrame, RoomMode, SessionCipher, SessionId, Status, TransferId, UploadRequest,
};
use tracing::{debug, warn};

use crate::error::{Result, RouterError};
use crate::registry::Router;
use crate::session::Session;
use crate::transfer::{DownloadOutcome, UploadOutcome};

/// What the connection does after the reply is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Read,
    Close,
    /// Stop reading; the connection now carries pushed deliveries.
    Tunnel,
}

/// Result of dispatching one frame.
pub struct Outcome {
    pub reply: ReplyFrame,
    pub flow: Flow,
    /// The session whose mailbox was drained into `reply`, and what was
    /// drained, so a failed write can put it back.
    pub drained: Option<(Arc<Session>, Vec<Delivery>)>,
}

impl Outcome {
    fn status(status: Status, flow: Flow) -> Self {
        Self {
            reply: ReplyFrame::status(status),
            flow,
            drained: None,
        }
    }

    fn error(err: &RouterError) -> Self {
        let flow = if err.keeps_connection() {
            Flow::Read
        } else {
            Flow::Close
        };
        Self::status(err.status(), flow)
    }

    fn ok(body: Vec<u8>, flow: Flow, drained: Option<(Arc<Session>, Vec<Delivery>)>) -> Self {
        Self {
            reply: ReplyFrame {
                status: Status::Ok,
                location: None,
                body,
            },
            flow,
            drained,
        }
    }

    /// The session this frame was answered for, once it has one.
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.drained.as_ref().map(|(session, _)| session)
    }

    /// Return drained deliveries to their mailbox.
    pub fn restore_mailbox(self) {
        if let Some((session, deliveries)) = self.drained {
            session.restore_mailbox(deliveries);
        }
    }
}

pub fn dispatch(router: &Router, frame: RequestFrame) -> Outcome {
    if frame.body.is_empty() {
        return redirect(router);
    }
    match frame.session {
        None => open_session(router, &frame.body),
        Some(id) => continue_session(router, &id, &frame.body),
    }
}

fn redirect(router: &Router) -> Outcome {
    match &router.config().redirect {
        Some(location) => Outcome {
            reply: ReplyFrame {
                status: Status::Redirect,
                location: Some(location.clone()),
                body: Vec::new(),
            },
            flow: Flow::Close,
            drained: None,
        },
        None => Outcome::status(Status::NotFound, Flow::Close),
    }
}

fn open_frame(cipher: &SessionCipher, body: &[u8]) -> Result<Vec<Request>> {
    let plain = cipher.decrypt(body)?;
    Ok(serde_json::from_slice(&plain)?)
}

fn seal(cipher: &SessionCipher, replies: &[Reply]) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(replies)?;
    Ok(cipher.encrypt(&json)?)
}

/// Body of a tunnel push: `deliveries` sealed with the session's current
/// cipher.
pub(crate) fn seal_push(session: &Session, deliveries: &[Delivery]) -> Result<Vec<u8>> {
    let replies: Vec<Reply> = deliveries.iter().cloned().map(Reply::Delivery).collect();
    seal(&session.cipher(), &replies)
}

/// First frame of a connection without a session: the handshake.
fn open_session(router: &Router, body: &[u8]) -> Outcome {
    let cipher = router.password_cipher();
    let requests = match open_frame(cipher, body) {
        Ok(requests) => requests,
        Err(e) => {
            warn!("rejected handshake frame: {e}");
            return Outcome::status(Status::Unauthorized, Flow::Close);
        }
    };
    let [Request::Open(open)] = requests.as_slice() else {
        warn!("frame without session must be a single open");
        return Outcome::status(Status::Unauthorized, Flow::Close);
    };
    if let Err(e) = validate_open(open) {
        debug!("handshake rejected: {e}");
        return Outcome::error(&e);
    }

    let exchange = KeyExchange::new();
    let public_key = exchange.public_key();
    let shared = exchange.agree(open.public_key);
    let negotiated =
        match SessionCipher::derive(&shared, &router.config().password, &key_params(open)) {
            Ok(cipher) => cipher,
            Err(e) => return Outcome::error(&RouterError::from(e)),
        };
    let session = match router.create_session(negotiated) {
        Ok(session) => session,
        Err(e) => {
            warn!("session not created: {e}");
            return Outcome::error(&e);
        }
    };

    let reply = Reply::Open {
        session: session.id(),
        client: session.client_id().clone(),
        public_key,
    };
    match seal(cipher, &[reply]) {
        Ok(body) => Outcome::ok(body, Flow::Read, None),
        Err(e) => {
            warn!("handshake reply failed: {e}");
            router.teardown(&session);
            Outcome::error(&e)
        }
    }
}

fn continue_session(router: &Router, id: &SessionId, body: &[u8]) -> Outcome {
    let Some(session) = router.session(id) else {
        warn!("frame for unknown session");
        return Outcome::status(Status::Unauthorized, Flow::Close);
    };
    let cipher = session.cipher();
    let requests = match open_frame(&cipher, body) {
        Ok(requests) => requests,
        Err(e) => {
            warn!(client = %session.client_id(), "rejected frame: {e}");
            return Outcome::status(Status::Unauthorized, Flow::Close);
        }
    };
    session.touch();

    if let Err(e) = requests.iter().try_for_each(validate) {
        debug!(client = %session.client_id(), "bad request: {e}");
        return Outcome::error(&e);
    }
    if !router.role().relays_transfers() && requests.iter().any(is_transfer) {
        return Outcome::error(&RouterError::NotTransferCapable);
    }

    let mut replies = Vec::new();
    let mut flow = Flow::Read;
    for request in requests {
        debug!(client = %session.client_id(), command = command_name(&request), "dispatch");
        match request {
            Request::Quit => {
                router.teardown(&session);
                flow = Flow::Close;
                break;
            }
            Request::Tunnel => {
                flow = Flow::Tunnel;
                continue;
            }
            _ => {}
        }
        match execute(router, &session, request) {
            Ok(mut answered) => replies.append(&mut answered),
            Err(e) => {
                warn!(client = %session.client_id(), "command failed: {e}");
                return Outcome::error(&e);
            }
        }
    }

    let deliveries = session.drain_mailbox();
    let mut all: Vec<Reply> = deliveries.iter().cloned().map(Reply::Delivery).collect();
    all.append(&mut replies);
    match seal(&cipher, &all) {
        Ok(body) => Outcome::ok(body, flow, Some((session, deliveries))),
        Err(e) => {
            session.restore_mailbox(deliveries);
            Outcome::error(&e)
        }
    }
}

fn execute(router: &Router, session: &Session, request: Request) -> Result<Vec<Reply>> {
    match request {
        Request::Open(open) => rekey(router, session, &open).map(|r| vec![r]),
        Request::Ping { routers } => Ok(vec![ping(router, routers)]),
        Request::Entropy { size } => Ok(vec![entropy(size)]),
        Request::Quit | Request::Tunnel => Ok(Vec::new()),
        Request::Join(join) => Ok(vec![self::join(router, session, join)]),
        Request::Room(mode) => Ok(vec![room(router, session, mode)]),
        Request::Mute { client, muted } => {
            if muted {
                // Only live clients can be muted; stale ids would just fill the set.
                if router.session_by_client(&client).is_some() && !session.mute(client) {
                    debug!(client = %session.client_id(), "mute set full");
                }
            } else {
                session.unmute(&client);
            }
            Ok(Vec::new())
        }
        Request::Group(message) => {
            route_group(router, session, message);
            Ok(Vec::new())
        }
        Request::Client(reply) => {
            route_reply(router, session, reply);
            Ok(Vec::new())
        }
        Request::Download(download) => Ok(vec![self::download(router, session, download)]),
        Request::Upload(upload) => Ok(vec![self::upload(router, session, upload)]),
    }
}

fn command_name(request: &Request) -> &'static str {
    match request {
        Request::Open(_) => "open",
        Request::Ping { .. } => "ping",
        Request::Entropy { .. } => "entropy",
        Request::Quit => "quit",
        Request::Tunnel => "tunnel",
        Request::Join(_) => "join",
        Request::Room(_) => "room",
        Request::Mute { .. } => "mute",
        Request::Group(_) => "group",
        Request::Client(_) => "client",
        Request::Download(_) => "download",
        Request::Upload(_) => "upload",
    }
}

fn is_transfer(request: &Request) -> bool {
    matches!(request, Request::Download(_) | Request::Upload(_))
}

// Validation

fn validate(request: &Request) -> Result<()> {
    match request {
        Request::Open(open) => validate_open(open),
        Request::Ping { .. } | Request::Quit | Request::Tunnel => Ok(()),
        Request::Entropy { size } => {
            if *size > MAX_ENTROPY_SIZE {
                return Err(RouterError::Invalid("entropy size"));
            }
            Ok(())
        }
        Request::Join(join) => {
            if join.name.len() > MAX_NAME_SIZE {
                return Err(RouterError::Invalid("name"));
            }
            if !join.group.within_limit() {
                return Err(RouterError::Invalid("group id"));
            }
            if join
                .password
                .as_ref()
                .is_some_and(|p| p.len() > MAX_PASSPHRASE_SIZE)
            {
                return Err(RouterError::Invalid("passphrase"));
            }
            Ok(())
        }
        Request::Room(RoomMode::List) => Ok(()),
        Request::Room(RoomMode::Browse(id) | RoomMode::Join(id) | RoomMode::Quit(id)) => {
            if !id.within_limit() {
                return Err(RouterError::Invalid("room id"));
            }
            Ok(())
        }
        Request::Mute { client, .. } => {
            if !client.within_limit() {
                return Err(RouterError::Invalid("client id"));
            }
            Ok(())
        }
        Request::Group(message) => {
            if message.origin.is_some() {
                return Err(RouterError::Invalid("origin"));
            }
            if !message.id.within_limit() {
                return Err(RouterError::Invalid("message id"));
            }
            if message.room.as_ref().is_some_and(|r| !r.within_limit()) {
                return Err(RouterError::Invalid("room id"));
            }
            if message.clients.iter().any(|c| !c.within_limit()) {
                return Err(RouterError::Invalid("client id"));
            }
            Ok(())
        }
        Request::Client(reply) => {
            if reply.origin.is_some() {
                return Err(RouterError::Invalid("origin"));
            }
            if !reply.clients.is_empty() {
                return Err(RouterError::Invalid("client list on reply"));
            }
            if !reply.id.within_limit() {
                return Err(RouterError::Invalid("message id"));
            }
            Ok(())
        }
        Request::Download(DownloadRequest { id, chunks, .. }) => {
            if !id.within_limit() {
                return Err(RouterError::Invalid("transfer id"));
            }
            if chunks.len() > MAX_NEEDED_CHUNKS {
                return Err(RouterError::Invalid("needed chunks"));
            }
            Ok(())
        }
        Request::Upload(UploadRequest { id, .. }) => {
            if !id.within_limit() {
                return Err(RouterError::Invalid("transfer id"));
            }
            Ok(())
        }
    }
}

fn key_params(open: &OpenRequest) -> KeyParams {
    KeyParams {
        cipher: open.cipher,
        key_size: open.key_size,
        hash: open.hash,
        iterations: open.iterations,
        salt: open.salt.clone(),
    }
}

fn validate_open(open: &OpenRequest) -> Result<()> {
    key_params(open)
        .validate()
        .map_err(|_| RouterError::Invalid("handshake parameters"))
}

// Local commands

fn rekey(router: &Router, session: &Session, open: &OpenRequest) -> Result<Reply> {
    let exchange = KeyExchange::new();
    let public_key = exchange.public_key();
    let shared = exchange.agree(open.public_key);
    let cipher = SessionCipher::derive(&shared, &router.config().password, &key_params(open))?;
    let id = router.rekey(session, cipher)?;
    Ok(Reply::Open {
        session: id,
        client: session.client_id().clone(),
        public_key,
    })
}

fn ping(router: &Router, routers: bool) -> Reply {
    Reply::Pong {
        routers: if routers { router.routers() } else { Vec::new() },
    }
}

fn entropy(size: u32) -> Reply {
    let mut data = vec![0u8; size as usize];
    rand::thread_rng().fill_bytes(&mut data);
    Reply::Entropy { data }
}

// Group and room membership

fn member_infos(router: &Router, clients: Vec<ClientId>) -> Vec<ClientInfo> {
    let mut infos: Vec<ClientInfo> = clients
        .iter()
        .filter_map(|c| router.session_by_client(c))
        .map(|s| s.info())
        .collect();
    infos.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    infos
}

fn join(router: &Router, session: &Session, request: JoinRequest) -> Reply {
    router.leave_group(session);
    session.set_joined(
        request.name.clone(),
        request.color,
        request.group.clone(),
        request.share,
    );
    if let Some(key) = &request.password {
        if router.verified().verify(&request.name, key) {
            session.set_verified(true);
        }
    }

    let client = session.client_id().clone();
    let group = router.enter_group(&request.group, client.clone());
    let held_by_verified = group
        .name_holder(&request.name)
        .filter(|holder| *holder != client)
        .and_then(|holder| router.session_by_client(&holder))
        .is_some_and(|holder| holder.is_verified());
    if held_by_verified && !session.is_verified() {
        session.set_troll(true);
    } else {
        group.claim_name(request.name, client.clone());
    }

    let notice = Delivery::Joined(session.info());
    for member in group.clients() {
        if member == client {
            continue;
        }
        if let Some(other) = router.session_by_client(&member) {
            router.deliver(&other, notice.clone());
        }
    }
    debug!(client = %client, group = %group.id(), "joined");

    Reply::Join(JoinReply {
        client,
        motd: router.config().motd.clone(),
        clients: member_infos(router, group.clients()),
        routers: router.routers(),
        rooms: if group.is_public() {
            group.room_list()
        } else {
            Vec::new()
        },
    })
}

fn room(router: &Router, session: &Session, mode: RoomMode) -> Reply {
    let empty = Reply::Room {
        clients: Vec::new(),
        rooms: Vec::new(),
    };
    let Some(group) = session.group().and_then(|g| router.group(&g)) else {
        return empty;
    };
    let client = session.client_id();

    // Some(true) joins the room, Some(false) leaves it.
    let (id, membership) = match mode {
        RoomMode::List => {
            return Reply::Room {
                clients: member_infos(router, group.clients()),
                rooms: if group.is_public() {
                    group.room_list()
                } else {
                    Vec::new()
                },
            };
        }
        RoomMode::Browse(id) => (id, None),
        RoomMode::Join(id) => (id, Some(true)),
        RoomMode::Quit(id) => (id, Some(false)),
    };
    let Some(room) = group.room(&id) else {
        return empty;
    };
    match membership {
        Some(true) => {
            room.insert(client.clone());
        }
        Some(false) => {
            room.remove(client);
        }
        None => {}
    }
    Reply::Room {
        clients: member_infos(router, room.clients()),
        rooms: Vec::new(),
    }
}

// Routing

fn route_group(router: &Router, session: &Session, message: GroupRequest) {
    let sender = session.client_id();
    let Some(group) = session.group().and_then(|g| router.group(&g)) else {
        debug!(client = %sender, "group message outside any group");
        return;
    };
    if message.data.is_empty() {
        return;
    }

    let addressed = !message.clients.is_empty();
    if !(session.is_verified() || addressed || message.share || !group.is_public()) {
        debug!(client = %sender, "group message rejected by spam gate");
        return;
    }

    if !message.id.is_empty()
        && !group.register_message(message.id.clone(), sender.clone(), Instant::now())
    {
        debug!(client = %sender, id = %message.id, "duplicate message id");
        return;
    }

    let targets: Vec<ClientId> = if addressed {
        message
            .clients
            .iter()
            .filter(|c| group.contains(c))
            .cloned()
            .collect()
    } else if let Some(room_id) = &message.room {
        let Some(room) = group.room(room_id) else {
            return;
        };
        room.insert(sender.clone());
        room.clients()
    } else {
        group.clients()
    };

    let delivery = Delivery::Group {
        id: message.id,
        room: message.room,
        origin: sender.clone(),
        data: message.data,
    };
    for target in targets {
        if target == *sender {
            if message.self_delivery {
                session.deliver(delivery.clone());
            }
            continue;
        }
        let Some(recipient) = router.session_by_client(&target) else {
            continue;
        };
        if recipient.has_muted(sender) || session.has_muted(&target) {
            continue;
        }
        if message.share && !recipient.is_sharing() {
            continue;
        }
        router.deliver(&recipient, delivery.clone());
    }
}

fn route_reply(router: &Router, session: &Session, reply: ClientReply) {
    let Some(group) = session.group().and_then(|g| router.group(&g)) else {
        return;
    };
    let Some(requester) = group.requester(&reply.id) else {
        debug!(client = %session.client_id(), id = %reply.id, "reply to unknown message");
        return;
    };
    let Some(recipient) = router.session_by_client(&requester) else {
        return;
    };
    router.deliver(
        &recipient,
        Delivery::Reply {
            id: reply.id,
            origin: session.client_id().clone(),
            data: reply.data,
        },
    );
}

// Transfers

fn touch_group_transfer(router: &Router, session: &Session, id: &TransferId) {
    if let Some(group) = session.group().and_then(|g| router.group(&g)) {
        group.touch_transfer(id.clone(), Instant::now());
    }
}

fn download(router: &Router, session: &Session, request: DownloadRequest) -> Reply {
    touch_group_transfer(router, session, &request.id);
    match request.mode {
        DownloadMode::Remove => {
            // Cancelling an unknown transfer must not create a stopped one.
            if let Some(transfer) = router.transfers().get(&request.id) {
                transfer.stop();
            }
            Reply::Stopped { id: request.id }
        }
        DownloadMode::None => match router
            .transfers()
            .for_download(&request.id)
            .download(&request.chunks)
        {
            DownloadOutcome::Chunks(chunks) => Reply::Download {
                id: request.id,
                chunks,
            },
            DownloadOutcome::Stopped => Reply::Stopped { id: request.id },
        },
    }
}

fn upload(router: &Router, session: &Session, request: UploadRequest) -> Reply {
    touch_group_transfer(router, session, &request.id);
    let transfer = router.transfers().for_upload(&request.id);
    match transfer.upload(request.chunk, router.config().buffer_size) {
        UploadOutcome::Next(next) => Reply::Upload {
            id: request.id,
            next,
        },
        UploadOutcome::Stopped => Reply::Stopped { id: request.id },
    }
}
