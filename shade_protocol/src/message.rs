// Protocol messages for client-router communication.
//
// Two enums define the full protocol vocabulary:
// - `Request`: sent by clients to the router. Each variant is one command
//   code; a frame body carries a list of them.
// - `Reply`: sent by the router back to the client in the response to a
//   request frame. Deliveries queued for the client by other members
//   (`Reply::Delivery`) ride along in the same list, or are pushed over a
//   tunnel connection when the client has one open.
//
// Chat, search and browse payloads (`data` fields) are opaque to the
// router: clients encrypt them with their group secret before sending, so
// the router can route them but never read them.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::crypto::{CipherKind, HashKind};
use crate::types::{ChunkIndex, ClientId, GroupId, MessageId, RoomId, SessionId, TransferId};

/// Requests sent by a client to the router.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Key agreement. Creates a session, or re-keys the current one.
    Open(OpenRequest),
    /// Keep-alive and mailbox poll; optionally lists peer routers.
    Ping { routers: bool },
    /// Ask the router for random bytes.
    Entropy { size: u32 },
    /// Leave the router for good.
    Quit,
    /// Park this connection as the session's push channel. After the reply
    /// the router stops reading from it and instead writes queued
    /// deliveries to it as they arrive; the client acks each push.
    Tunnel,
    /// Enter a group (leaving the current one).
    Join(JoinRequest),
    /// Room listing and membership.
    Room(RoomMode),
    /// Mute or unmute another client.
    Mute { client: ClientId, muted: bool },
    /// Route a message to group members.
    Group(GroupRequest),
    /// Route a reply back to the requester of an earlier group message.
    Client(ClientReply),
    /// Consumer side of a transfer.
    Download(DownloadRequest),
    /// Producer side of a transfer.
    Upload(UploadRequest),
}

/// Key-agreement parameters chosen by the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub public_key: [u8; 32],
    pub cipher: CipherKind,
    /// Key size in bits; must match `cipher`.
    pub key_size: u32,
    pub hash: HashKind,
    pub iterations: u32,
    pub salt: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    pub group: GroupId,
    pub color: u32,
    pub share: bool,
    /// Proof of a verified name, checked against the router's verified store.
    pub password: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RoomMode {
    /// Group members, plus the room list in the public group.
    List,
    /// Members of one room.
    Browse(RoomId),
    Join(RoomId),
    Quit(RoomId),
}

/// A message routed to some or all members of the sender's group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupRequest {
    /// Empty for fire-and-forget traffic that needs no dedup or replies.
    pub id: MessageId,
    /// Explicit recipients (PM, browse, search). Empty means room or group.
    pub clients: Vec<ClientId>,
    pub room: Option<RoomId>,
    /// Always assigned by the router; a request carrying one is rejected.
    pub origin: Option<ClientId>,
    /// Share-category traffic (search, transfer negotiation).
    pub share: bool,
    /// Deliver to the sender as well.
    pub self_delivery: bool,
    pub data: Vec<u8>,
}

/// A point-to-point reply to the requester of message `id`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientReply {
    pub id: MessageId,
    /// Must be empty; replies only ever go back to the requester.
    pub clients: Vec<ClientId>,
    /// Must be empty; assigned by the router.
    pub origin: Option<ClientId>,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadMode {
    /// Reconcile the needed set and collect buffered chunks.
    None,
    /// Cancel the transfer.
    Remove,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub id: TransferId,
    pub mode: DownloadMode,
    /// Chunks the consumer still needs.
    pub chunks: BTreeSet<ChunkIndex>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub id: TransferId,
    /// The chunk the router asked for last time, if the producer has one.
    pub chunk: Option<Chunk>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: ChunkIndex,
    pub data: Vec<u8>,
}

/// Replies sent by the router.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// Handshake accepted. The client switches to the negotiated cipher for
    /// every frame after this one.
    Open {
        session: SessionId,
        client: ClientId,
        public_key: [u8; 32],
    },
    Pong { routers: Vec<RouterInfo> },
    Entropy { data: Vec<u8> },
    Join(JoinReply),
    Room {
        clients: Vec<ClientInfo>,
        rooms: Vec<RoomInfo>,
    },
    /// Buffered chunks for a consumer (possibly none yet).
    Download { id: TransferId, chunks: Vec<Chunk> },
    /// The chunk the producer should send next; `None` means "nothing to
    /// send right now, ask again later".
    Upload {
        id: TransferId,
        next: Option<ChunkIndex>,
    },
    /// The transfer was cancelled; stop sending or asking.
    Stopped { id: TransferId },
    /// A message queued for this client by another member.
    Delivery(Delivery),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinReply {
    pub client: ClientId,
    pub motd: Option<String>,
    pub clients: Vec<ClientInfo>,
    pub routers: Vec<RouterInfo>,
    pub rooms: Vec<RoomInfo>,
}

/// Mailbox entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Delivery {
    Group {
        id: MessageId,
        room: Option<RoomId>,
        origin: ClientId,
        data: Vec<u8>,
    },
    Reply {
        id: MessageId,
        origin: ClientId,
        data: Vec<u8>,
    },
    /// Another client entered the group.
    Joined(ClientInfo),
}

/// Public view of a group member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub name: String,
    pub color: u32,
    pub share: bool,
    pub troll: bool,
    pub verified: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: String,
    pub color: Option<u32>,
    pub size: usize,
}

/// A router a client may connect to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterInfo {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub password: String,
}
