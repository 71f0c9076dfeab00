// Groups and rooms.
//
// A `Group` is the set of sessions sharing one group secret. It refers to
// its members only by public client id; the router's client index resolves
// those to live sessions, so a re-key never has to touch a group.
//
// Tables, each behind its own lock:
// - `clients`:   member client ids.
// - `messages`:  dedup table, message id -> requester + registration time.
//                A message id is registered at most once until it expires.
// - `names`:     display name -> client id, used for troll detection.
// - `transfers`: transfer ids seen in this group -> last touch.
// - `rooms`:     room id -> `Room`, materialized from configuration when
//                the group is created.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use shade_protocol::{ClientId, GroupId, MessageId, RoomId, RoomInfo, TransferId};

use crate::config::RoomConfig;

/// Bytes of the name hash kept in a room id.
const ROOM_ID_BYTES: usize = 8;

pub struct Group {
    id: GroupId,
    clients: RwLock<HashSet<ClientId>>,
    messages: Mutex<HashMap<MessageId, MessageEntry>>,
    names: RwLock<HashMap<String, ClientId>>,
    transfers: Mutex<HashMap<TransferId, Instant>>,
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
}

#[derive(Clone, Debug)]
struct MessageEntry {
    requester: ClientId,
    registered_at: Instant,
}

impl Group {
    pub fn new(id: GroupId, rooms: &[RoomConfig]) -> Self {
        let rooms = rooms
            .iter()
            .filter(|r| r.enabled)
            .map(|r| {
                let room = Room::new(&r.name, r.color);
                (room.id.clone(), Arc::new(room))
            })
            .collect();
        Self {
            id,
            clients: RwLock::new(HashSet::new()),
            messages: Mutex::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            transfers: Mutex::new(HashMap::new()),
            rooms: RwLock::new(rooms),
        }
    }

    pub fn id(&self) -> &GroupId {
        &self.id
    }

    /// The public group has the empty id and is the only one that lists
    /// rooms.
    pub fn is_public(&self) -> bool {
        self.id.is_empty()
    }

    pub fn insert_client(&self, client: ClientId) {
        self.clients.write().insert(client);
    }

    /// Drop a member from the client table, every room, and the name table
    /// if it holds `name`.
    pub fn remove_client(&self, client: &ClientId, name: &str) {
        self.clients.write().remove(client);
        for room in self.rooms.read().values() {
            room.remove(client);
        }
        let mut names = self.names.write();
        if names.get(name) == Some(client) {
            names.remove(name);
        }
    }

    pub fn contains(&self, client: &ClientId) -> bool {
        self.clients.read().contains(client)
    }

    pub fn clients(&self) -> Vec<ClientId> {
        self.clients.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Register a message id. Returns false, leaving the existing entry
    /// untouched, if the id is already registered.
    pub fn register_message(&self, id: MessageId, requester: ClientId, now: Instant) -> bool {
        let mut messages = self.messages.lock();
        if messages.contains_key(&id) {
            return false;
        }
        messages.insert(
            id,
            MessageEntry {
                requester,
                registered_at: now,
            },
        );
        true
    }

    pub fn requester(&self, id: &MessageId) -> Option<ClientId> {
        self.messages.lock().get(id).map(|e| e.requester.clone())
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }

    /// Who currently holds `name`, if anyone.
    pub fn name_holder(&self, name: &str) -> Option<ClientId> {
        self.names.read().get(name).cloned()
    }

    pub fn claim_name(&self, name: String, client: ClientId) {
        self.names.write().insert(name, client);
    }

    pub fn touch_transfer(&self, id: TransferId, now: Instant) {
        self.transfers.lock().insert(id, now);
    }

    pub fn has_transfer(&self, id: &TransferId) -> bool {
        self.transfers.lock().contains_key(id)
    }

    /// Drop message and transfer entries older than `ttl`.
    pub fn expire(&self, now: Instant, ttl: Duration) {
        self.messages
            .lock()
            .retain(|_, e| now.saturating_duration_since(e.registered_at) < ttl);
        self.transfers
            .lock()
            .retain(|_, touched| now.saturating_duration_since(*touched) < ttl);
    }

    pub fn room(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.read().get(id).cloned()
    }

    pub fn room_list(&self) -> Vec<RoomInfo> {
        let mut rooms: Vec<RoomInfo> = self.rooms.read().values().map(|r| r.info()).collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }
}

/// A named sub-channel with its own member subset.
pub struct Room {
    id: RoomId,
    name: String,
    color: Option<u32>,
    clients: RwLock<HashSet<ClientId>>,
}

impl Room {
    pub fn new(name: &str, color: Option<u32>) -> Self {
        Self {
            id: room_id(name),
            name: name.to_string(),
            color,
            clients: RwLock::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the client was not already a member.
    pub fn insert(&self, client: ClientId) -> bool {
        self.clients.write().insert(client)
    }

    pub fn remove(&self, client: &ClientId) -> bool {
        self.clients.write().remove(client)
    }

    pub fn contains(&self, client: &ClientId) -> bool {
        self.clients.read().contains(client)
    }

    pub fn clients(&self) -> Vec<ClientId> {
        self.clients.read().iter().cloned().collect()
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            color: self.color,
            size: self.clients.read().len(),
        }
    }
}

/// Stable room id derived from the room name, so every router and every
/// group agree on it.
pub fn room_id(name: &str) -> RoomId {
    let digest = Sha256::digest(name.as_bytes());
    RoomId::new(hex::encode(&digest[..ROOM_ID_BYTES]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rooms() -> Vec<RoomConfig> {
        vec![
            RoomConfig {
                name: "lobby".into(),
                color: Some(0xff0000),
                enabled: true,
            },
            RoomConfig {
                name: "closed".into(),
                color: None,
                enabled: false,
            },
        ]
    }

    #[test]
    fn only_enabled_rooms_materialize() {
        let group = Group::new(GroupId::default(), &rooms());
        let list = group.room_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "lobby");
        assert_eq!(list[0].id, room_id("lobby"));
        assert!(group.is_public());
    }

    #[test]
    fn message_registered_once() {
        let group = Group::new(GroupId::new("g"), &[]);
        let now = Instant::now();
        assert!(group.register_message(MessageId::new("m1"), ClientId::new("a"), now));
        assert!(!group.register_message(MessageId::new("m1"), ClientId::new("b"), now));
        assert_eq!(group.message_count(), 1);
        assert_eq!(
            group.requester(&MessageId::new("m1")),
            Some(ClientId::new("a"))
        );
    }

    #[test]
    fn concurrent_registration_has_one_winner() {
        let group = Group::new(GroupId::new("g"), &[]);
        let barrier = std::sync::Barrier::new(8);
        let now = Instant::now();
        let winners: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|n| {
                    let group = &group;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        group.register_message(
                            MessageId::new("m"),
                            ClientId::new(format!("c{n}")),
                            now,
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(winners.iter().filter(|won| **won).count(), 1);
        assert_eq!(group.message_count(), 1);
        let winner = winners.iter().position(|won| *won).unwrap();
        assert_eq!(
            group.requester(&MessageId::new("m")),
            Some(ClientId::new(format!("c{winner}")))
        );
    }

    #[test]
    fn expiry_drops_old_entries() {
        let group = Group::new(GroupId::new("g"), &[]);
        let start = Instant::now();
        group.register_message(MessageId::new("old"), ClientId::new("a"), start);
        group.touch_transfer(TransferId::new("t"), start);
        let later = start + Duration::from_secs(10);
        group.register_message(MessageId::new("new"), ClientId::new("a"), later);

        group.expire(later, Duration::from_secs(5));
        assert_eq!(group.message_count(), 1);
        assert!(group.requester(&MessageId::new("new")).is_some());
        assert!(!group.has_transfer(&TransferId::new("t")));
    }

    #[test]
    fn remove_client_cleans_rooms_and_names() {
        let group = Group::new(GroupId::default(), &rooms());
        let alice = ClientId::new("a");
        let lobby = group.room(&room_id("lobby")).unwrap();
        group.insert_client(alice.clone());
        group.claim_name("alice".into(), alice.clone());
        lobby.insert(alice.clone());

        group.remove_client(&alice, "alice");
        assert!(group.is_empty());
        assert!(!lobby.contains(&alice));
        assert_eq!(group.name_holder("alice"), None);
    }

    #[test]
    fn remove_client_leaves_other_name_holder() {
        let group = Group::new(GroupId::new("g"), &[]);
        group.claim_name("alice".into(), ClientId::new("a"));
        group.remove_client(&ClientId::new("b"), "alice");
        assert_eq!(group.name_holder("alice"), Some(ClientId::new("a")));
    }
}
