// Per-client session state.
//
// A `Session` is created by a successful handshake (see `registry.rs`) and
// shared as `Arc<Session>` between the router's tables and whichever worker
// is servicing the client's connection. Every piece of mutable state has its
// own lock, held only for one read/modify step:
//
// - `id` / `cipher`: replaced together on re-key.
// - `attrs`: name, color, group and trust flags, rewritten on every join.
// - `mutes`: client ids this session refuses to hear from, at most
//   `MAX_MUTES` of them.
// - `tunneled`: set while the client has a parked push connection.
// - `mailbox`: deliveries queued by other members, drained into the next
//   reply. Any worker may push; only the worker answering this session's
//   frame drains.
// - `last_seen`: idle clock consulted by the sweep.
//
// The public `client` id never changes for the lifetime of the session; it
// is what other members see as a message origin.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use shade_protocol::{ClientId, ClientInfo, Delivery, GroupId, SessionCipher, SessionId};

/// Upper bound on one session's mute set.
pub const MAX_MUTES: usize = 256;

pub struct Session {
    id: RwLock<SessionId>,
    client: ClientId,
    cipher: Mutex<SessionCipher>,
    attrs: RwLock<Attributes>,
    mutes: Mutex<HashSet<ClientId>>,
    mailbox: Mutex<Mailbox>,
    tunneled: AtomicBool,
    last_seen: Mutex<Instant>,
}

/// Client-visible attributes set by `Join`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes {
    pub name: String,
    pub color: u32,
    /// `None` until the first join.
    pub group: Option<GroupId>,
    pub share: bool,
    pub verified: bool,
    pub troll: bool,
}

impl Session {
    pub fn new(
        id: SessionId,
        client: ClientId,
        cipher: SessionCipher,
        mailbox_capacity: usize,
    ) -> Self {
        Self {
            id: RwLock::new(id),
            client,
            cipher: Mutex::new(cipher),
            attrs: RwLock::new(Attributes::default()),
            mutes: Mutex::new(HashSet::new()),
            mailbox: Mutex::new(Mailbox::new(mailbox_capacity)),
            tunneled: AtomicBool::new(false),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id.read().clone()
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client
    }

    pub fn cipher(&self) -> SessionCipher {
        self.cipher.lock().clone()
    }

    /// Switch to a fresh id and cipher. The router updates its tables
    /// around this call.
    pub(crate) fn rekey(&self, id: SessionId, cipher: SessionCipher) {
        *self.id.write() = id;
        *self.cipher.lock() = cipher;
    }

    pub fn attributes(&self) -> Attributes {
        self.attrs.read().clone()
    }

    pub fn group(&self) -> Option<GroupId> {
        self.attrs.read().group.clone()
    }

    pub fn name(&self) -> String {
        self.attrs.read().name.clone()
    }

    pub fn is_verified(&self) -> bool {
        self.attrs.read().verified
    }

    pub fn is_sharing(&self) -> bool {
        self.attrs.read().share
    }

    pub fn is_troll(&self) -> bool {
        self.attrs.read().troll
    }

    /// Replace the join attributes. Trust flags start over on every join.
    pub(crate) fn set_joined(&self, name: String, color: u32, group: GroupId, share: bool) {
        let mut attrs = self.attrs.write();
        attrs.name = name;
        attrs.color = color;
        attrs.group = Some(group);
        attrs.share = share;
        attrs.verified = false;
        attrs.troll = false;
    }

    pub(crate) fn set_verified(&self, verified: bool) {
        self.attrs.write().verified = verified;
    }

    pub(crate) fn set_troll(&self, troll: bool) {
        self.attrs.write().troll = troll;
    }

    pub(crate) fn clear_group(&self) {
        self.attrs.write().group = None;
    }

    /// Public view for member lists and join notices.
    pub fn info(&self) -> ClientInfo {
        let attrs = self.attrs.read();
        ClientInfo {
            id: self.client.clone(),
            name: attrs.name.clone(),
            color: attrs.color,
            share: attrs.share,
            troll: attrs.troll,
            verified: attrs.verified,
        }
    }

    /// Add `client` to the mute set. Returns false once the set is full.
    pub fn mute(&self, client: ClientId) -> bool {
        let mut mutes = self.mutes.lock();
        if mutes.len() >= MAX_MUTES && !mutes.contains(&client) {
            return false;
        }
        mutes.insert(client);
        true
    }

    pub fn unmute(&self, client: &ClientId) {
        self.mutes.lock().remove(client);
    }

    pub fn has_muted(&self, client: &ClientId) -> bool {
        self.mutes.lock().contains(client)
    }

    pub fn deliver(&self, delivery: Delivery) {
        self.mailbox.lock().push(delivery);
    }

    pub fn drain_mailbox(&self) -> Vec<Delivery> {
        self.mailbox.lock().drain()
    }

    /// Put back deliveries whose reply could not be written.
    pub fn restore_mailbox(&self, deliveries: Vec<Delivery>) {
        self.mailbox.lock().restore(deliveries);
    }

    pub fn mailbox_len(&self) -> usize {
        self.mailbox.lock().len()
    }

    pub fn is_tunneled(&self) -> bool {
        self.tunneled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_tunneled(&self, tunneled: bool) {
        self.tunneled.store(tunneled, Ordering::SeqCst);
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_seen.lock())
    }
}

/// Bounded FIFO of pending deliveries. When full, the oldest entry is
/// dropped to make room.
#[derive(Debug)]
pub struct Mailbox {
    entries: VecDeque<Delivery>,
    capacity: usize,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, delivery: Delivery) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(delivery);
    }

    pub fn drain(&mut self) -> Vec<Delivery> {
        self.entries.drain(..).collect()
    }

    /// Re-queue `deliveries` ahead of anything that arrived since they were
    /// drained, then trim the oldest back down to capacity.
    pub fn restore(&mut self, deliveries: Vec<Delivery>) {
        for delivery in deliveries.into_iter().rev() {
            self.entries.push_front(delivery);
        }
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shade_protocol::MessageId;

    fn delivery(n: u8) -> Delivery {
        Delivery::Reply {
            id: MessageId::new(format!("m{n}")),
            origin: ClientId::new("c"),
            data: vec![n],
        }
    }

    fn session() -> Session {
        Session::new(
            SessionId::new("s1"),
            ClientId::new("c1"),
            SessionCipher::from_password("pw"),
            4,
        )
    }

    #[test]
    fn mailbox_drops_oldest_when_full() {
        let mut mailbox = Mailbox::new(2);
        mailbox.push(delivery(1));
        mailbox.push(delivery(2));
        mailbox.push(delivery(3));
        assert_eq!(mailbox.drain(), vec![delivery(2), delivery(3)]);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn restore_keeps_order_ahead_of_new_entries() {
        let mut mailbox = Mailbox::new(3);
        mailbox.push(delivery(1));
        mailbox.push(delivery(2));
        let drained = mailbox.drain();
        mailbox.push(delivery(3));
        mailbox.restore(drained);
        assert_eq!(mailbox.drain(), vec![delivery(1), delivery(2), delivery(3)]);
    }

    #[test]
    fn restore_respects_capacity() {
        let mut mailbox = Mailbox::new(2);
        mailbox.push(delivery(1));
        mailbox.push(delivery(2));
        let drained = mailbox.drain();
        mailbox.push(delivery(3));
        mailbox.restore(drained);
        assert_eq!(mailbox.len(), 2);
        assert_eq!(mailbox.drain(), vec![delivery(2), delivery(3)]);
    }

    #[test]
    fn join_resets_trust_flags() {
        let s = session();
        s.set_verified(true);
        s.set_troll(true);
        s.set_joined("alice".into(), 7, GroupId::new("g"), true);
        let attrs = s.attributes();
        assert!(!attrs.verified);
        assert!(!attrs.troll);
        assert_eq!(attrs.group, Some(GroupId::new("g")));
        assert_eq!(s.info().name, "alice");
    }

    #[test]
    fn mute_set() {
        let s = session();
        let other = ClientId::new("c2");
        assert!(s.mute(other.clone()));
        assert!(s.has_muted(&other));
        s.unmute(&other);
        assert!(!s.has_muted(&other));
    }

    #[test]
    fn mute_set_is_bounded() {
        let s = session();
        for n in 0..MAX_MUTES {
            assert!(s.mute(ClientId::new(format!("c{n}"))));
        }
        assert!(!s.mute(ClientId::new("one-too-many")));
        assert!(!s.has_muted(&ClientId::new("one-too-many")));
        // Re-muting a member already in the set still succeeds.
        assert!(s.mute(ClientId::new("c0")));
        s.unmute(&ClientId::new("c0"));
        assert!(s.mute(ClientId::new("one-too-many")));
    }

    #[test]
    fn rekey_changes_id_not_client() {
        let s = session();
        s.rekey(SessionId::new("s2"), SessionCipher::from_password("x"));
        assert_eq!(s.id(), SessionId::new("s2"));
        assert_eq!(s.client_id(), &ClientId::new("c1"));
    }
}
