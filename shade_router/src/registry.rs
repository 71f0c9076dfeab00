// The router's registries and entity lifecycle.
//
// `Router` owns every session, group and transfer. Tables are independent,
// each behind its own lock; when both session tables are needed they are
// always locked in the order `sessions` then `clients`.
//
// - `sessions`: session id -> `Arc<Session>`.
// - `clients`:  public client id -> session id.
// - `groups`:   group id -> `Arc<Group>`, created on first join.
// - `transfers`: see `transfer.rs`.
// - `verified`: name -> key, loaded from configuration.
//
// Sessions are created only by the handshake and destroyed by `teardown`,
// which both `Quit` and the idle sweep go through.
//
// A client enters a group while the `groups` lock is held, and an empty
// private group is only removed under the write lock after re-checking that
// it is still empty. A joiner therefore never lands in a group that has
// already been unlinked.
//
// Deliveries go through `Router::deliver`. For a session with a tunnel open
// it also posts the client id on the wake channel, which the server's
// workers drain to push the mailbox out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use shade_protocol::{ClientId, Delivery, GroupId, RouterInfo, SessionCipher, SessionId};
use tracing::{debug, info};

use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::federation::{Federation, Role};
use crate::group::Group;
use crate::session::Session;
use crate::transfer::TransferTable;

/// How many random ids to draw before giving up on a unique one.
const MAX_ID_ATTEMPTS: usize = 8;

pub struct Router {
    config: RouterConfig,
    password_cipher: SessionCipher,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    clients: RwLock<HashMap<ClientId, SessionId>>,
    groups: RwLock<HashMap<GroupId, Arc<Group>>>,
    transfers: TransferTable,
    verified: VerifiedStore,
    federation: Federation,
    wake_tx: Sender<ClientId>,
    wake_rx: Receiver<ClientId>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        let password_cipher = SessionCipher::from_password(&config.password);
        let verified = VerifiedStore::new(config.verified.clone());
        let federation = Federation::new(&config);
        let (wake_tx, wake_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            password_cipher,
            sessions: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            transfers: TransferTable::new(),
            verified,
            federation,
            wake_tx,
            wake_rx,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The cipher for frames sent before a session exists.
    pub fn password_cipher(&self) -> &SessionCipher {
        &self.password_cipher
    }

    pub fn role(&self) -> Role {
        self.federation.role()
    }

    pub fn federation(&self) -> &Federation {
        &self.federation
    }

    pub fn routers(&self) -> Vec<RouterInfo> {
        self.federation.routers()
    }

    pub fn transfers(&self) -> &TransferTable {
        &self.transfers
    }

    pub fn verified(&self) -> &VerifiedStore {
        &self.verified
    }

    /// Register a new session with random ids.
    pub fn create_session(&self, cipher: SessionCipher) -> Result<Arc<Session>> {
        self.create_session_with(cipher, || (SessionId::random(), ClientId::random()))
    }

    /// Register a new session with ids drawn from `draw`. Nothing is
    /// registered if no unique pair turns up within `MAX_ID_ATTEMPTS`.
    pub fn create_session_with(
        &self,
        cipher: SessionCipher,
        mut draw: impl FnMut() -> (SessionId, ClientId),
    ) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let mut clients = self.clients.write();
        for _ in 0..MAX_ID_ATTEMPTS {
            let (id, client) = draw();
            if sessions.contains_key(&id) || clients.contains_key(&client) {
                continue;
            }
            let session = Arc::new(Session::new(
                id.clone(),
                client.clone(),
                cipher,
                self.config.mailbox_capacity,
            ));
            sessions.insert(id, session.clone());
            clients.insert(client, session.id());
            info!(client = %session.client_id(), "session created");
            return Ok(session);
        }
        Err(RouterError::DuplicateSession)
    }

    /// Move `session` to a fresh id with a new cipher. The old id stops
    /// resolving.
    pub fn rekey(&self, session: &Session, cipher: SessionCipher) -> Result<SessionId> {
        let mut sessions = self.sessions.write();
        let mut clients = self.clients.write();
        let old = session.id();
        let entry = sessions.get(&old).cloned().ok_or(RouterError::UnknownSession)?;
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = SessionId::random();
            if sessions.contains_key(&id) {
                continue;
            }
            sessions.remove(&old);
            sessions.insert(id.clone(), entry);
            clients.insert(session.client_id().clone(), id.clone());
            session.rekey(id.clone(), cipher);
            debug!(client = %session.client_id(), "session re-keyed");
            return Ok(id);
        }
        Err(RouterError::DuplicateSession)
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn session_by_client(&self, client: &ClientId) -> Option<Arc<Session>> {
        let id = self.clients.read().get(client).cloned()?;
        self.session(&id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn group(&self, id: &GroupId) -> Option<Arc<Group>> {
        self.groups.read().get(id).cloned()
    }

    /// Add `client` to group `id`, creating it with the configured rooms if
    /// needed. The insert happens under the `groups` lock so a concurrent
    /// `leave_group` cannot unlink the group in between.
    pub fn enter_group(&self, id: &GroupId, client: ClientId) -> Arc<Group> {
        {
            let groups = self.groups.read();
            if let Some(group) = groups.get(id) {
                group.insert_client(client);
                return group.clone();
            }
        }
        let mut groups = self.groups.write();
        let group = groups
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Group::new(id.clone(), &self.config.rooms)))
            .clone();
        group.insert_client(client);
        group
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Take `session` out of its current group, if any. Empty private
    /// groups are dropped.
    pub fn leave_group(&self, session: &Session) {
        let Some(group_id) = session.group() else {
            return;
        };
        session.clear_group();
        let Some(group) = self.group(&group_id) else {
            return;
        };
        group.remove_client(session.client_id(), &session.name());
        if group.is_empty() && !group.is_public() {
            let mut groups = self.groups.write();
            if groups.get(&group_id).is_some_and(|g| g.is_empty()) {
                groups.remove(&group_id);
                debug!(group = %group_id, "group removed");
            }
        }
    }

    /// Queue `delivery` for `session`, waking the tunnel pusher if the
    /// session has a tunnel open.
    pub fn deliver(&self, session: &Session, delivery: Delivery) {
        session.deliver(delivery);
        if session.is_tunneled() {
            self.wake(session.client_id());
        }
    }

    /// Ask a worker to push `client`'s mailbox over its tunnel.
    pub fn wake(&self, client: &ClientId) {
        let _ = self.wake_tx.send(client.clone());
    }

    /// Client ids whose tunnel has something to push.
    pub fn wakeups(&self) -> &Receiver<ClientId> {
        &self.wake_rx
    }

    /// Destroy a session and everything it holds in the registries.
    pub fn teardown(&self, session: &Session) {
        self.leave_group(session);
        let mut sessions = self.sessions.write();
        let mut clients = self.clients.write();
        sessions.remove(&session.id());
        clients.remove(session.client_id());
        info!(client = %session.client_id(), "session closed");
    }

    /// Periodic maintenance: idle sessions, expired message ids and
    /// transfer indices, idle transfers.
    pub fn sweep(&self, now: Instant) {
        let timeouts = &self.config.timeouts;

        let idle: Vec<Arc<Session>> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.idle_for(now) >= timeouts.session())
            .cloned()
            .collect();
        for session in idle {
            debug!(client = %session.client_id(), "session idle");
            self.teardown(&session);
        }

        let groups: Vec<Arc<Group>> = self.groups.read().values().cloned().collect();
        for group in groups {
            group.expire(now, timeouts.message());
        }

        let removed = self.transfers.expire(now, timeouts.transfer());
        if removed > 0 {
            debug!(removed, "idle transfers removed");
        }
    }
}

/// Names that may be claimed only with the matching key.
pub struct VerifiedStore {
    keys: RwLock<HashMap<String, String>>,
}

impl VerifiedStore {
    pub fn new(keys: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            keys: RwLock::new(keys.into_iter().collect()),
        }
    }

    pub fn insert(&self, name: String, key: String) {
        self.keys.write().insert(name, key);
    }

    pub fn verify(&self, name: &str, key: &str) -> bool {
        self.keys.read().get(name).is_some_and(|k| k == key)
    }
}
