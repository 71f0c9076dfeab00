// Transfer relay with chunk flow control.
//
// The router never stores a whole file. A producer polls with `Upload`,
// the router answers with the next chunk index it wants; consumers poll
// with `Download`, declaring the chunks they still need, and collect
// whatever has been buffered since their last poll.
//
// Per transfer:
// - `pending`:  chunk indices the router is asking the producer for, in
//               round-robin order, no duplicates. A set mirrors the queue
//               so membership checks stay constant time.
// - `buffered`: chunks received but not yet handed to a consumer, never
//               more than the router's buffer limit.
// - `running`:  cleared by a consumer's `Remove`; a stopped transfer answers
//               everything with `Stopped` and buffers nothing.
//
// A full buffer is soft backpressure: the producer is told there is nothing
// to send right now, not that anything failed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use shade_protocol::{Chunk, ChunkIndex, TransferId};

/// Answer to a producer poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Next(Option<ChunkIndex>),
    Stopped,
}

/// Answer to a consumer poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    Chunks(Vec<Chunk>),
    Stopped,
}

pub struct Transfer {
    id: TransferId,
    state: Mutex<TransferState>,
}

/// Round-robin queue of requested chunk indices without duplicates.
#[derive(Debug, Default)]
struct PendingQueue {
    order: VecDeque<ChunkIndex>,
    members: HashSet<ChunkIndex>,
}

impl PendingQueue {
    #[allow(dead_code)]
    fn contains(&self, index: &ChunkIndex) -> bool {
        self.members.contains(index)
    }

    fn push_back(&mut self, index: ChunkIndex) {
        if self.members.insert(index) {
            self.order.push_back(index);
        }
    }

    fn remove(&mut self, index: &ChunkIndex) -> bool {
        if !self.members.remove(index) {
            return false;
        }
        if let Some(pos) = self.order.iter().position(|i| i == index) {
            self.order.remove(pos);
        }
        true
    }

    /// Move the front index to the back and return it.
    fn rotate(&mut self) -> Option<ChunkIndex> {
        let next = self.order.pop_front()?;
        self.order.push_back(next);
        Some(next)
    }

    fn retain(&mut self, keep: impl Fn(&ChunkIndex) -> bool) {
        self.order.retain(|i| keep(i));
        self.members.retain(|i| keep(i));
    }

    fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    fn iter(&self) -> impl Iterator<Item = &ChunkIndex> {
        self.order.iter()
    }
}

impl FromIterator<ChunkIndex> for PendingQueue {
    fn from_iter<I: IntoIterator<Item = ChunkIndex>>(iter: I) -> Self {
        let mut queue = PendingQueue::default();
        for index in iter {
            queue.push_back(index);
        }
        queue
    }
}

#[derive(Debug)]
struct TransferState {
    pending: PendingQueue,
    buffered: BTreeMap<ChunkIndex, Vec<u8>>,
    running: bool,
    last_touch: Instant,
}

impl Transfer {
    fn new(id: TransferId, pending: PendingQueue) -> Self {
        Self {
            id,
            state: Mutex::new(TransferState {
                pending,
                buffered: BTreeMap::new(),
                running: true,
                last_touch: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> &TransferId {
        &self.id
    }

    /// Handle a producer poll, storing `chunk` if it was asked for.
    pub fn upload(&self, chunk: Option<Chunk>, limit: usize) -> UploadOutcome {
        let mut state = self.state.lock();
        if !state.running {
            return UploadOutcome::Stopped;
        }

        if let Some(chunk) = chunk {
            if state.buffered.len() < limit && state.pending.remove(&chunk.index) {
                state.buffered.insert(chunk.index, chunk.data);
                state.last_touch = Instant::now();
            } else {
                tracing::debug!(transfer = %self.id, index = chunk.index.0, "chunk discarded");
            }
        }

        if state.buffered.len() >= limit {
            return UploadOutcome::Next(None);
        }
        UploadOutcome::Next(state.pending.rotate())
    }

    /// Reconcile the consumer's needed set and hand over buffered chunks.
    pub fn download(&self, needed: &BTreeSet<ChunkIndex>) -> DownloadOutcome {
        let mut state = self.state.lock();
        if !state.running {
            return DownloadOutcome::Stopped;
        }

        state.pending.retain(|i| needed.contains(i));
        state.buffered.retain(|i, _| needed.contains(i));
        for index in needed {
            if !state.buffered.contains_key(index) {
                state.pending.push_back(*index);
            }
        }

        if state.buffered.is_empty() {
            return DownloadOutcome::Chunks(Vec::new());
        }
        let chunks = std::mem::take(&mut state.buffered)
            .into_iter()
            .map(|(index, data)| Chunk { index, data })
            .collect();
        state.last_touch = Instant::now();
        DownloadOutcome::Chunks(chunks)
    }

    /// Cancel the transfer.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.pending.clear();
        state.buffered.clear();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn pending(&self) -> Vec<ChunkIndex> {
        self.state.lock().pending.iter().copied().collect()
    }

    pub fn buffered_len(&self) -> usize {
        self.state.lock().buffered.len()
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.lock().last_touch)
    }
}

/// All transfers known to the router, keyed by id.
#[derive(Default)]
pub struct TransferTable {
    transfers: Mutex<HashMap<TransferId, Arc<Transfer>>>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the transfer a producer is polling. A fresh transfer
    /// starts by asking for chunk 0.
    pub fn for_upload(&self, id: &TransferId) -> Arc<Transfer> {
        self.get_or_insert(id, || PendingQueue::from_iter([ChunkIndex(0)]))
    }

    /// Get or create the transfer a consumer is polling. A fresh transfer
    /// starts empty; the needed set fills `pending`.
    pub fn for_download(&self, id: &TransferId) -> Arc<Transfer> {
        self.get_or_insert(id, PendingQueue::default)
    }

    pub fn get(&self, id: &TransferId) -> Option<Arc<Transfer>> {
        self.transfers.lock().get(id).cloned()
    }

    fn get_or_insert(
        &self,
        id: &TransferId,
        pending: impl FnOnce() -> PendingQueue,
    ) -> Arc<Transfer> {
        self.transfers
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Transfer::new(id.clone(), pending())))
            .clone()
    }

    /// Remove transfers idle for at least `ttl`. Returns how many went.
    pub fn expire(&self, now: Instant, ttl: Duration) -> usize {
        let mut transfers = self.transfers.lock();
        let before = transfers.len();
        transfers.retain(|_, t| t.idle_for(now) < ttl);
        before - transfers.len()
    }

    pub fn len(&self) -> usize {
        self.transfers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.lock().is_empty()
    }
}
