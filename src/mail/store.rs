//! Repository contract and the in-memory repository.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cache::{load_snapshot, save_snapshot};
use super::error::{StorageError, ThreadingAnomaly};
use super::types::{StoredMessage, Thread, ThreadId, ThreadStatus, ThreadSummary};

/// Parent change for a message that is already stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Relink {
    pub identity: String,
    pub parent: String,
}

/// Changes to the forest of one thread.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForestDelta {
    pub inserted: Vec<StoredMessage>,
    pub relinked: Vec<Relink>,
    /// Anomalies to record on messages that are already stored.
    pub flagged: Vec<(String, ThreadingAnomaly)>,
}

impl ForestDelta {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.relinked.is_empty() && self.flagged.is_empty()
    }
}

/// One write in a commit.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Move every member of `secondary` into `primary` and retire `secondary`.
    MergeThreads {
        primary: ThreadId,
        secondary: ThreadId,
    },
    /// Upsert the thread record and apply the delta to its forest.
    SaveThread { thread: Thread, delta: ForestDelta },
}

/// Storage consumed by the threading engine.
///
/// `commit` applies a list of operations all-or-nothing; the single
/// operation helpers are thin wrappers over it.
pub trait Repository: Send + Sync {
    fn find_by_identity(&self, identity: &str) -> Result<Option<StoredMessage>, StorageError>;

    fn known_identities(&self) -> Result<HashSet<String>, StorageError>;

    /// Messages naming `identity` in In-Reply-To or References.
    fn messages_declaring(&self, identity: &str) -> Result<Vec<StoredMessage>, StorageError>;

    /// Retired ids resolve to the thread they were merged into.
    fn find_thread(&self, id: ThreadId) -> Result<Option<Thread>, StorageError>;

    fn thread_messages(&self, id: ThreadId) -> Result<Vec<StoredMessage>, StorageError>;

    fn list_threads(&self) -> Result<Vec<ThreadSummary>, StorageError>;

    fn allocate_thread_id(&self) -> Result<ThreadId, StorageError>;

    fn commit(&self, ops: Vec<StoreOp>) -> Result<(), StorageError>;

    fn update_thread_status(&self, id: ThreadId, status: ThreadStatus)
    -> Result<(), StorageError>;

    fn save_thread(&self, thread: Thread, delta: ForestDelta) -> Result<(), StorageError> {
        self.commit(vec![StoreOp::SaveThread { thread, delta }])
    }

    fn merge_threads(&self, primary: ThreadId, secondary: ThreadId) -> Result<(), StorageError> {
        self.commit(vec![StoreOp::MergeThreads { primary, secondary }])
    }
}

/// Explicit store handle shared by every component.
///
/// Reads go straight to the repository; assembly takes the store-wide
/// lock so only one forest mutation is in flight at a time.
pub struct Store<R = MemoryRepository> {
    repo: R,
    assembly: Mutex<()>,
}

impl<R: Repository> Store<R> {
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            assembly: Mutex::new(()),
        }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub(crate) fn lock_assembly(&self) -> MutexGuard<'_, ()> {
        self.assembly.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryState {
    messages: HashMap<String, StoredMessage>,
    threads: BTreeMap<ThreadId, Thread>,
    members: BTreeMap<ThreadId, BTreeSet<String>>,
    /// Declared parent identity -> messages declaring it.
    declared: HashMap<String, BTreeSet<String>>,
    retired: HashMap<ThreadId, ThreadId>,
    next_thread: u64,
}

impl RepositoryState {
    fn resolve(&self, mut id: ThreadId) -> ThreadId {
        // chains are short, the bound only guards a corrupt snapshot
        for _ in 0..=self.retired.len() {
            match self.retired.get(&id) {
                Some(&next) => id = next,
                None => break,
            }
        }
        id
    }

    fn apply(&mut self, op: StoreOp) -> Result<(), StorageError> {
        match op {
            StoreOp::MergeThreads { primary, secondary } => {
                let primary = self.resolve(primary);
                let secondary = self.resolve(secondary);
                if primary == secondary {
                    return Ok(());
                }
                if !self.threads.contains_key(&primary) {
                    return Err(StorageError::UnknownThread(primary));
                }
                if self.threads.remove(&secondary).is_none() {
                    return Err(StorageError::UnknownThread(secondary));
                }

                let moved = self.members.remove(&secondary).unwrap_or_default();
                for identity in &moved {
                    if let Some(msg) = self.messages.get_mut(identity) {
                        msg.thread = primary;
                    }
                }
                self.members.entry(primary).or_default().extend(moved);
                self.retired.insert(secondary, primary);
            }
            StoreOp::SaveThread { mut thread, delta } => {
                let id = thread.id;
                // status belongs to the user, assembly never changes it
                if let Some(existing) = self.threads.get(&id) {
                    thread.status = existing.status;
                }
                self.next_thread = self.next_thread.max(id.0 + 1);
                self.threads.insert(id, thread);

                for mut msg in delta.inserted {
                    let identity = msg.envelope.identity.clone();
                    if self.messages.contains_key(&identity) {
                        return Err(StorageError::Duplicate(identity));
                    }
                    msg.thread = id;
                    for declared in msg.declared_parents() {
                        self.declared
                            .entry(declared.to_string())
                            .or_default()
                            .insert(identity.clone());
                    }
                    self.members.entry(id).or_default().insert(identity.clone());
                    self.messages.insert(identity, msg);
                }

                for relink in delta.relinked {
                    let msg = self
                        .messages
                        .get_mut(&relink.identity)
                        .ok_or_else(|| StorageError::UnknownMessage(relink.identity.clone()))?;
                    msg.parent = Some(relink.parent);
                }

                for (identity, anomaly) in delta.flagged {
                    let msg = self
                        .messages
                        .get_mut(&identity)
                        .ok_or(StorageError::UnknownMessage(identity))?;
                    msg.anomalies.push(anomaly);
                }
            }
        }
        Ok(())
    }
}

/// Repository kept in memory, optionally snapshotted to disk on commit.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: RwLock<RepositoryState>,
    snapshot: Option<PathBuf>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a repository backed by a snapshot file, starting empty if the
    /// snapshot is missing or unusable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load_snapshot(&path).unwrap_or_default();
        Self {
            state: RwLock::new(state),
            snapshot: Some(path),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RepositoryState>, StorageError> {
        self.state.read().map_err(|_| StorageError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RepositoryState>, StorageError> {
        self.state.write().map_err(|_| StorageError::Poisoned)
    }

    fn persist(&self, state: &RepositoryState) -> Result<(), StorageError> {
        match &self.snapshot {
            Some(path) => save_snapshot(path, state),
            None => Ok(()),
        }
    }
}

impl Repository for MemoryRepository {
    fn find_by_identity(&self, identity: &str) -> Result<Option<StoredMessage>, StorageError> {
        Ok(self.read()?.messages.get(identity).cloned())
    }

    fn known_identities(&self) -> Result<HashSet<String>, StorageError> {
        Ok(self.read()?.messages.keys().cloned().collect())
    }

    fn messages_declaring(&self, identity: &str) -> Result<Vec<StoredMessage>, StorageError> {
        let state = self.read()?;
        Ok(state
            .declared
            .get(identity)
            .into_iter()
            .flatten()
            .filter_map(|id| state.messages.get(id))
            .cloned()
            .collect())
    }

    fn find_thread(&self, id: ThreadId) -> Result<Option<Thread>, StorageError> {
        let state = self.read()?;
        Ok(state.threads.get(&state.resolve(id)).cloned())
    }

    fn thread_messages(&self, id: ThreadId) -> Result<Vec<StoredMessage>, StorageError> {
        let state = self.read()?;
        let id = state.resolve(id);
        Ok(state
            .members
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|identity| state.messages.get(identity))
            .cloned()
            .collect())
    }

    fn list_threads(&self) -> Result<Vec<ThreadSummary>, StorageError> {
        let state = self.read()?;
        Ok(state
            .threads
            .values()
            .map(|thread| ThreadSummary {
                thread: thread.clone(),
                message_count: state.members.get(&thread.id).map_or(0, BTreeSet::len),
            })
            .collect())
    }

    fn allocate_thread_id(&self) -> Result<ThreadId, StorageError> {
        let mut state = self.write()?;
        let id = ThreadId(state.next_thread.max(1));
        state.next_thread = id.0 + 1;
        Ok(id)
    }

    fn commit(&self, ops: Vec<StoreOp>) -> Result<(), StorageError> {
        if ops.is_empty() {
            return Ok(());
        }

        // Writers are excluded for the whole commit; the live state is only
        // replaced once every op applied and the snapshot (if any) is written.
        let mut state = self.write()?;
        let mut next = state.clone();
        let count = ops.len();
        for op in ops {
            next.apply(op)?;
        }
        self.persist(&next)?;
        *state = next;

        debug!(ops = count, "committed");
        Ok(())
    }

    fn update_thread_status(
        &self,
        id: ThreadId,
        status: ThreadStatus,
    ) -> Result<(), StorageError> {
        let mut state = self.write()?;
        let resolved = state.resolve(id);
        match state.threads.get(&resolved) {
            None => return Err(StorageError::UnknownThread(id)),
            Some(thread) if thread.status == status => return Ok(()),
            Some(_) => {}
        }

        let mut next = state.clone();
        if let Some(thread) = next.threads.get_mut(&resolved) {
            thread.status = status;
        }
        self.persist(&next)?;
        *state = next;
        Ok(())
    }
}

/// Memory repository that runs a hook before every commit.
#[cfg(test)]
pub(crate) struct HookedRepository<F> {
    pub inner: MemoryRepository,
    pub before_commit: F,
}

#[cfg(test)]
impl<F> Repository for HookedRepository<F>
where
    F: Fn() -> Result<(), StorageError> + Send + Sync,
{
    fn find_by_identity(&self, identity: &str) -> Result<Option<StoredMessage>, StorageError> {
        self.inner.find_by_identity(identity)
    }

    fn known_identities(&self) -> Result<HashSet<String>, StorageError> {
        self.inner.known_identities()
    }

    fn messages_declaring(&self, identity: &str) -> Result<Vec<StoredMessage>, StorageError> {
        self.inner.messages_declaring(identity)
    }

    fn find_thread(&self, id: ThreadId) -> Result<Option<Thread>, StorageError> {
        self.inner.find_thread(id)
    }

    fn thread_messages(&self, id: ThreadId) -> Result<Vec<StoredMessage>, StorageError> {
        self.inner.thread_messages(id)
    }

    fn list_threads(&self) -> Result<Vec<ThreadSummary>, StorageError> {
        self.inner.list_threads()
    }

    fn allocate_thread_id(&self) -> Result<ThreadId, StorageError> {
        self.inner.allocate_thread_id()
    }

    fn commit(&self, ops: Vec<StoreOp>) -> Result<(), StorageError> {
        (self.before_commit)()?;
        self.inner.commit(ops)
    }

    fn update_thread_status(
        &self,
        id: ThreadId,
        status: ThreadStatus,
    ) -> Result<(), StorageError> {
        self.inner.update_thread_status(id, status)
    }
}
