//! Incremental thread assembly.
//!
//! New envelopes are placed against an overlay of the repository: every
//! message or thread touched while placing a batch is loaded once, changed
//! in the overlay, and written back as a single commit.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::error::{StorageError, ThreadingAnomaly};
use super::parser::clean_subject;
use super::store::{ForestDelta, Relink, Repository, Store, StoreOp};
use super::types::{Envelope, StoredMessage, Thread, ThreadId, ThreadStatus};

/// What one assembly run changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssemblyOutcome {
    pub inserted: usize,
    /// Envelopes skipped because their identity was already threaded.
    pub duplicates: usize,
    pub new_threads: usize,
    /// Stored threads retired by a merge.
    pub merges: usize,
    /// Messages relinked under a newly arrived, nearer parent.
    pub adopted: usize,
    pub anomalies: Vec<(String, ThreadingAnomaly)>,
}

impl AssemblyOutcome {
    pub fn absorb(&mut self, other: AssemblyOutcome) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.new_threads += other.new_threads;
        self.merges += other.merges;
        self.adopted += other.adopted;
        self.anomalies.extend(other.anomalies);
    }
}

/// Thread a batch and commit it, holding the store's assembly lock.
///
/// The batch is placed in the order given; callers wanting deterministic
/// results across sources sort it by sent time first.
pub fn assemble<R: Repository>(
    store: &Store<R>,
    batch: Vec<Envelope>,
) -> Result<AssemblyOutcome, StorageError> {
    let _guard = store.lock_assembly();
    assemble_locked(store.repository(), batch)
}

/// Same as [`assemble`] for callers already holding the assembly lock.
pub(crate) fn assemble_locked<R: Repository>(
    repo: &R,
    batch: Vec<Envelope>,
) -> Result<AssemblyOutcome, StorageError> {
    let mut assembler = Assembler::new(repo);
    for envelope in batch {
        assembler.place(envelope)?;
    }

    let (ops, outcome) = assembler.finish();
    repo.commit(ops)?;
    Ok(outcome)
}

struct Assembler<'r, R> {
    repo: &'r R,
    nodes: HashMap<String, StoredMessage>,
    missing: HashSet<String>,
    threads: HashMap<ThreadId, Thread>,
    /// Threads allocated by this batch.
    created: BTreeSet<ThreadId>,
    /// Merged-away thread -> thread it was folded into.
    redirects: HashMap<ThreadId, ThreadId>,
    /// Stored threads retired by a merge, in merge order.
    retired: Vec<ThreadId>,
    touched: BTreeSet<ThreadId>,
    /// Identities inserted by this batch, in placement order.
    fresh: Vec<String>,
    fresh_set: HashSet<String>,
    /// Declared parent -> fresh messages declaring it.
    fresh_declared: HashMap<String, Vec<String>>,
    relinked: Vec<Relink>,
    flagged: Vec<(String, ThreadingAnomaly)>,
    outcome: AssemblyOutcome,
}

impl<'r, R: Repository> Assembler<'r, R> {
    fn new(repo: &'r R) -> Self {
        Self {
            repo,
            nodes: HashMap::new(),
            missing: HashSet::new(),
            threads: HashMap::new(),
            created: BTreeSet::new(),
            redirects: HashMap::new(),
            retired: Vec::new(),
            touched: BTreeSet::new(),
            fresh: Vec::new(),
            fresh_set: HashSet::new(),
            fresh_declared: HashMap::new(),
            relinked: Vec::new(),
            flagged: Vec::new(),
            outcome: AssemblyOutcome::default(),
        }
    }

    fn node(&mut self, identity: &str) -> Result<Option<&StoredMessage>, StorageError> {
        if !self.nodes.contains_key(identity) {
            if self.missing.contains(identity) {
                return Ok(None);
            }
            match self.repo.find_by_identity(identity)? {
                Some(msg) => {
                    self.nodes.insert(identity.to_string(), msg);
                }
                None => {
                    self.missing.insert(identity.to_string());
                    return Ok(None);
                }
            }
        }
        Ok(self.nodes.get(identity))
    }

    fn resolve(&self, mut id: ThreadId) -> ThreadId {
        while let Some(&next) = self.redirects.get(&id) {
            id = next;
        }
        id
    }

    fn thread_of(&mut self, identity: &str) -> Result<ThreadId, StorageError> {
        let id = self
            .node(identity)?
            .map(|msg| msg.thread)
            .ok_or_else(|| StorageError::UnknownMessage(identity.to_string()))?;
        Ok(self.resolve(id))
    }

    /// Load a thread into the overlay and mark it for writing.
    fn thread_mut(&mut self, id: ThreadId) -> Result<&mut Thread, StorageError> {
        let mut id = self.resolve(id);
        if !self.threads.contains_key(&id) {
            let thread = self
                .repo
                .find_thread(id)?
                .ok_or(StorageError::UnknownThread(id))?;
            if thread.id != id {
                self.redirects.insert(id, thread.id);
                id = thread.id;
            }
            self.threads.entry(id).or_insert(thread);
        }

        self.touched.insert(id);
        self.threads
            .get_mut(&id)
            .ok_or(StorageError::UnknownThread(id))
    }

    fn parent_of(&mut self, identity: &str) -> Result<Option<String>, StorageError> {
        Ok(self.node(identity)?.and_then(|msg| msg.parent.clone()))
    }

    /// Whether `candidate` is `of` or one of its ancestors.
    fn is_ancestor(&mut self, candidate: &str, of: &str) -> Result<bool, StorageError> {
        let mut visited = HashSet::new();
        let mut current = Some(of.to_string());
        while let Some(identity) = current {
            if identity == candidate {
                return Ok(true);
            }
            current = self.parent_of(&identity)?;
            if !visited.insert(identity) {
                break;
            }
        }
        Ok(false)
    }

    /// Structural root above `identity`.
    fn top(&mut self, identity: &str) -> Result<String, StorageError> {
        let mut visited = HashSet::new();
        let mut current = identity.to_string();
        while let Some(parent) = self.parent_of(&current)? {
            if !visited.insert(current.clone()) {
                break;
            }
            current = parent;
        }
        Ok(current)
    }

    fn flag(&mut self, identity: &str, anomaly: ThreadingAnomaly) -> Result<(), StorageError> {
        warn!(identity = %identity, %anomaly, "threading anomaly");
        self.outcome
            .anomalies
            .push((identity.to_string(), anomaly.clone()));

        if self.fresh_set.contains(identity) {
            if let Some(msg) = self.nodes.get_mut(identity) {
                msg.anomalies.push(anomaly);
            }
        } else {
            let thread = self.thread_of(identity)?;
            self.thread_mut(thread)?;
            self.flagged.push((identity.to_string(), anomaly));
        }
        Ok(())
    }

    fn place(&mut self, envelope: Envelope) -> Result<(), StorageError> {
        let identity = envelope.identity.clone();
        if self.node(&identity)?.is_some() {
            debug!(identity = %identity, "already threaded");
            self.outcome.duplicates += 1;
            return Ok(());
        }

        let mut anomalies = Vec::new();
        let in_reply_to = envelope.in_reply_to.clone();
        let references: Vec<String> = envelope
            .references
            .iter()
            .filter(|r| **r != identity)
            .cloned()
            .collect();
        if in_reply_to.as_deref() == Some(identity.as_str())
            || references.len() != envelope.references.len()
        {
            anomalies.push(ThreadingAnomaly::SelfReference);
        }
        let in_reply_to = in_reply_to.filter(|p| *p != identity);

        if let (Some(irt), Some(tail)) = (&in_reply_to, references.last()) {
            if irt != tail {
                anomalies.push(ThreadingAnomaly::ParentDisagreement {
                    in_reply_to: irt.clone(),
                    references_tail: tail.clone(),
                });
            }
        }

        // In-Reply-To first, then References newest to oldest.
        let mut parent = None;
        for candidate in in_reply_to.iter().chain(references.iter().rev()) {
            if self.node(candidate)?.is_some() {
                parent = Some(candidate.clone());
                break;
            }
        }

        let thread = match &parent {
            Some(parent) => {
                let id = self.thread_of(parent)?;
                let thread = self.thread_mut(id)?;
                thread.updated_at = thread.updated_at.max(envelope.sent_at);
                thread.is_patch_series |= envelope.is_patch;
                thread.id
            }
            None => {
                let id = self.repo.allocate_thread_id()?;
                self.threads.insert(
                    id,
                    Thread {
                        id,
                        root: identity.clone(),
                        subject: clean_subject(&envelope.subject),
                        is_patch_series: envelope.is_patch,
                        status: ThreadStatus::Open,
                        created_at: envelope.sent_at,
                        updated_at: envelope.sent_at,
                    },
                );
                self.created.insert(id);
                self.touched.insert(id);
                self.outcome.new_threads += 1;
                id
            }
        };

        debug!(identity = %identity, parent = ?parent, thread = %thread, "placed");

        let msg = StoredMessage {
            envelope,
            thread,
            parent,
            anomalies: Vec::new(),
        };
        for declared in msg.declared_parents() {
            self.fresh_declared
                .entry(declared.to_string())
                .or_default()
                .push(identity.clone());
        }
        self.nodes.insert(identity.clone(), msg);
        self.missing.remove(&identity);
        self.fresh.push(identity.clone());
        self.fresh_set.insert(identity.clone());
        self.outcome.inserted += 1;

        for anomaly in anomalies {
            self.flag(&identity, anomaly)?;
        }

        self.adopt_children(&identity)
    }

    /// Relink every message naming `identity` as a nearer parent than the
    /// one it hangs under, including thread roots waiting for it.
    fn adopt_children(&mut self, identity: &str) -> Result<(), StorageError> {
        let mut candidates = Vec::new();
        for stored in self.repo.messages_declaring(identity)? {
            let key = stored.envelope.identity.clone();
            self.nodes.entry(key.clone()).or_insert(stored);
            candidates.push(key);
        }
        if let Some(fresh) = self.fresh_declared.get(identity) {
            candidates.extend(fresh.iter().cloned());
        }

        let mut children: Vec<(DateTime<Utc>, String)> = candidates
            .into_iter()
            .filter(|id| id != identity)
            .filter_map(|id| {
                let msg = self.nodes.get(&id)?;
                prefers(msg, identity).then(|| (msg.envelope.sent_at, id))
            })
            .collect();
        children.sort();
        children.dedup();

        for (_, child) in children {
            self.adopt(&child, identity)?;
        }
        Ok(())
    }

    /// Move `child` under `parent`, merging their threads when they differ.
    fn adopt(&mut self, child: &str, parent: &str) -> Result<(), StorageError> {
        if self.is_ancestor(child, parent)? {
            return self.flag(
                child,
                ThreadingAnomaly::CycleRejected {
                    parent: parent.to_string(),
                },
            );
        }

        let theirs = self.thread_of(child)?;
        let ours = self.thread_of(parent)?;
        if theirs != ours {
            if let Some(previous) = self.parent_of(child)? {
                // moving a branch out would split its thread: a parentless
                // newcomer is spliced in where the branch hung instead
                if self.parent_of(parent)?.is_some() || self.is_ancestor(parent, &previous)? {
                    debug!(child = %child, parent = %parent, "branch kept in its thread");
                    return Ok(());
                }
                self.relink(parent, &previous);
            }
        }

        self.relink(child, parent);
        debug!(child = %child, parent = %parent, "relinked under nearer parent");
        self.outcome.adopted += 1;

        if theirs == ours {
            self.thread_mut(ours)?;
        } else {
            self.merge(theirs, ours, parent)?;
        }
        Ok(())
    }

    fn relink(&mut self, identity: &str, parent: &str) {
        if let Some(msg) = self.nodes.get_mut(identity) {
            msg.parent = Some(parent.to_string());
        }
        if !self.fresh_set.contains(identity) {
            self.relinked.push(Relink {
                identity: identity.to_string(),
                parent: parent.to_string(),
            });
        }
    }

    /// Fold two threads into the earlier-rooted one.
    fn merge(&mut self, a: ThreadId, b: ThreadId, anchor: &str) -> Result<(), StorageError> {
        let key_a = {
            let thread = self.thread_mut(a)?;
            (thread.created_at, thread.id)
        };
        let key_b = {
            let thread = self.thread_mut(b)?;
            (thread.created_at, thread.id)
        };
        let (primary, secondary) = if key_a <= key_b {
            (key_a.1, key_b.1)
        } else {
            (key_b.1, key_a.1)
        };

        let folded = self
            .threads
            .remove(&secondary)
            .ok_or(StorageError::UnknownThread(secondary))?;
        self.touched.remove(&secondary);
        self.redirects.insert(secondary, primary);
        // a thread born in this batch has no user-set status of its own
        let inherit_status = self.created.contains(&primary) && !self.created.contains(&secondary);
        if self.created.remove(&secondary) {
            self.outcome.new_threads -= 1;
        } else {
            self.retired.push(secondary);
            self.outcome.merges += 1;
        }

        let root = self.top(anchor)?;
        let subject = self
            .node(&root)?
            .map(|msg| clean_subject(&msg.envelope.subject));

        let thread = self.thread_mut(primary)?;
        thread.created_at = thread.created_at.min(folded.created_at);
        thread.updated_at = thread.updated_at.max(folded.updated_at);
        thread.is_patch_series |= folded.is_patch_series;
        if inherit_status {
            thread.status = folded.status;
        }
        if thread.root != root {
            thread.root = root;
            if let Some(subject) = subject {
                thread.subject = subject;
            }
        }

        debug!(primary = %primary, secondary = %secondary, "merged threads");
        Ok(())
    }

    fn finish(mut self) -> (Vec<StoreOp>, AssemblyOutcome) {
        let mut deltas: BTreeMap<ThreadId, ForestDelta> = BTreeMap::new();

        for identity in std::mem::take(&mut self.fresh) {
            if let Some(mut msg) = self.nodes.remove(&identity) {
                msg.thread = self.resolve(msg.thread);
                deltas.entry(msg.thread).or_default().inserted.push(msg);
            }
        }
        for relink in std::mem::take(&mut self.relinked) {
            if let Some(thread) = self.nodes.get(&relink.identity).map(|m| m.thread) {
                let thread = self.resolve(thread);
                deltas.entry(thread).or_default().relinked.push(relink);
            }
        }
        for (identity, anomaly) in std::mem::take(&mut self.flagged) {
            if let Some(thread) = self.nodes.get(&identity).map(|m| m.thread) {
                let thread = self.resolve(thread);
                deltas.entry(thread).or_default().flagged.push((identity, anomaly));
            }
        }

        let mut ops = Vec::new();
        for id in &self.touched {
            if let Some(thread) = self.threads.remove(id) {
                ops.push(StoreOp::SaveThread {
                    thread,
                    delta: deltas.remove(id).unwrap_or_default(),
                });
            }
        }
        for secondary in &self.retired {
            ops.push(StoreOp::MergeThreads {
                primary: self.resolve(*secondary),
                secondary: *secondary,
            });
        }

        (ops, self.outcome)
    }
}

/// Whether `msg` declares `candidate` ahead of its current parent.
fn prefers(msg: &StoredMessage, candidate: &str) -> bool {
    let Some(rank) = msg.parent_rank(candidate) else {
        return false;
    };
    match msg.parent.as_deref() {
        None => true,
        Some(current) if current == candidate => false,
        Some(current) => msg.parent_rank(current).is_none_or(|r| rank < r),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::*;
    use crate::mail::store::MemoryRepository;
    use crate::mail::types::Sender;

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn envelope(id: &str, minutes: i64, irt: Option<&str>, refs: &[&str]) -> Envelope {
        Envelope {
            identity: id.to_string(),
            synthetic_identity: false,
            in_reply_to: irt.map(str::to_string),
            references: refs.iter().map(|r| r.to_string()).collect(),
            subject: format!("Re: topic {id}"),
            sender: Sender {
                name: "Ann".into(),
                address: "ann@example.com".into(),
            },
            sent_at: at(minutes),
            date_fallback: false,
            body: String::new(),
            is_patch: false,
            patch: None,
            source_id: "test".into(),
        }
    }

    fn parent(store: &Store, id: &str) -> Option<String> {
        store
            .repository()
            .find_by_identity(id)
            .unwrap()
            .unwrap()
            .parent
    }

    fn thread(store: &Store, id: &str) -> ThreadId {
        store
            .repository()
            .find_by_identity(id)
            .unwrap()
            .unwrap()
            .thread
    }

    #[test]
    fn reply_attaches_to_in_reply_to() {
        let store = Store::new(MemoryRepository::new());
        let outcome = assemble(
            &store,
            vec![
                envelope("a", 0, None, &[]),
                envelope("b", 1, Some("a"), &["a"]),
                envelope("c", 2, Some("a"), &["a"]),
            ],
        )
        .unwrap();

        assert_eq!(outcome.inserted, 3);
        assert_eq!(outcome.new_threads, 1);
        assert_eq!(parent(&store, "b").as_deref(), Some("a"));
        assert_eq!(parent(&store, "c").as_deref(), Some("a"));

        let t = store.repository().find_thread(thread(&store, "a")).unwrap().unwrap();
        assert_eq!(t.root, "a");
        assert_eq!(t.subject, "topic a");
        assert_eq!(t.updated_at, at(2));
    }

    #[test]
    fn unknown_in_reply_to_falls_back_to_newest_known_reference() {
        let store = Store::new(MemoryRepository::new());
        assemble(
            &store,
            vec![envelope("a", 0, None, &[]), envelope("b", 1, Some("a"), &["a"])],
        )
        .unwrap();

        let outcome = assemble(
            &store,
            vec![envelope("d", 5, Some("missing"), &["a", "b", "missing"])],
        )
        .unwrap();

        assert_eq!(parent(&store, "d").as_deref(), Some("b"));
        assert_eq!(thread(&store, "d"), thread(&store, "a"));
        assert_eq!(outcome.new_threads, 0);
    }

    #[test]
    fn unknown_parent_starts_a_stub_thread() {
        let store = Store::new(MemoryRepository::new());
        assemble(&store, vec![envelope("x", 0, Some("gone"), &["gone"])]).unwrap();

        assert_eq!(parent(&store, "x"), None);
        let t = store.repository().find_thread(thread(&store, "x")).unwrap().unwrap();
        assert_eq!(t.root, "x");
    }

    #[test]
    fn reassembly_is_a_no_op() {
        let store = Store::new(MemoryRepository::new());
        let batch = vec![envelope("a", 0, None, &[]), envelope("b", 1, Some("a"), &["a"])];
        assemble(&store, batch.clone()).unwrap();
        let before = store.repository().list_threads().unwrap();

        let outcome = assemble(&store, batch).unwrap();
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.duplicates, 2);
        assert_eq!(store.repository().list_threads().unwrap(), before);
    }

    #[test]
    fn self_reference_is_flagged_and_ignored() {
        let store = Store::new(MemoryRepository::new());
        let outcome = assemble(&store, vec![envelope("s", 0, Some("s"), &["s"])]).unwrap();

        assert_eq!(parent(&store, "s"), None);
        assert_eq!(
            outcome.anomalies,
            vec![("s".to_string(), ThreadingAnomaly::SelfReference)]
        );
        let stored = store.repository().find_by_identity("s").unwrap().unwrap();
        assert_eq!(stored.anomalies, vec![ThreadingAnomaly::SelfReference]);
    }

    #[test]
    fn in_reply_to_wins_disagreement() {
        let store = Store::new(MemoryRepository::new());
        assemble(
            &store,
            vec![envelope("a", 0, None, &[]), envelope("b", 1, None, &[])],
        )
        .unwrap();

        let outcome = assemble(&store, vec![envelope("c", 2, Some("a"), &["b"])]).unwrap();
        assert_eq!(parent(&store, "c").as_deref(), Some("a"));
        assert_eq!(
            outcome.anomalies,
            vec![(
                "c".to_string(),
                ThreadingAnomaly::ParentDisagreement {
                    in_reply_to: "a".into(),
                    references_tail: "b".into(),
                }
            )]
        );
    }

    #[test]
    fn mutual_references_do_not_cycle() {
        let store = Store::new(MemoryRepository::new());
        let outcome = assemble(
            &store,
            vec![
                envelope("a", 0, Some("b"), &["b"]),
                envelope("b", 1, Some("a"), &["a"]),
            ],
        )
        .unwrap();

        assert_eq!(parent(&store, "a"), None);
        assert_eq!(parent(&store, "b").as_deref(), Some("a"));
        assert_eq!(thread(&store, "a"), thread(&store, "b"));
        assert_eq!(outcome.new_threads, 1);
        assert!(matches!(
            outcome.anomalies.as_slice(),
            [(id, ThreadingAnomaly::CycleRejected { parent })] if id == "a" && parent == "b"
        ));
    }

    #[test]
    fn late_parent_merges_threads_into_earliest() {
        let store = Store::new(MemoryRepository::new());
        assemble(
            &store,
            vec![
                envelope("a", 0, None, &[]),
                envelope("b", 1, Some("a"), &["a"]),
            ],
        )
        .unwrap();
        assemble(
            &store,
            vec![
                envelope("c", 10, Some("x"), &["a", "b", "x"]),
                envelope("d", 11, Some("c"), &["a", "b", "x", "c"]),
            ],
        )
        .unwrap();
        // c resolved through its references, so a second thread needs an
        // orphan that names nothing known
        assemble(&store, vec![envelope("e", 12, Some("y"), &["y"])]).unwrap();
        let stray = thread(&store, "e");
        assert_ne!(stray, thread(&store, "a"));

        let outcome = assemble(&store, vec![envelope("y", 3, Some("b"), &["a", "b"])]).unwrap();

        assert_eq!(outcome.merges, 1);
        assert_eq!(outcome.adopted, 1);
        assert_eq!(parent(&store, "e").as_deref(), Some("y"));
        let survivor = thread(&store, "a");
        for id in ["b", "c", "d", "e", "y"] {
            assert_eq!(thread(&store, id), survivor, "{id}");
        }
        assert_eq!(store.repository().find_thread(stray).unwrap().unwrap().id, survivor);
        assert_eq!(store.repository().list_threads().unwrap().len(), 1);
    }

    #[test]
    fn late_in_reply_to_target_takes_over_from_reference() {
        let store = Store::new(MemoryRepository::new());
        assemble(
            &store,
            vec![
                envelope("a", 0, None, &[]),
                envelope("b", 1, Some("a"), &["a"]),
                envelope("d", 5, Some("lost"), &["a", "b", "lost"]),
            ],
        )
        .unwrap();
        assert_eq!(parent(&store, "d").as_deref(), Some("b"));

        let outcome = assemble(&store, vec![envelope("lost", 3, Some("b"), &["a", "b"])]).unwrap();

        assert_eq!(parent(&store, "d").as_deref(), Some("lost"));
        assert_eq!(parent(&store, "lost").as_deref(), Some("b"));
        assert_eq!(outcome.adopted, 1);
        assert_eq!(outcome.merges, 0);
        assert_eq!(thread(&store, "lost"), thread(&store, "a"));
    }

    #[test]
    fn headerless_parent_is_spliced_into_the_branch() {
        let store = Store::new(MemoryRepository::new());
        assemble(
            &store,
            vec![
                envelope("a", 0, None, &[]),
                envelope("b", 1, Some("a"), &["a"]),
                envelope("d", 5, Some("lost"), &["a", "b", "lost"]),
            ],
        )
        .unwrap();

        let outcome = assemble(&store, vec![envelope("lost", 3, None, &[])]).unwrap();

        assert_eq!(parent(&store, "lost").as_deref(), Some("b"));
        assert_eq!(parent(&store, "d").as_deref(), Some("lost"));
        assert_eq!(outcome.new_threads, 0);
        assert_eq!(outcome.merges, 0);
        let threads = store.repository().list_threads().unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].thread.root, "a");
        assert_eq!(threads[0].message_count, 4);
    }

    #[test]
    fn nearer_parent_below_the_child_is_rejected() {
        let store = Store::new(MemoryRepository::new());
        assemble(
            &store,
            vec![
                envelope("a", 0, None, &[]),
                envelope("c", 2, Some("x"), &["a", "x"]),
            ],
        )
        .unwrap();

        // x claims to answer c, c claims to answer x
        let outcome = assemble(&store, vec![envelope("x", 3, Some("c"), &["a", "c"])]).unwrap();

        assert_eq!(parent(&store, "x").as_deref(), Some("c"));
        assert_eq!(parent(&store, "c").as_deref(), Some("a"));
        assert!(matches!(
            outcome.anomalies.as_slice(),
            [(id, ThreadingAnomaly::CycleRejected { parent })] if id == "c" && parent == "x"
        ));
    }

    #[test]
    fn arriving_root_adopts_existing_stub_and_keeps_status() {
        let store = Store::new(MemoryRepository::new());
        assemble(&store, vec![envelope("reply", 5, Some("root"), &["root"])]).unwrap();
        let stub = thread(&store, "reply");
        store
            .repository()
            .update_thread_status(stub, ThreadStatus::Closed)
            .unwrap();

        let mut root = envelope("root", 0, None, &[]);
        root.subject = "[PATCH] frob".into();
        root.is_patch = true;
        assemble(&store, vec![root]).unwrap();

        assert_eq!(parent(&store, "reply").as_deref(), Some("root"));
        let t = store
            .repository()
            .find_thread(thread(&store, "root"))
            .unwrap()
            .unwrap();
        assert_eq!(t.root, "root");
        assert_eq!(t.subject, "frob");
        assert_eq!(t.created_at, at(0));
        assert!(t.is_patch_series);
        assert_eq!(t.status, ThreadStatus::Closed);
        assert_eq!(store.repository().list_threads().unwrap().len(), 1);
        assert_eq!(store.repository().find_thread(stub).unwrap().unwrap().id, t.id);
    }
}
