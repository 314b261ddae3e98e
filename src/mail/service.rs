//! Operations exposed to the presentation layer.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{info, warn};

use super::compose::{Composer, OutboundMessage};
use super::error::{ComposeError, Result};
use super::flatten::{ShapeNode, annotate};
use super::source::Source;
use super::store::{MemoryRepository, Repository, Store};
use super::sync::{SyncCancel, SyncReport, sync};
use super::transport::{MailTransport, SendmailTransport};
use super::types::{StoredMessage, Thread, ThreadId, ThreadStatus, ThreadSummary};

/// Source id used when re-ingesting our own replies.
pub const OUTBOUND_SOURCE: &str = "outbound";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadFilter {
    pub status: Option<ThreadStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ThreadFilter {
    pub fn status(status: ThreadStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// A thread with its messages in display order and their shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadView {
    pub thread: Thread,
    /// Depth-first, same order as `forest`.
    pub messages: Vec<StoredMessage>,
    pub forest: Vec<ShapeNode>,
}

pub struct Workspace<R = MemoryRepository, T = SendmailTransport> {
    store: Store<R>,
    composer: Composer,
    transport: T,
}

impl<R: Repository, T: MailTransport> Workspace<R, T> {
    pub fn new(store: Store<R>, composer: Composer, transport: T) -> Self {
        Self {
            store,
            composer,
            transport,
        }
    }

    pub fn store(&self) -> &Store<R> {
        &self.store
    }

    /// Threads ordered by latest activity, newest first.
    pub fn list_threads(&self, filter: &ThreadFilter) -> Result<Vec<ThreadSummary>> {
        let mut threads = self.store.repository().list_threads()?;
        if let Some(status) = filter.status {
            threads.retain(|t| t.thread.status == status);
        }
        threads.sort_by(|a, b| {
            b.thread
                .updated_at
                .cmp(&a.thread.updated_at)
                .then(a.thread.id.cmp(&b.thread.id))
        });

        Ok(threads
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    pub fn get_thread(&self, id: ThreadId) -> Result<Option<ThreadView>> {
        let repo = self.store.repository();
        let Some(thread) = repo.find_thread(id)? else {
            return Ok(None);
        };

        let messages = repo.thread_messages(thread.id)?;
        let forest = annotate(&messages);

        let mut by_id: HashMap<String, StoredMessage> = messages
            .into_iter()
            .map(|msg| (msg.envelope.identity.clone(), msg))
            .collect();
        let messages = forest
            .iter()
            .filter_map(|node| by_id.remove(&node.identity))
            .collect();

        Ok(Some(ThreadView {
            thread,
            messages,
            forest,
        }))
    }

    /// Reply inside a thread, to `in_reply_to` or else the thread root.
    ///
    /// The sent message is threaded right away through the normal sync path.
    /// Once the transport accepted it the call succeeds: a failed ingest is
    /// logged and left to the next sync.
    pub fn post_comment(
        &self,
        thread: ThreadId,
        body: &str,
        in_reply_to: Option<&str>,
    ) -> Result<OutboundMessage> {
        let repo = self.store.repository();
        let thread = repo
            .find_thread(thread)?
            .ok_or(ComposeError::ThreadMissing(thread))?;

        let target_id = in_reply_to.unwrap_or(thread.root.as_str());
        let target = repo
            .find_by_identity(target_id)?
            .ok_or_else(|| ComposeError::TargetMissing(target_id.to_string()))?;
        let target_thread = repo.find_thread(target.thread)?.map(|t| t.id);
        if target_thread != Some(thread.id) {
            return Err(ComposeError::TargetOutsideThread {
                identity: target_id.to_string(),
                thread: thread.id,
            }
            .into());
        }

        let message = self.composer.compose(&target.envelope, body)?;
        self.transport.send(&message)?;

        match self.ingest(&message) {
            Ok(threaded) => info!(
                thread = %thread.id,
                identity = %message.identity,
                threaded,
                "comment posted"
            ),
            Err(err) => warn!(
                thread = %thread.id,
                identity = %message.identity,
                %err,
                "comment sent but not threaded"
            ),
        }

        Ok(message)
    }

    fn ingest(&self, message: &OutboundMessage) -> Result<usize> {
        let raw = message.to_raw()?;
        let report = sync(
            &self.store,
            &[Source::memory(OUTBOUND_SOURCE, vec![raw])],
            &SyncCancel::default(),
        )?;
        Ok(report.total_new)
    }

    pub fn run_sync(&self, sources: &[Source], cancel: &SyncCancel) -> Result<SyncReport> {
        Ok(sync(&self.store, sources, cancel)?)
    }

    pub fn set_thread_status(&self, id: ThreadId, status: ThreadStatus) -> Result<()> {
        self.store.repository().update_thread_status(id, status)?;
        info!(thread = %id, %status, "thread status changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::mail::compose::{DEFAULT_MAX_REFERENCES_LEN, SenderIdentity};
    use crate::mail::error::{Error, StorageError, TransportError};
    use crate::mail::store::HookedRepository;
    use crate::mail::types::RawMessage;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<OutboundMessage>>);

    impl MailTransport for Outbox {
        fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
            self.0.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct Refuse;

    impl MailTransport for Refuse {
        fn send(&self, _: &OutboundMessage) -> Result<(), TransportError> {
            Err(TransportError::Rejected {
                command: "refuse".into(),
                stderr: "no".into(),
            })
        }
    }

    fn composer() -> Composer {
        Composer::new(
            SenderIdentity {
                name: "Ann".into(),
                email: "ann@example.org".into(),
                domain: None,
            },
            DEFAULT_MAX_REFERENCES_LEN,
        )
    }

    fn workspace<T: MailTransport>(transport: T) -> Workspace<MemoryRepository, T> {
        Workspace::new(Store::new(MemoryRepository::new()), composer(), transport)
    }

    fn raw(id: &str, minute: u32, subject: &str, irt: Option<&str>) -> RawMessage {
        let mut text = format!(
            "From: Bob <bob@example.com>\nDate: Mon, 1 Jan 2024 10:{minute:02}:00 +0000\n\
             Subject: {subject}\nMessage-ID: <{id}>\n"
        );
        if let Some(irt) = irt {
            text.push_str(&format!("In-Reply-To: <{irt}>\nReferences: <{irt}>\n"));
        }
        text.push_str("\nbody\n");
        RawMessage::from_bytes(text.as_bytes(), id)
    }

    fn seed<R: Repository, T: MailTransport>(ws: &Workspace<R, T>) {
        let source = Source::memory(
            "list",
            vec![
                raw("a@x", 0, "first", None),
                raw("b@x", 1, "Re: first", Some("a@x")),
                raw("c@x", 5, "second", None),
            ],
        );
        ws.run_sync(&[source], &SyncCancel::default()).unwrap();
    }

    fn thread_of<R: Repository, T: MailTransport>(ws: &Workspace<R, T>, id: &str) -> ThreadId {
        ws.store()
            .repository()
            .find_by_identity(id)
            .unwrap()
            .unwrap()
            .thread
    }

    #[test]
    fn threads_are_listed_newest_first_and_filtered() {
        let ws = workspace(Outbox::default());
        seed(&ws);

        let all = ws.list_threads(&ThreadFilter::default()).unwrap();
        let subjects: Vec<_> = all.iter().map(|t| t.thread.subject.as_str()).collect();
        assert_eq!(subjects, ["second", "first"]);
        assert_eq!(all[1].message_count, 2);

        let first = thread_of(&ws, "a@x");
        ws.set_thread_status(first, ThreadStatus::Closed).unwrap();
        let closed = ws.list_threads(&ThreadFilter::status(ThreadStatus::Closed)).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].thread.id, first);

        let page = ws
            .list_threads(&ThreadFilter {
                status: None,
                limit: Some(1),
                offset: 1,
            })
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].thread.id, first);
    }

    #[test]
    fn thread_view_is_depth_first() {
        let ws = workspace(Outbox::default());
        seed(&ws);

        let view = ws.get_thread(thread_of(&ws, "a@x")).unwrap().unwrap();
        let ids: Vec<_> = view.messages.iter().map(|m| m.identity()).collect();
        assert_eq!(ids, ["a@x", "b@x"]);
        assert_eq!(view.forest[1].depth, 1);
        assert!(ws.get_thread(ThreadId(999)).unwrap().is_none());
    }

    #[test]
    fn posted_comment_threads_under_target() {
        let ws = workspace(Outbox::default());
        seed(&ws);
        let thread = thread_of(&ws, "a@x");

        let sent = ws.post_comment(thread, "looks good", Some("b@x")).unwrap();
        assert_eq!(sent.in_reply_to, "b@x");
        assert_eq!(sent.references, ["a@x", "b@x"]);
        assert_eq!(ws.transport.0.lock().unwrap().len(), 1);

        let stored = ws
            .store()
            .repository()
            .find_by_identity(&sent.identity)
            .unwrap()
            .unwrap();
        assert_eq!(stored.parent.as_deref(), Some("b@x"));
        assert_eq!(stored.thread, thread);
        assert_eq!(stored.envelope.source_id, OUTBOUND_SOURCE);

        let to_root = ws.post_comment(thread, "again", None).unwrap();
        assert_eq!(to_root.in_reply_to, "a@x");
    }

    #[test]
    fn comment_errors_are_surfaced() {
        let ws = workspace(Outbox::default());
        seed(&ws);
        let thread = thread_of(&ws, "a@x");

        assert!(matches!(
            ws.post_comment(ThreadId(999), "x", None),
            Err(Error::Compose(ComposeError::ThreadMissing(_)))
        ));
        assert!(matches!(
            ws.post_comment(thread, "x", Some("nope@x")),
            Err(Error::Compose(ComposeError::TargetMissing(_)))
        ));
        assert!(matches!(
            ws.post_comment(thread, "x", Some("c@x")),
            Err(Error::Compose(ComposeError::TargetOutsideThread { .. }))
        ));
    }

    #[test]
    fn failed_send_is_not_ingested() {
        let ws = workspace(Refuse);
        seed(&ws);
        let before = ws.store().repository().known_identities().unwrap().len();

        assert!(matches!(
            ws.post_comment(thread_of(&ws, "a@x"), "x", None),
            Err(Error::Transport(TransportError::Rejected { .. }))
        ));
        assert_eq!(ws.store().repository().known_identities().unwrap().len(), before);
    }

    #[test]
    fn sent_comment_survives_a_failed_ingest() {
        let failing = Arc::new(AtomicBool::new(false));
        let flag = failing.clone();
        let repo = HookedRepository {
            inner: MemoryRepository::new(),
            before_commit: move || {
                if flag.load(Ordering::Relaxed) {
                    Err(StorageError::Poisoned)
                } else {
                    Ok(())
                }
            },
        };
        let ws = Workspace::new(Store::new(repo), composer(), Outbox::default());
        seed(&ws);

        failing.store(true, Ordering::Relaxed);
        let sent = ws.post_comment(thread_of(&ws, "a@x"), "lgtm", None).unwrap();

        assert_eq!(sent.in_reply_to, "a@x");
        assert_eq!(ws.transport.0.lock().unwrap().len(), 1);
        assert!(
            ws.store()
                .repository()
                .find_by_identity(&sent.identity)
                .unwrap()
                .is_none()
        );
    }
}
